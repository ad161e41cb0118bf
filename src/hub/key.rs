//! Fan-out routing key.
//!
//! Each field is written as `<byte length>:<bytes>` and fields are joined
//! with `|`. Because every field announces its own length, no character in a
//! cluster, resource or namespace name can be mistaken for a separator, so
//! distinct tuples never share a key.

use std::fmt;

/// Canonical `(cluster, resource, namespace)` routing key. An empty namespace
/// means "all namespaces".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(cluster: &str, resource: &str, namespace: &str) -> Self {
        let mut key = String::with_capacity(cluster.len() + resource.len() + namespace.len() + 12);
        for (i, field) in [cluster, resource, namespace].into_iter().enumerate() {
            if i > 0 {
                key.push('|');
            }
            key.push_str(&field.len().to_string());
            key.push(':');
            key.push_str(field);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
