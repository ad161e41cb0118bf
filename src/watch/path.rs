//! Kubernetes collection paths accepted by `watch_subscribe`.
//!
//! Two shapes are understood:
//!
//! ```text
//! /api/<version>/[namespaces/<ns>/]<resource>           core group
//! /apis/<group>/<version>/[namespaces/<ns>/]<resource>  named group
//! ```
//!
//! A trailing slash and a query string are ignored. Anything else is rejected.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("unsupported watch path {0:?}")]
    Unsupported(String),
    #[error("watch path {0:?} has an empty segment")]
    EmptySegment(String),
}

/// A parsed collection path. `group` is empty for the core API group and
/// `namespace` is `None` for cluster-wide watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
}

impl ResourcePath {
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        let path = raw.split('?').next().unwrap_or_default();
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(PathError::EmptySegment(raw.to_string()));
        }

        let (group, rest) = match segments.as_slice() {
            ["api", rest @ ..] => ("", rest),
            ["apis", group, rest @ ..] => (*group, rest),
            _ => return Err(PathError::Unsupported(raw.to_string())),
        };

        let (version, namespace, resource) = match rest {
            [version, resource] => (*version, None, *resource),
            [version, "namespaces", ns, resource] => (*version, Some(*ns), *resource),
            _ => return Err(PathError::Unsupported(raw.to_string())),
        };

        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            namespace: namespace.map(ToString::to_string),
        })
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "/api/{}", self.version)?;
        } else {
            write!(f, "/apis/{}/{}", self.group, self.version)?;
        }
        if let Some(ns) = &self.namespace {
            write!(f, "/namespaces/{ns}")?;
        }
        write!(f, "/{}", self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_namespaced_path() {
        let p = ResourcePath::parse("/api/v1/namespaces/default/pods").unwrap();
        assert_eq!(
            p,
            ResourcePath {
                group: String::new(),
                version: "v1".into(),
                resource: "pods".into(),
                namespace: Some("default".into()),
            }
        );
        assert_eq!(p.api_version(), "v1");
    }

    #[test]
    fn test_named_group_cluster_wide_path() {
        let p = ResourcePath::parse("/apis/apps/v1/deployments").unwrap();
        assert_eq!(p.group, "apps");
        assert_eq!(p.version, "v1");
        assert_eq!(p.resource, "deployments");
        assert_eq!(p.namespace, None);
        assert_eq!(p.api_version(), "apps/v1");
    }

    #[test]
    fn test_namespaces_collection_itself() {
        let p = ResourcePath::parse("/api/v1/namespaces").unwrap();
        assert_eq!(p.resource, "namespaces");
        assert_eq!(p.namespace, None);
    }

    #[test]
    fn test_query_and_trailing_slash_ignored() {
        let p = ResourcePath::parse("/apis/batch/v1/namespaces/jobs-ns/jobs/?watch=1").unwrap();
        assert_eq!(p.namespace.as_deref(), Some("jobs-ns"));
        assert_eq!(p.to_string(), "/apis/batch/v1/namespaces/jobs-ns/jobs");
    }

    #[test]
    fn test_rejects_other_shapes() {
        for bad in [
            "",
            "/",
            "/healthz",
            "/api/v1",
            "/api/v1/namespaces/default",
            "/api/v1/namespaces/default/pods/web-0",
            "/apis/apps",
            "/apis/apps/v1/foo/bar/deployments",
            "/api//pods",
        ] {
            assert!(ResourcePath::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
