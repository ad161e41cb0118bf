//! Agent identity: a one-time bootstrap token before registration, a cluster
//! id plus permanent token after.
//!
//! When `agent.credentials_file` is set, the registered identity is written
//! there as JSON so a restarted agent never re-presents a spent bootstrap
//! token.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AgentConfig;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to access credentials file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid credentials file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no bootstrap token or registered identity available")]
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Only the one-time token is known; registration is still due.
    Unregistered { bootstrap_token: String },
    /// Registered identity. Presented on every stream open.
    Registered { cluster_id: String, token: String },
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    cluster_id: String,
    token: String,
}

impl Credentials {
    /// Resolve the identity to start with: explicit config first, then the
    /// credentials file, then the bootstrap token.
    pub async fn resolve(agent: &AgentConfig) -> Result<Self, CredentialError> {
        if let (Some(cluster_id), Some(token)) = (&agent.cluster_id, &agent.token) {
            return Ok(Self::Registered {
                cluster_id: cluster_id.clone(),
                token: token.clone(),
            });
        }
        if let Some(path) = &agent.credentials_file {
            if let Some(stored) = Self::load(Path::new(path)).await? {
                info!(path = %path, "Using stored agent credentials");
                return Ok(stored);
            }
        }
        match &agent.bootstrap_token {
            Some(bootstrap_token) => Ok(Self::Unregistered {
                bootstrap_token: bootstrap_token.clone(),
            }),
            None => Err(CredentialError::Missing),
        }
    }

    /// Read a stored identity. A missing file is `Ok(None)`.
    pub async fn load(path: &Path) -> Result<Option<Self>, CredentialError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CredentialError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let stored: StoredCredentials =
            serde_json::from_slice(&content).map_err(|source| CredentialError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(Self::Registered {
            cluster_id: stored.cluster_id,
            token: stored.token,
        }))
    }

    /// Persist a registered identity. No-op for unregistered credentials.
    pub async fn save(&self, path: &Path) -> Result<(), CredentialError> {
        let Self::Registered { cluster_id, token } = self else {
            return Ok(());
        };
        let stored = StoredCredentials {
            cluster_id: cluster_id.clone(),
            token: token.clone(),
        };
        let json = serde_json::to_vec_pretty(&stored).map_err(|source| CredentialError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let io_err = |source| CredentialError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }

    pub fn cluster_id(&self) -> Option<&str> {
        match self {
            Self::Registered { cluster_id, .. } => Some(cluster_id),
            Self::Unregistered { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("kubetunnel-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn test_resolve_prefers_explicit_identity() {
        let agent = AgentConfig {
            bootstrap_token: Some("once".into()),
            cluster_id: Some("c-1".into()),
            token: Some("perm".into()),
            ..AgentConfig::default()
        };
        assert_eq!(
            Credentials::resolve(&agent).await.unwrap(),
            Credentials::Registered {
                cluster_id: "c-1".into(),
                token: "perm".into()
            }
        );
    }

    #[tokio::test]
    async fn test_save_then_resolve_skips_bootstrap() {
        let path = temp_path("creds.json");
        let creds = Credentials::Registered {
            cluster_id: "c-9".into(),
            token: "perm-9".into(),
        };
        creds.save(&path).await.unwrap();

        let agent = AgentConfig {
            bootstrap_token: Some("spent".into()),
            credentials_file: Some(path.to_string_lossy().into_owned()),
            ..AgentConfig::default()
        };
        assert_eq!(Credentials::resolve(&agent).await.unwrap(), creds);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_bootstrap() {
        let agent = AgentConfig {
            bootstrap_token: Some("once".into()),
            credentials_file: Some(temp_path("absent.json").to_string_lossy().into_owned()),
            ..AgentConfig::default()
        };
        assert_eq!(
            Credentials::resolve(&agent).await.unwrap(),
            Credentials::Unregistered {
                bootstrap_token: "once".into()
            }
        );
        assert!(matches!(
            Credentials::resolve(&AgentConfig::default()).await,
            Err(CredentialError::Missing)
        ));
    }
}
