use adt_core::protocol::AgentId;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("agent state file {} not found and no server url given", .path.display())]
    Missing { path: PathBuf },
    #[error("cannot access {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid agent state file {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },
}

/// Coordinator address and the id it assigned to this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    #[serde(rename = "serverURL")]
    pub server_url: String,
    /// Zero until the agent has registered.
    #[serde(default)]
    pub id: AgentId,
}

impl AgentState {
    pub fn load(path: &Path) -> Result<Self, StateFileError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StateFileError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(StateFileError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let state: AgentState =
            serde_json::from_str(&raw).map_err(|err| StateFileError::Invalid {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        state.validate(path)?;
        Ok(state)
    }

    /// Loads the file, falling back to a fresh unregistered state when it is
    /// missing and a server url was supplied. A supplied url overrides the
    /// stored one.
    pub fn load_or_init(path: &Path, server_url: Option<&str>) -> Result<Self, StateFileError> {
        let mut state = match (Self::load(path), server_url) {
            (Ok(state), _) => state,
            (Err(StateFileError::Missing { .. }), Some(url)) => AgentState {
                server_url: url.to_string(),
                id: 0,
            },
            (Err(err), _) => return Err(err),
        };
        if let Some(url) = server_url {
            state.server_url = url.to_string();
        }
        state.validate(path)?;
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<(), StateFileError> {
        let io_err = |source| StateFileError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_string_pretty(self).map_err(|err| StateFileError::Invalid {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn is_registered(&self) -> bool {
        self.id > 0
    }

    fn validate(&self, path: &Path) -> Result<(), StateFileError> {
        let invalid = |reason: String| StateFileError::Invalid {
            path: path.to_path_buf(),
            reason,
        };
        let url = Url::parse(&self.server_url)
            .map_err(|err| invalid(format!("serverURL {:?}: {err}", self.server_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "serverURL must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.id < 0 {
            return Err(invalid(format!("negative agent id {}", self.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_keeps_the_legacy_keys() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("agent.conf");
        let state = AgentState {
            server_url: "http://127.0.0.1:8080".to_string(),
            id: 42,
        };
        state.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["serverURL"], "http://127.0.0.1:8080");
        assert_eq!(value["id"], 42);
        assert_eq!(AgentState::load(&path).expect("load"), state);
    }

    #[test]
    fn missing_file_needs_a_server_url() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("agent.conf");
        assert!(matches!(
            AgentState::load_or_init(&path, None),
            Err(StateFileError::Missing { .. })
        ));

        let state = AgentState::load_or_init(&path, Some("http://c2.local:8080")).expect("init");
        assert_eq!(state.id, 0);
        assert!(!state.is_registered());
    }

    #[test]
    fn missing_id_defaults_to_unregistered() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("agent.conf");
        std::fs::write(&path, r#"{"serverURL":"https://c2.example:443"}"#).expect("write");
        let state = AgentState::load(&path).expect("load");
        assert_eq!(state.id, 0);
    }

    #[test]
    fn bad_server_url_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("agent.conf");
        std::fs::write(&path, r#"{"serverURL":"ftp://c2","id":3}"#).expect("write");
        assert!(matches!(
            AgentState::load(&path),
            Err(StateFileError::Invalid { .. })
        ));
    }
}
