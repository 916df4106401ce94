use adt_core::protocol::AgentId;
use adt_core::rest::{AgentRegisterResponse, MachineInfo};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("{url} answered {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("coordinator assigned an invalid agent id {0}")]
    InvalidId(AgentId),
}

/// Talks to the coordinator's REST surface before the command channel opens.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(server_url: &str) -> Result<Self, RegistrationError> {
        let base = Url::parse(server_url).map_err(|err| RegistrationError::InvalidUrl {
            url: server_url.to_string(),
            reason: err.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| RegistrationError::Request {
                url: server_url.to_string(),
                source,
            })?;
        Ok(Self { base, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RegistrationError> {
        api_url(&self.base, path)
    }

    pub async fn healthcheck(&self) -> Result<(), RegistrationError> {
        let url = self.endpoint("healthcheck")?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|source| RegistrationError::Request {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(RegistrationError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }

    pub async fn register(&self, machine: &MachineInfo) -> Result<AgentId, RegistrationError> {
        let url = self.endpoint("agents")?;
        let request_err = |source| RegistrationError::Request {
            url: url.to_string(),
            source,
        };
        let response = self
            .http
            .post(url.clone())
            .json(machine)
            .send()
            .await
            .map_err(request_err)?;
        if !response.status().is_success() {
            return Err(RegistrationError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let body: AgentRegisterResponse = response.json().await.map_err(request_err)?;
        if body.agent_id <= 0 {
            return Err(RegistrationError::InvalidId(body.agent_id));
        }
        Ok(body.agent_id)
    }
}

/// Resolves `path` under the coordinator's `/api/v1/` prefix, keeping any
/// path prefix already present in `base`.
pub fn api_url(base: &Url, path: &str) -> Result<Url, RegistrationError> {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let with_slash = format!("{}/", root.path());
        root.set_path(&with_slash);
    }
    root.join(&format!("api/v1/{path}"))
        .map_err(|err| RegistrationError::InvalidUrl {
            url: base.to_string(),
            reason: err.to_string(),
        })
}

/// WebSocket address of the command channel for `agent_id`.
pub fn ws_url(server_url: &str, agent_id: AgentId) -> Result<Url, RegistrationError> {
    let invalid = |reason: String| RegistrationError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let base = Url::parse(server_url).map_err(|err| invalid(err.to_string()))?;
    let mut url = api_url(&base, &format!("agents/{agent_id}/ws"))?;
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    Ok(url)
}
