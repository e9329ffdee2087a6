//! HTTP client for the remote TEE control API.
//!
//! The control plane only needs create/start/stop/delete/status/logs; the
//! attestation protocol stays on the remote side. Responses are parsed
//! fail-fast on shape drift.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::TeeError;

/// Connection settings for the control API.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TeeClientConfig {
    /// Control API base URL.
    pub endpoint: String,
    /// Bearer token; an empty token marks the backend unavailable.
    pub api_key: String,
}

impl TeeClientConfig {
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

/// Remote app state as reported by the control API.
#[derive(Debug, Clone, Deserialize)]
pub struct AppState {
    pub app_id: String,
    /// Native status vocabulary (`provisioning`, `running`, …).
    pub status: String,
    pub app_url: Option<String>,
}

/// The remote control API surface.
#[async_trait]
pub trait TeeControlApi: Send + Sync {
    async fn create_app(&self, name: &str, compose: &str) -> Result<AppState, TeeError>;
    async fn start_app(&self, app_id: &str) -> Result<(), TeeError>;
    async fn stop_app(&self, app_id: &str) -> Result<(), TeeError>;
    /// Idempotent: deleting an unknown app is a no-op remotely.
    async fn delete_app(&self, app_id: &str) -> Result<(), TeeError>;
    async fn app_status(&self, app_id: &str) -> Result<AppState, TeeError>;
    async fn app_logs(&self, app_id: &str, tail: Option<u32>) -> Result<String, TeeError>;
}

/// reqwest-backed control API client.
pub struct HttpTeeClient {
    config: TeeClientConfig,
    http: reqwest::Client,
}

impl HttpTeeClient {
    pub fn new(config: TeeClientConfig) -> Result<Self, TeeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TeeError::Request(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TeeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TeeError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn parse_app(response: reqwest::Response) -> Result<AppState, TeeError> {
        let response = Self::check(response).await?;
        response
            .json::<AppState>()
            .await
            .map_err(|e| TeeError::Parse(e.to_string()))
    }
}

#[async_trait]
impl TeeControlApi for HttpTeeClient {
    async fn create_app(&self, name: &str, compose: &str) -> Result<AppState, TeeError> {
        debug!(name, "creating tee app");
        let response = self
            .http
            .post(self.url("apps"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "name": name, "compose": compose }))
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        Self::parse_app(response).await
    }

    async fn start_app(&self, app_id: &str) -> Result<(), TeeError> {
        let response = self
            .http
            .post(self.url(&format!("apps/{app_id}/start")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn stop_app(&self, app_id: &str) -> Result<(), TeeError> {
        let response = self
            .http
            .post(self.url(&format!("apps/{app_id}/stop")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_app(&self, app_id: &str) -> Result<(), TeeError> {
        let response = self
            .http
            .delete(self.url(&format!("apps/{app_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        // 404 on delete means already gone: idempotent by contract.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn app_status(&self, app_id: &str) -> Result<AppState, TeeError> {
        let response = self
            .http
            .get(self.url(&format!("apps/{app_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        Self::parse_app(response).await
    }

    async fn app_logs(&self, app_id: &str, tail: Option<u32>) -> Result<String, TeeError> {
        let mut url = self.url(&format!("apps/{app_id}/logs"));
        if let Some(tail) = tail {
            url = format!("{url}?tail={tail}");
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))?;
        let response = Self::check(response).await?;
        response
            .text()
            .await
            .map_err(|e| TeeError::Request(e.to_string()))
    }
}
