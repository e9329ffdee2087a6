//! Provider gateway — HTTP boundary to the winning provider.
//!
//! After lease confirmation the manifest is delivered to the provider's own
//! endpoint, and the same endpoint is polled for lease status (service URIs)
//! and logs. Response shapes are parsed fail-fast like the chain boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;

/// Lease coordinates identifying one workload on a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRef {
    pub dseq: u64,
    pub gseq: u32,
    pub oseq: u32,
}

/// Interface to a provider's manifest/status endpoint.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Deliver the workload manifest for a confirmed lease.
    async fn send_manifest(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
        sdl: &str,
    ) -> Result<(), GatewayError>;

    /// Current service URIs for a lease, keyed by logical service name.
    async fn lease_status(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
    ) -> Result<BTreeMap<String, Vec<String>>, GatewayError>;

    /// Fetch workload logs for a lease.
    async fn lease_logs(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
        tail: Option<u32>,
        service: Option<&str>,
    ) -> Result<String, GatewayError>;
}

/// HTTP implementation of the provider gateway.
pub struct HttpProviderGateway {
    http: reqwest::Client,
}

impl HttpProviderGateway {
    pub fn new() -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        Ok(Self { http })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn send_manifest(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
        sdl: &str,
    ) -> Result<(), GatewayError> {
        let url = format!(
            "{provider_uri}/deployment/{}/manifest",
            lease.dseq
        );
        debug!(%url, "sending manifest to provider");
        let response = self
            .http
            .put(&url)
            .header("content-type", "application/yaml")
            .body(sdl.to_string())
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn lease_status(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
    ) -> Result<BTreeMap<String, Vec<String>>, GatewayError> {
        let url = format!(
            "{provider_uri}/lease/{}/{}/{}/status",
            lease.dseq, lease.gseq, lease.oseq
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        let response = Self::check(response).await?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Parse(format!("lease status is not JSON: {e}")))?;
        parse_lease_status(&value)
    }

    async fn lease_logs(
        &self,
        provider_uri: &str,
        lease: LeaseRef,
        tail: Option<u32>,
        service: Option<&str>,
    ) -> Result<String, GatewayError> {
        let mut url = format!(
            "{provider_uri}/lease/{}/{}/{}/logs",
            lease.dseq, lease.gseq, lease.oseq
        );
        let mut params = Vec::new();
        if let Some(tail) = tail {
            params.push(format!("tail={tail}"));
        }
        if let Some(service) = service {
            params.push(format!("service={service}"));
        }
        if !params.is_empty() {
            url = format!("{url}?{}", params.join("&"));
        }

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        let response = Self::check(response).await?;
        response
            .text()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))
    }
}

/// Parse a provider lease-status response into service name → URIs.
pub fn parse_lease_status(value: &Value) -> Result<BTreeMap<String, Vec<String>>, GatewayError> {
    let services = value
        .get("services")
        .and_then(Value::as_object)
        .ok_or_else(|| GatewayError::Parse("lease status: missing services object".to_string()))?;

    let mut urls = BTreeMap::new();
    for (name, service) in services {
        let uris = match service.get("uris") {
            Some(Value::Array(uris)) => uris
                .iter()
                .map(|u| {
                    u.as_str().map(str::to_string).ok_or_else(|| {
                        GatewayError::Parse(format!("lease status: non-string uri for {name}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            // A service with no ingress reports null or omits the field.
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(GatewayError::Parse(format!(
                    "lease status: uris for {name} is not an array"
                )));
            }
        };
        urls.insert(name.clone(), uris);
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_lease_status_collects_uris() {
        let value = json!({
            "services": {
                "web": {"uris": ["provider.example:8080"], "available": 1},
                "worker": {"uris": null, "available": 1}
            }
        });
        let urls = parse_lease_status(&value).unwrap();
        assert_eq!(urls["web"], vec!["provider.example:8080"]);
        assert!(urls["worker"].is_empty());
    }

    #[test]
    fn parse_lease_status_rejects_bad_shapes() {
        assert!(parse_lease_status(&json!({})).is_err());
        assert!(parse_lease_status(&json!({
            "services": {"web": {"uris": "not-an-array"}}
        }))
        .is_err());
        assert!(parse_lease_status(&json!({
            "services": {"web": {"uris": [42]}}
        }))
        .is_err());
    }
}
