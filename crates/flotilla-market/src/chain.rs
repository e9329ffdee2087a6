//! Chain boundary — CLI invocation and fail-fast response parsing.
//!
//! The marketplace chain is an opaque collaborator: every interaction is
//! "run the chain binary, read JSON from stdout". Queries run under a 15s
//! timeout, transaction-class calls under 120s. Response shapes are parsed
//! fail-fast; a missing or malformed field is a `ChainError::Parse`, never a
//! silently defaulted value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::bids::Bid;
use crate::error::ChainError;

/// Timeout for chain state queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for transaction-class calls (broadcast + confirmation).
const TX_TIMEOUT: Duration = Duration::from_secs(120);

/// Opaque interface to the marketplace chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The caller's own account address.
    async fn account_address(&self) -> Result<String, ChainError>;

    /// Submit a deployment-create transaction. Returns the confirmed tx
    /// response; the assigned dseq is recovered with [`parse_dseq`].
    async fn create_deployment(&self, sdl: &str, deposit: u64) -> Result<Value, ChainError>;

    /// List open bids against a deployment.
    async fn list_bids(&self, owner: &str, dseq: u64) -> Result<Vec<Bid>, ChainError>;

    /// Submit a lease-create transaction for the selected bid.
    async fn create_lease(
        &self,
        owner: &str,
        dseq: u64,
        gseq: u32,
        oseq: u32,
        provider: &str,
    ) -> Result<(), ChainError>;

    /// Submit a deployment-close transaction.
    async fn close_deployment(&self, owner: &str, dseq: u64) -> Result<(), ChainError>;

    /// Resolve a provider id to its gateway host URI.
    async fn provider_uri(&self, provider: &str) -> Result<String, ChainError>;
}

/// Chain connection settings for the CLI client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChainConfig {
    /// Path to the chain CLI binary.
    pub binary: String,
    /// RPC node URL.
    pub node: String,
    pub chain_id: String,
    pub keyring_backend: String,
    /// Key name used to sign transactions.
    pub key_name: String,
    /// Price/deposit denomination.
    pub denom: String,
}

/// `ChainClient` backed by the chain's CLI binary.
pub struct CliChainClient {
    config: ChainConfig,
    /// Distinguishes concurrent manifest temp files.
    manifest_counter: AtomicU64,
}

impl CliChainClient {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            manifest_counter: AtomicU64::new(0),
        }
    }

    /// Run the chain binary with the given args and parse stdout as JSON.
    async fn run(
        &self,
        what: &'static str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Value, ChainError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .arg("--node")
            .arg(&self.config.node)
            .arg("--output")
            .arg("json");
        debug!(what, ?cmd, "invoking chain cli");

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ChainError::Timeout {
                what,
                secs: timeout.as_secs(),
            })?
            .map_err(|e| ChainError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(ChainError::Cli {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(&stdout)
            .map_err(|e| ChainError::Parse(format!("{what}: stdout is not JSON: {e}")))
    }

    /// Flags common to every signed transaction.
    fn tx_flags(&self) -> Vec<String> {
        vec![
            "--from".into(),
            self.config.key_name.clone(),
            "--chain-id".into(),
            self.config.chain_id.clone(),
            "--keyring-backend".into(),
            self.config.keyring_backend.clone(),
            "--broadcast-mode".into(),
            "block".into(),
            "--yes".into(),
        ]
    }
}

#[async_trait]
impl ChainClient for CliChainClient {
    async fn account_address(&self) -> Result<String, ChainError> {
        let value = self
            .run(
                "keys show",
                &[
                    "keys",
                    "show",
                    &self.config.key_name,
                    "--keyring-backend",
                    &self.config.keyring_backend,
                ],
                QUERY_TIMEOUT,
            )
            .await?;
        value
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::Parse("keys show: missing address field".to_string()))
    }

    async fn create_deployment(&self, sdl: &str, deposit: u64) -> Result<Value, ChainError> {
        // The CLI takes the manifest as a file path.
        let nonce = self.manifest_counter.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "flotilla-sdl-{}-{nonce}.yaml",
            std::process::id()
        ));
        tokio::fs::write(&path, sdl)
            .await
            .map_err(|e| ChainError::Spawn(format!("write sdl temp file: {e}")))?;

        let deposit_arg = format!("{deposit}{}", self.config.denom);
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec![
            "tx",
            "deployment",
            "create",
            path_str.as_str(),
            "--deposit",
            deposit_arg.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        args.extend(self.tx_flags());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.run("deployment create", &arg_refs, TX_TIMEOUT).await;
        let _ = tokio::fs::remove_file(&path).await;
        result
    }

    async fn list_bids(&self, owner: &str, dseq: u64) -> Result<Vec<Bid>, ChainError> {
        let dseq_arg = dseq.to_string();
        let value = self
            .run(
                "bid list",
                &[
                    "query", "market", "bid", "list", "--owner", owner, "--dseq", &dseq_arg,
                    "--state", "open",
                ],
                QUERY_TIMEOUT,
            )
            .await?;
        parse_bids(&value)
    }

    async fn create_lease(
        &self,
        owner: &str,
        dseq: u64,
        gseq: u32,
        oseq: u32,
        provider: &str,
    ) -> Result<(), ChainError> {
        let dseq_arg = dseq.to_string();
        let gseq_arg = gseq.to_string();
        let oseq_arg = oseq.to_string();
        let mut args = vec![
            "tx", "market", "lease", "create", "--owner", owner, "--dseq", &dseq_arg, "--gseq",
            &gseq_arg, "--oseq", &oseq_arg, "--provider", provider,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        args.extend(self.tx_flags());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("lease create", &arg_refs, TX_TIMEOUT).await?;
        Ok(())
    }

    async fn close_deployment(&self, owner: &str, dseq: u64) -> Result<(), ChainError> {
        let dseq_arg = dseq.to_string();
        let mut args = vec![
            "tx",
            "deployment",
            "close",
            "--owner",
            owner,
            "--dseq",
            &dseq_arg,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        args.extend(self.tx_flags());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("deployment close", &arg_refs, TX_TIMEOUT).await?;
        Ok(())
    }

    async fn provider_uri(&self, provider: &str) -> Result<String, ChainError> {
        let value = self
            .run(
                "provider get",
                &["query", "provider", "get", provider],
                QUERY_TIMEOUT,
            )
            .await?;
        value
            .get("host_uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ChainError::Parse("provider get: missing host_uri field".to_string()))
    }
}

/// Recover the assigned dseq from a confirmed deployment-create response.
///
/// The chain reports it as a string attribute inside the tx events. A
/// non-numeric or non-positive value is a hard failure upstream, so this
/// returns `None` for anything that does not parse to a positive integer.
pub fn parse_dseq(tx: &Value) -> Option<u64> {
    fn from_attributes(events: &Value) -> Option<u64> {
        for event in events.as_array()? {
            for attr in event.get("attributes")?.as_array()? {
                if attr.get("key").and_then(Value::as_str) == Some("dseq") {
                    let raw = attr.get("value").and_then(Value::as_str)?;
                    return raw.parse::<u64>().ok().filter(|d| *d > 0);
                }
            }
        }
        None
    }

    // Confirmed txs carry events under logs[].events; some chains also
    // surface a flattened top-level events list.
    if let Some(logs) = tx.get("logs").and_then(Value::as_array) {
        for log in logs {
            if let Some(events) = log.get("events") {
                if let Some(dseq) = from_attributes(events) {
                    return Some(dseq);
                }
            }
        }
    }
    tx.get("events").and_then(from_attributes)
}

/// Parse the bid-list query response into bids, fail-fast on shape drift.
pub fn parse_bids(value: &Value) -> Result<Vec<Bid>, ChainError> {
    let entries = value
        .get("bids")
        .and_then(Value::as_array)
        .ok_or_else(|| ChainError::Parse("bid list: missing bids array".to_string()))?;

    let mut bids = Vec::with_capacity(entries.len());
    for entry in entries {
        let bid = entry
            .get("bid")
            .ok_or_else(|| ChainError::Parse("bid list: entry missing bid object".to_string()))?;
        let id = bid
            .get("bid_id")
            .ok_or_else(|| ChainError::Parse("bid list: bid missing bid_id".to_string()))?;

        let provider = id
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Parse("bid list: bid_id missing provider".to_string()))?;
        let gseq = id
            .get("gseq")
            .and_then(Value::as_u64)
            .ok_or_else(|| ChainError::Parse("bid list: bid_id missing gseq".to_string()))?;
        let oseq = id
            .get("oseq")
            .and_then(Value::as_u64)
            .ok_or_else(|| ChainError::Parse("bid list: bid_id missing oseq".to_string()))?;

        let price = bid
            .get("price")
            .ok_or_else(|| ChainError::Parse("bid list: bid missing price".to_string()))?;
        // Amounts arrive as strings; parse failures are handled at selection
        // time so one bad bid cannot sink the whole listing.
        let amount = price
            .get("amount")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Parse("bid list: price missing amount".to_string()))?;
        let denom = price
            .get("denom")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Parse("bid list: price missing denom".to_string()))?;

        bids.push(Bid {
            provider: provider.to_string(),
            gseq: gseq as u32,
            oseq: oseq as u32,
            price_amount: amount.to_string(),
            price_denom: denom.to_string(),
        });
    }
    Ok(bids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_dseq_from_logs_events() {
        let tx = json!({
            "logs": [{
                "events": [
                    {"type": "message", "attributes": [{"key": "action", "value": "create"}]},
                    {"type": "deployment.v1", "attributes": [{"key": "dseq", "value": "123456"}]}
                ]
            }]
        });
        assert_eq!(parse_dseq(&tx), Some(123456));
    }

    #[test]
    fn parse_dseq_from_flat_events() {
        let tx = json!({
            "events": [{"attributes": [{"key": "dseq", "value": "42"}]}]
        });
        assert_eq!(parse_dseq(&tx), Some(42));
    }

    #[test]
    fn parse_dseq_rejects_non_numeric_and_non_positive() {
        let non_numeric = json!({
            "events": [{"attributes": [{"key": "dseq", "value": "abc"}]}]
        });
        assert_eq!(parse_dseq(&non_numeric), None);

        let zero = json!({
            "events": [{"attributes": [{"key": "dseq", "value": "0"}]}]
        });
        assert_eq!(parse_dseq(&zero), None);

        let absent = json!({"logs": []});
        assert_eq!(parse_dseq(&absent), None);
    }

    #[test]
    fn parse_bids_happy_path() {
        let value = json!({
            "bids": [{
                "bid": {
                    "bid_id": {"provider": "provider1", "gseq": 1, "oseq": 1},
                    "price": {"amount": "1.5", "denom": "uakt"}
                }
            }]
        });
        let bids = parse_bids(&value).unwrap();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].provider, "provider1");
        assert_eq!(bids[0].price_amount, "1.5");
    }

    #[test]
    fn parse_bids_fails_fast_on_missing_fields() {
        let missing_array = json!({"pagination": {}});
        assert!(parse_bids(&missing_array).is_err());

        let missing_price = json!({
            "bids": [{"bid": {"bid_id": {"provider": "p", "gseq": 1, "oseq": 1}}}]
        });
        assert!(parse_bids(&missing_price).is_err());
    }

    #[test]
    fn parse_bids_empty_list_is_ok() {
        let value = json!({"bids": []});
        assert!(parse_bids(&value).unwrap().is_empty());
    }
}
