//! JSON-RPC 2.0 client for the storage API service.
//!
//! Method names and parameter shapes follow the storage service's RPC
//! surface: `snapshot_create`, `snapshot_list`, `snapshot_destroy`,
//! `snapshot_holds_list`, `snapshot_hold`, `snapshot_release`,
//! `migration_create`, `migration_get`. All calls POST to a single
//! endpoint; the service also exposes `GET /health` for reachability.

use super::{MigrationStatus, StorageApi};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": Uuid::new_v4().to_string(),
        });

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let envelope: RpcResponse = response.json().await?;
        if let Some(err) = envelope.error {
            return Err(BackupError::Api(format!(
                "{} failed: {} (code {})",
                method, err.message, err.code
            )));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }
}

/// The service wraps some results in an envelope object
/// (`{"snapshots": [...]}`); older versions return the bare array. Accept
/// both.
fn string_list(result: Value, key: &str) -> Vec<String> {
    let values = match result {
        Value::Array(values) => values,
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(values)) => values,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    values
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl StorageApi for RpcClient {
    async fn create_snapshot(&self, dataset: &str, name: &str) -> Result<()> {
        self.call(
            "snapshot_create",
            json!({ "dataset": dataset, "name": name, "recursive": false }),
        )
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let result = self
            .call("snapshot_list", json!({ "dataset": dataset }))
            .await?;
        Ok(string_list(result, "snapshots"))
    }

    async fn destroy_snapshot(&self, dataset: &str, snapshot: &str) -> Result<()> {
        self.call(
            "snapshot_destroy",
            json!({ "dataset": dataset, "snapshot": snapshot, "recursive": false }),
        )
        .await?;
        Ok(())
    }

    async fn list_holds(&self, dataset: &str, snapshot: &str) -> Result<Vec<String>> {
        let result = self
            .call(
                "snapshot_holds_list",
                json!({ "dataset": dataset, "snapshot": snapshot }),
            )
            .await?;
        Ok(string_list(result, "holds"))
    }

    async fn place_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        self.call(
            "snapshot_hold",
            json!({ "dataset": dataset, "snapshot": snapshot, "tag": tag, "recursive": false }),
        )
        .await?;
        Ok(())
    }

    async fn release_hold(&self, dataset: &str, snapshot: &str, tag: &str) -> Result<()> {
        self.call(
            "snapshot_release",
            json!({ "dataset": dataset, "snapshot": snapshot, "tag": tag, "recursive": false }),
        )
        .await?;
        Ok(())
    }

    async fn start_migration(
        &self,
        dataset: &str,
        snapshot: &str,
        remote_host: &str,
        remote_dataset: &str,
    ) -> Result<String> {
        let result = self
            .call(
                "migration_create",
                json!({
                    "source": format!("{}@{}", dataset, snapshot),
                    "destination": remote_dataset,
                    "remote": remote_host,
                    "recursive": true,
                }),
            )
            .await?;

        result
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BackupError::Api("migration_create returned no task_id".to_string())
            })
    }

    async fn poll_migration(&self, task_id: &str) -> Result<MigrationStatus> {
        let result = self
            .call("migration_get", json!({ "task_id": task_id }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn health_check(&self) -> bool {
        match self.http.get(format!("{}/health", self.url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MigrationState;

    #[test]
    fn test_string_list_accepts_envelope_and_bare_array() {
        let enveloped = json!({ "dataset": "tank/data", "snapshots": ["a", "b"] });
        assert_eq!(string_list(enveloped, "snapshots"), vec!["a", "b"]);

        let bare = json!(["a", "b"]);
        assert_eq!(string_list(bare, "snapshots"), vec!["a", "b"]);

        assert!(string_list(Value::Null, "snapshots").is_empty());
        assert!(string_list(json!({ "other": 1 }), "snapshots").is_empty());
    }

    #[test]
    fn test_migration_status_deserializes_lowercase() {
        let status: MigrationStatus =
            serde_json::from_value(json!({ "status": "running" })).unwrap();
        assert_eq!(status.status, MigrationState::Running);
        assert!(!status.status.is_terminal());

        let status: MigrationStatus = serde_json::from_value(
            json!({ "status": "failed", "error": "connection reset" }),
        )
        .unwrap();
        assert!(status.status.is_terminal());
        assert_eq!(status.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_rpc_error_envelope() {
        let envelope: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "error": { "code": -32000, "message": "dataset not found" },
            "id": "x",
        }))
        .unwrap();
        let err = envelope.error.unwrap();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "dataset not found");
    }
}
