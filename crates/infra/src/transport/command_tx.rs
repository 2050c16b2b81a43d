//! Command Transaction: one atomic append (or several) across aggregates,
//! guarded by per-aggregate `expectedVersion` and command-id idempotency.

use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::scripts::ScriptCache;

#[derive(Debug, Clone, Serialize)]
pub struct AppendOp {
    #[serde(rename = "aggregateId")]
    pub aggregate_id: String,
    #[serde(rename = "aggregateType")]
    pub aggregate_type: String,
    #[serde(rename = "expectedVersion")]
    pub expected_version: u64,
    #[serde(rename = "eventBlob")]
    pub event_blob: String,
    #[serde(rename = "snapshotBlob", skip_serializing_if = "Option::is_none")]
    pub snapshot_blob: Option<String>,
    #[serde(rename = "countOrdinal")]
    pub count_ordinal: bool,
    pub cap: u64,
}

#[derive(Debug, Deserialize)]
struct ScriptOutcome {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    expected: Option<u64>,
    #[serde(default)]
    actual: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CommandTxError {
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed script response: {0}")]
    Malformed(String),
}

/// `commandId` idempotency is handled inside the script: a replayed id
/// returns the cached result without re-running any append.
pub async fn run_command_transaction(
    conn: &mut ConnectionManager,
    scripts: &ScriptCache,
    command_id: &str,
    ops: &[AppendOp],
    dedup_ttl_secs: u64,
) -> Result<(), CommandTxError> {
    let ops_json = serde_json::to_string(ops).map_err(|e| CommandTxError::Malformed(e.to_string()))?;
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let raw: String = scripts
        .command_tx
        .arg(command_id)
        .arg(ops_json)
        .arg(dedup_ttl_secs)
        .arg(today)
        .invoke_async(conn)
        .await?;

    let outcome: ScriptOutcome =
        serde_json::from_str(&raw).map_err(|e| CommandTxError::Malformed(e.to_string()))?;
    if let Some(error) = outcome.error {
        if error == "VersionMismatch" {
            return Err(CommandTxError::VersionMismatch {
                expected: outcome.expected.unwrap_or(0),
                actual: outcome.actual.unwrap_or(0),
            });
        }
        return Err(CommandTxError::Malformed(error));
    }
    Ok(())
}
