//! Projection Transaction: an atomic, expected-version-guarded operation
//! queue against projection state keyed by `aggregateId`. Initial version is
//! the sentinel `-1`; the first successful commit moves it to `0`.

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::scripts::ScriptCache;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum ProjectionOp {
    #[serde(rename = "set")]
    Set { key: String, value: String },
    #[serde(rename = "hset")]
    HSet { key: String, field: String, value: String },
    #[serde(rename = "hmset")]
    HMSet { key: String, pairs: Vec<String> },
    #[serde(rename = "sadd")]
    SAdd { key: String, member: String },
    #[serde(rename = "lpush")]
    LPush { key: String, value: String },
    #[serde(rename = "zadd")]
    ZAdd { key: String, score: f64, member: String },
    #[serde(rename = "del")]
    Del { key: String },
}

#[derive(Debug, Deserialize)]
struct ScriptOutcome {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    expected: Option<i64>,
    #[serde(default)]
    actual: Option<i64>,
    #[serde(default)]
    version: Option<i64>,
}

#[derive(Debug, Error)]
pub enum ProjectionTxError {
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: i64, actual: i64 },
    /// `expectedVersion` must be set by the caller before `commit`.
    #[error("expected version was not set before commit")]
    PreconditionMissing,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed script response: {0}")]
    Malformed(String),
}

/// A single-op transaction is just a one-element `ops` slice; no special
/// casing is needed beyond what the script already does.
pub async fn run_projection_transaction(
    conn: &mut ConnectionManager,
    scripts: &ScriptCache,
    aggregate_id: &str,
    expected_version: Option<i64>,
    ops: &[ProjectionOp],
) -> Result<i64, ProjectionTxError> {
    let expected_version = expected_version.ok_or(ProjectionTxError::PreconditionMissing)?;
    let ops_json = serde_json::to_string(ops).map_err(|e| ProjectionTxError::Malformed(e.to_string()))?;

    let raw: String = scripts
        .projection_tx
        .key(aggregate_id)
        .arg(expected_version)
        .arg(ops_json)
        .invoke_async(conn)
        .await?;

    let outcome: ScriptOutcome =
        serde_json::from_str(&raw).map_err(|e| ProjectionTxError::Malformed(e.to_string()))?;
    if let Some(error) = outcome.error {
        if error == "VersionMismatch" {
            return Err(ProjectionTxError::VersionMismatch {
                expected: outcome.expected.unwrap_or(0),
                actual: outcome.actual.unwrap_or(0),
            });
        }
        return Err(ProjectionTxError::Malformed(error));
    }
    Ok(outcome.version.unwrap_or(expected_version + 1))
}
