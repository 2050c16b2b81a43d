//! The real Redis-backed transport: implements `Publisher` (outbox
//! dispatch), `StreamSource` (consumer read loop + DLQ admin), and
//! `CoordinatorBackend` (membership/assignment) against one pooled
//! `ConnectionManager`.
//!
//! Every trait method here is synchronous to match the rest of the crate's
//! worker threads; each blocks the calling thread on the async Redis call via
//! `block_in_place` + the owning Tokio runtime's handle, the same bridge
//! `PostgresLocalStore` uses for `sqlx`.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::consumer::{StreamMessage, StreamSource};
use crate::coordinator::{ConsumerId, CoordinatorBackend, Partition};
use crate::outbox::{PublishError, Publisher};

use super::scripts::ScriptCache;

pub struct RedisTransport {
    conn: tokio::sync::Mutex<ConnectionManager>,
    handle: Handle,
    #[allow(dead_code)]
    scripts: ScriptCache,
    lock_token: String,
}

impl RedisTransport {
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
            handle: Handle::current(),
            scripts: ScriptCache::default(),
            lock_token: Uuid::new_v4().to_string(),
        })
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
    }
}

impl Publisher for RedisTransport {
    fn publish(&self, stream_name: &str, outbox_id: Uuid, event_type: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            conn.xadd::<_, _, _, _, ()>(
                stream_name,
                "*",
                &[
                    ("outbox_id", outbox_id.to_string()),
                    ("type", event_type.to_string()),
                    ("payload", String::from_utf8_lossy(payload).to_string()),
                ],
            )
            .await
            .map_err(|e| PublishError(e.to_string()))
        })
    }
}

/// Branches on field presence rather than a shape discriminant: outbox-origin
/// messages carry `outbox_id`/`type`/`payload`; aggregate-origin broadcasts
/// (from a Command Transaction's `aggregateType`/day-partitioned XADDs)
/// carry only `event`. Anything matching neither shape is truly malformed.
fn parse_message(id: String, fields: BTreeMap<String, String>) -> Option<StreamMessage> {
    if let (Some(outbox_id), Some(event_type)) = (fields.get("outbox_id"), fields.get("type")) {
        let outbox_id = Uuid::parse_str(outbox_id).ok()?;
        let payload = fields.get("payload").cloned().unwrap_or_default().into_bytes();
        return Some(StreamMessage::Outbox { id, outbox_id, event_type: event_type.clone(), payload });
    }
    if let Some(event) = fields.get("event") {
        return Some(StreamMessage::AggregateEvent { id, event: event.clone().into_bytes() });
    }
    None
}

impl StreamSource for RedisTransport {
    fn ensure_group(&self, stream: &str, group: &str) {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let result: RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(group)
                .arg("$")
                .arg("MKSTREAM")
                .query_async(&mut *conn)
                .await;
            if let Err(e) = result {
                if !e.to_string().contains("BUSYGROUP") {
                    tracing::warn!(stream, group, error = %e, "failed to ensure consumer group");
                }
            }
        })
    }

    fn claim_own_pending(&self, stream: &str, group: &str, consumer: &str) -> Vec<StreamMessage> {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let claimed: RedisResult<redis::streams::StreamClaimReply> = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(group)
                .arg(consumer)
                .arg(0)
                .arg("-")
                .query_async(&mut *conn)
                .await;
            match claimed {
                Ok(reply) => reply
                    .ids
                    .into_iter()
                    .filter_map(|id| {
                        let fields: BTreeMap<String, String> = id
                            .map
                            .into_iter()
                            .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
                            .collect();
                        parse_message(id.id, fields)
                    })
                    .collect(),
                Err(e) => {
                    tracing::warn!(stream, group, error = %e, "failed to claim own pending entries");
                    Vec::new()
                }
            }
        })
    }

    fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        block: Duration,
        count: usize,
    ) -> Vec<(String, StreamMessage)> {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let ids = vec![">"; streams.len()];
            let reply: RedisResult<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("BLOCK")
                .arg(block.as_millis() as u64)
                .arg("COUNT")
                .arg(count)
                .arg("STREAMS")
                .arg(streams)
                .arg(ids)
                .query_async(&mut *conn)
                .await;

            match reply {
                Ok(reply) => reply
                    .keys
                    .into_iter()
                    .flat_map(|key_entry| {
                        let stream = key_entry.key.clone();
                        key_entry.ids.into_iter().filter_map(move |id| {
                            let fields: BTreeMap<String, String> = id
                                .map
                                .into_iter()
                                .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
                                .collect();
                            parse_message(id.id, fields).map(|m| (stream.clone(), m))
                        })
                    })
                    .collect(),
                Err(_) => Vec::new(),
            }
        })
    }

    fn ack(&self, stream: &str, group: &str, id: &str) {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<()> = conn.xack(stream, group, &[id]).await;
        })
    }

    fn delivery_count(&self, stream: &str, group: &str, id: &str) -> u32 {
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let reply: RedisResult<redis::streams::StreamPendingCountReply> = redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .arg(id)
                .arg(id)
                .arg(1)
                .query_async(&mut *conn)
                .await;
            reply
                .ok()
                .and_then(|r| r.ids.first().map(|e| e.times_delivered as u32))
                .unwrap_or(1)
        })
    }

    fn append_dlq(&self, stream: &str, message: &StreamMessage, error: &str) {
        let dlq_key = super::keys::dlq_stream(stream);
        let mut fields = vec![
            ("originalMessageId".to_string(), message.id().to_string()),
            ("originalStream".to_string(), stream.to_string()),
            ("error".to_string(), error.to_string()),
            ("timestamp".to_string(), Utc::now().to_rfc3339()),
        ];
        match message {
            StreamMessage::Outbox { outbox_id, payload, .. } => {
                fields.push(("outbox_id".to_string(), outbox_id.to_string()));
                fields.push(("event".to_string(), String::from_utf8_lossy(payload).to_string()));
            }
            StreamMessage::AggregateEvent { event, .. } => {
                fields.push(("event".to_string(), String::from_utf8_lossy(event).to_string()));
            }
        }
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<String> = conn.xadd(&dlq_key, "*", &fields).await;
        })
    }

    fn dlq_count(&self, stream: &str) -> u64 {
        let dlq_key = super::keys::dlq_stream(stream);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            conn.xlen(&dlq_key).await.unwrap_or(0)
        })
    }

    fn read_dlq(&self, stream: &str, n: usize) -> Vec<StreamMessage> {
        let dlq_key = super::keys::dlq_stream(stream);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let reply: RedisResult<redis::streams::StreamRangeReply> =
                conn.xrange_count(&dlq_key, "-", "+", n).await;
            reply
                .map(|r| {
                    r.ids
                        .into_iter()
                        .filter_map(|id| {
                            let fields: BTreeMap<String, String> = id
                                .map
                                .into_iter()
                                .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
                                .collect();
                            let event = fields.get("event").cloned().unwrap_or_default().into_bytes();
                            match fields.get("outbox_id") {
                                Some(raw) => {
                                    let outbox_id = Uuid::parse_str(raw).ok()?;
                                    Some(StreamMessage::Outbox {
                                        id: id.id,
                                        outbox_id,
                                        event_type: fields.get("originalStream").cloned().unwrap_or_default(),
                                        payload: event,
                                    })
                                }
                                None => Some(StreamMessage::AggregateEvent { id: id.id, event }),
                            }
                        })
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn delete_dlq(&self, stream: &str, id: &str) {
        let dlq_key = super::keys::dlq_stream(stream);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<u64> = conn.xdel(&dlq_key, &[id]).await;
        })
    }

    fn clear_dlq(&self, stream: &str) {
        let dlq_key = super::keys::dlq_stream(stream);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<()> = conn.del(&dlq_key).await;
        })
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

impl CoordinatorBackend for RedisTransport {
    fn record_heartbeat(&self, group: &str, consumer: &ConsumerId, at: DateTime<Utc>) {
        let key = super::keys::heartbeats_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<()> = conn.zadd(&key, consumer.as_str(), millis(at)).await;
        })
    }

    fn live_members(&self, group: &str, timeout: chrono::Duration, now: DateTime<Utc>) -> BTreeSet<ConsumerId> {
        let key = super::keys::heartbeats_key(group);
        let cutoff = millis(now - timeout);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let members: RedisResult<Vec<String>> = conn.zrangebyscore(&key, cutoff, "+inf").await;
            members.unwrap_or_default().into_iter().collect()
        })
    }

    fn read_assignment(&self, group: &str) -> BTreeMap<ConsumerId, BTreeSet<Partition>> {
        let key = super::keys::assignment_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let raw: RedisResult<BTreeMap<String, String>> = conn.hgetall(&key).await;
            raw.unwrap_or_default()
                .into_iter()
                .map(|(member, json)| {
                    let partitions: BTreeSet<Partition> = serde_json::from_str(&json).unwrap_or_default();
                    (member, partitions)
                })
                .collect()
        })
    }

    fn write_assignment(&self, group: &str, assignment: BTreeMap<ConsumerId, BTreeSet<Partition>>) {
        let key = super::keys::assignment_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<()> = conn.del(&key).await;
            for (member, partitions) in &assignment {
                let json = serde_json::to_string(partitions).unwrap_or_default();
                let _: RedisResult<()> = conn.hset(&key, member, json).await;
            }
        })
    }

    fn bump_generation(&self, group: &str) -> u64 {
        let key = super::keys::generation_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            conn.incr(&key, 1).await.unwrap_or(0)
        })
    }

    fn current_generation(&self, group: &str) -> u64 {
        let key = super::keys::generation_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let raw: RedisResult<Option<u64>> = conn.get(&key).await;
            raw.ok().flatten().unwrap_or(0)
        })
    }

    fn remove_member(&self, group: &str, consumer: &ConsumerId) {
        let heartbeats = super::keys::heartbeats_key(group);
        let assignment = super::keys::assignment_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let _: RedisResult<()> = conn.zrem(&heartbeats, consumer.as_str()).await;
            let _: RedisResult<()> = conn.hdel(&assignment, consumer.as_str()).await;
        })
    }

    fn try_acquire_lock(&self, group: &str) -> bool {
        let key = super::keys::lock_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            let result: RedisResult<Option<String>> = redis::cmd("SET")
                .arg(&key)
                .arg(&self.lock_token)
                .arg("NX")
                .arg("PX")
                .arg(5_000)
                .query_async(&mut *conn)
                .await;
            matches!(result, Ok(Some(_)))
        })
    }

    fn release_lock(&self, group: &str) {
        let key = super::keys::lock_key(group);
        self.block_on(async {
            let mut conn = self.conn.lock().await;
            // Only releases the lock if this instance still owns it, via the
            // compare-and-delete Lua idiom rather than a bare DEL.
            let script = redis::Script::new(
                r#"if redis.call("GET", KEYS[1]) == ARGV[1] then return redis.call("DEL", KEYS[1]) else return 0 end"#,
            );
            let _: RedisResult<i64> = script.key(&key).arg(&self.lock_token).invoke_async(&mut *conn).await;
        })
    }
}
