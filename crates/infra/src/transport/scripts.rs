//! Lua scripts backing the Command and Projection transactions, and the
//! process-local hash cache that runs them. `redis::Script` already retries
//! `EVALSHA` against `EVAL` on a `NOSCRIPT` error internally, so wrapping it
//! here just gives every caller one place to hold the compiled scripts
//! rather than re-parsing the source on every invocation.

/// KEYS: none (all keys are derived from ARGV inside the script).
/// ARGV: `commandId`, then a JSON-encoded array of append operations, each
/// `{aggregateId, aggregateType, expectedVersion, eventBlob, snapshotBlob?}`,
/// then `dedupTtlSecs`, then today's UTC `yyyy-mm-dd` day fragment (computed
/// once by the caller so the whole transaction agrees on "today").
/// Returns the previously recorded result for a replayed `commandId`, or the
/// newly computed one, as a JSON string.
pub const COMMAND_TRANSACTION: &str = r#"
local command_key = "command:" .. ARGV[1]
local cached = redis.call("GET", command_key)
if cached then
    return cached
end

local ops = cjson.decode(ARGV[2])
local day = ARGV[4]
local results = {}

for i, op in ipairs(ops) do
    local stream_key = "events:" .. op.aggregateId
    local len = redis.call("XLEN", stream_key)
    if len ~= (op.expectedVersion - 1) then
        return cjson.encode({ error = "VersionMismatch", expected = op.expectedVersion, actual = len + 1 })
    end

    local version = op.expectedVersion
    redis.call("XADD", stream_key, "MAXLEN", "~", op.cap or 10000, version, "event", op.eventBlob)
    redis.call("XADD", "aggregateType:" .. op.aggregateType, "*", "event", op.eventBlob)
    redis.call("XADD", "events:" .. op.aggregateType .. ":" .. day, "*", "event", op.eventBlob)
    if op.countOrdinal then
        redis.call("INCR", "aggregateTypeCounter:" .. op.aggregateType)
    end
    if op.snapshotBlob then
        redis.call("SET", "snapshot:" .. op.aggregateType .. ":" .. op.aggregateId, op.snapshotBlob)
    end
    results[i] = { aggregateId = op.aggregateId, version = version }
end

local encoded = cjson.encode({ ok = true, results = results })
redis.call("SET", command_key, encoded, "EX", ARGV[3])
return encoded
"#;

/// KEYS: `[aggregateId]`. ARGV: `expectedVersion`, then a JSON-encoded
/// operation queue `[{kind, key, args...}]` with `kind` one of
/// `set|hset|hmset|sadd|lpush|zadd|del`.
pub const PROJECTION_TRANSACTION: &str = r#"
local aggregate_id = KEYS[1]
local expected_version = tonumber(ARGV[1])
local version_key = "projectionVersion:" .. aggregate_id

local current = redis.call("GET", version_key)
current = current and tonumber(current) or -1

if current ~= expected_version then
    return cjson.encode({ error = "VersionMismatch", expected = expected_version, actual = current })
end

local ops = cjson.decode(ARGV[2])
for _, op in ipairs(ops) do
    if op.kind == "set" then
        redis.call("SET", op.key, op.value)
    elseif op.kind == "hset" then
        redis.call("HSET", op.key, op.field, op.value)
    elseif op.kind == "hmset" then
        redis.call("HMSET", op.key, unpack(op.pairs))
    elseif op.kind == "sadd" then
        redis.call("SADD", op.key, op.member)
    elseif op.kind == "lpush" then
        redis.call("LPUSH", op.key, op.value)
    elseif op.kind == "zadd" then
        redis.call("ZADD", op.key, op.score, op.member)
    elseif op.kind == "del" then
        redis.call("DEL", op.key)
    end
end

redis.call("SET", version_key, expected_version + 1)
return cjson.encode({ ok = true, version = expected_version + 1 })
"#;

#[cfg(feature = "redis-transport")]
pub struct ScriptCache {
    pub command_tx: redis::Script,
    pub projection_tx: redis::Script,
}

#[cfg(feature = "redis-transport")]
impl Default for ScriptCache {
    fn default() -> Self {
        Self {
            command_tx: redis::Script::new(COMMAND_TRANSACTION),
            projection_tx: redis::Script::new(PROJECTION_TRANSACTION),
        }
    }
}
