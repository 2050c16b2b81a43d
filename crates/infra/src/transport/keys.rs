//! Pure key-layout functions for the Redis transport. No I/O here — keeping
//! these as free functions over plain strings/ints makes the layout
//! testable without a server and gives every caller (dispatcher, consumer,
//! coordinator) one place to agree on naming.

use chrono::{DateTime, Utc};

pub fn aggregate_stream(aggregate_id: &str) -> String {
    format!("events:{aggregate_id}")
}

pub fn aggregate_type_stream(aggregate_type: &str) -> String {
    format!("aggregateType:{aggregate_type}")
}

pub fn snapshot_key(aggregate_type: &str, aggregate_id: &str) -> String {
    format!("snapshot:{aggregate_type}:{aggregate_id}")
}

pub fn aggregate_type_counter(aggregate_type: &str) -> String {
    format!("aggregateTypeCounter:{aggregate_type}")
}

pub fn projection_version_key(aggregate_id: &str) -> String {
    format!("projectionVersion:{aggregate_id}")
}

pub fn outbox_partition_stream(stream_name: &str, partition: u32) -> String {
    format!("{stream_name}:{partition}")
}

/// `yyyy-mm-dd`, always in UTC, never the local timezone of whichever
/// process is running.
fn day_fragment(day: DateTime<Utc>) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// `events:{aggregateType}:{yyyy-mm-dd}`. Calendar-day partitioning is
/// always in UTC, never the local timezone of whichever process is running.
pub fn aggregate_type_day_stream(aggregate_type: &str, day: DateTime<Utc>) -> String {
    format!("events:{aggregate_type}:{}", day_fragment(day))
}

/// Today's day-partitioned stream for `aggregate_type` plus `lookback_days`
/// prior calendar days, newest first — the set a consumer subscribes to so
/// a message published just before midnight UTC is still picked up.
pub fn aggregate_type_day_streams(aggregate_type: &str, now: DateTime<Utc>, lookback_days: u32) -> Vec<String> {
    (0..=lookback_days)
        .map(|days_back| aggregate_type_day_stream(aggregate_type, now - chrono::Duration::days(days_back as i64)))
        .collect()
}

pub fn dlq_stream(stream: &str) -> String {
    format!("{stream}:dlq")
}

pub fn command_dedup_key(command_id: &str) -> String {
    format!("command:{command_id}")
}

pub fn heartbeats_key(group: &str) -> String {
    format!("heartbeats:{group}")
}

pub fn assignment_key(group: &str) -> String {
    format!("assignment:{group}")
}

pub fn generation_key(group: &str) -> String {
    format!("generation:{group}")
}

pub fn lock_key(group: &str) -> String {
    format!("lock:{group}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_stream_uses_utc_calendar_date() {
        let day = DateTime::parse_from_rfc3339("2026-07-26T23:59:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(aggregate_type_day_stream("order", day), "events:order:2026-07-26");
    }

    #[test]
    fn dlq_key_wraps_source_stream_name() {
        assert_eq!(dlq_stream("events:order:2026-07-26"), "events:order:2026-07-26:dlq");
    }

    #[test]
    fn day_streams_include_today_plus_lookback() {
        let now = DateTime::parse_from_rfc3339("2026-07-26T12:00:00Z").unwrap().with_timezone(&Utc);
        let streams = aggregate_type_day_streams("order", now, 2);
        assert_eq!(
            streams,
            vec![
                "events:order:2026-07-26",
                "events:order:2026-07-25",
                "events:order:2026-07-24",
            ]
        );
    }

    #[test]
    fn zero_lookback_is_just_today() {
        let now = DateTime::parse_from_rfc3339("2026-07-26T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(aggregate_type_day_streams("order", now, 0), vec!["events:order:2026-07-26"]);
    }
}
