use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::policy::{BufferPolicy, DurationBounds};

/// Runtime settings, read from `VISITCORE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub wal_file: String,
    /// Compact once this many events were appended since the last compaction.
    /// Zero disables the background compactor.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub policy: BufferPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_file: "visitcore.wal".into(),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            policy: BufferPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let p = d.policy;
        let parse = |key: &str, default| parsed(&lookup, key, default);

        let policy = BufferPolicy {
            visit_duration: DurationBounds::new(
                parse("VISITCORE_VISIT_MIN_MINUTES", p.visit_duration.min),
                parse("VISITCORE_VISIT_MAX_MINUTES", p.visit_duration.max),
            ),
            extended_duration: DurationBounds::new(
                parse("VISITCORE_EXTENDED_MIN_MINUTES", p.extended_duration.min),
                parse("VISITCORE_EXTENDED_MAX_MINUTES", p.extended_duration.max),
            ),
            transport_buffer: parsed(&lookup, "VISITCORE_TRANSPORT_BUFFER_MINUTES", p.transport_buffer),
            earliest_start: parsed(&lookup, "VISITCORE_EARLIEST_START_MINUTE", p.earliest_start),
            latest_start: parsed(&lookup, "VISITCORE_LATEST_START_MINUTE", p.latest_start),
            min_lead_time: parse("VISITCORE_MIN_LEAD_MINUTES", p.min_lead_time),
            cancellation_notice: parse("VISITCORE_CANCELLATION_NOTICE_MINUTES", p.cancellation_notice),
        };
        let policy = match policy.validate() {
            Ok(()) => policy,
            Err(reason) => {
                warn!(reason, "ignoring inconsistent scheduling policy; using defaults");
                p
            }
        };

        Self {
            data_dir: lookup("VISITCORE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            wal_file: lookup("VISITCORE_WAL_FILE").unwrap_or(d.wal_file),
            compact_threshold: parsed(&lookup, "VISITCORE_COMPACT_THRESHOLD", d.compact_threshold),
            compact_interval: Duration::from_secs(parsed(
                &lookup,
                "VISITCORE_COMPACT_INTERVAL_SECS",
                d.compact_interval.as_secs(),
            )),
            metrics_port: lookup("VISITCORE_METRICS_PORT").and_then(|s| s.parse().ok()),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "ignoring unparsable setting");
            default
        }),
    }
}
