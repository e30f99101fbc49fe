//! Buffer Configuration
//!
//! Sizing and durability knobs for a message buffer. Zero means "pick for
//! me" on the sizing fields:
//!
//! - **max_length**: total bytes across all segments; 0 = unlimited (no
//!   eviction)
//! - **segment_length**: bytes per segment file; 0 derives one thousandth of
//!   `max_length`, capped at 1 GiB and floored so the largest allowed
//!   payload still fits, or 100 MiB when `max_length` is unlimited. Smaller
//!   segments give the histogram finer grain but create more files.
//! - **max_payload_size**: enforced on append; 0 derives
//!   `segment_length - 2048`
//! - **auto_sync_interval**: how long after an append a checkpoint is forced
//!   at the latest; `Duration::ZERO` disables auto-sync
//! - **background_cleanup**: run eviction on a spawned task instead of the
//!   appending caller

use std::time::Duration;

use serde::{Deserialize, Serialize};

use loghouse_core::format::{RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use loghouse_core::{Error, Result};

/// Default segment size when nothing constrains it (100 MiB).
const DEFAULT_SEGMENT_LENGTH: u64 = 100 * 1024 * 1024;

/// Cap for auto-derived segment sizes (1 GiB).
const MAX_AUTO_SEGMENT_LENGTH: u64 = 1024 * 1024 * 1024;

/// Floor for auto-derived segment sizes.
const MIN_AUTO_SEGMENT_LENGTH: u64 = 2 * SEGMENT_HEADER_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Id assigned to the first message of an empty buffer.
    #[serde(default)]
    pub first_message_id: u64,

    /// Total buffer size cap in bytes; oldest segments are evicted past it.
    /// 0 = unlimited.
    #[serde(default)]
    pub max_length: u64,

    /// Bytes per segment file. 0 = derive from `max_length`.
    #[serde(default)]
    pub segment_length: u64,

    /// Maximum payload bytes accepted by append. 0 = derive from
    /// `segment_length`.
    #[serde(default)]
    pub max_payload_size: usize,

    /// A checkpoint runs this long after an append if none is pending.
    /// `Duration::ZERO` disables auto-sync.
    #[serde(default = "default_auto_sync_interval", with = "duration_ms")]
    pub auto_sync_interval: Duration,

    /// Run eviction on a spawned task instead of the appending caller.
    #[serde(default)]
    pub background_cleanup: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            first_message_id: 0,
            max_length: 0,
            segment_length: 0,
            max_payload_size: 0,
            auto_sync_interval: default_auto_sync_interval(),
            background_cleanup: false,
        }
    }
}

fn default_auto_sync_interval() -> Duration {
    Duration::from_millis(1000)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

impl BufferConfig {
    pub(crate) fn resolved_segment_length(&self) -> u64 {
        if self.segment_length != 0 {
            return self.segment_length;
        }
        if self.max_length == 0 {
            return DEFAULT_SEGMENT_LENGTH;
        }
        let floor = (self.max_payload_size as u64 + 2048).max(MIN_AUTO_SEGMENT_LENGTH);
        (self.max_length / 1000).clamp(floor, MAX_AUTO_SEGMENT_LENGTH.max(floor))
    }

    pub(crate) fn resolved_max_payload_size(&self) -> usize {
        if self.max_payload_size != 0 {
            self.max_payload_size
        } else {
            (self.resolved_segment_length() - 2048) as usize
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let segment_length = self.resolved_segment_length();
        if segment_length < SEGMENT_HEADER_SIZE + RECORD_HEADER_SIZE as u64 {
            return Err(Error::OutOfRange(format!(
                "segment length {segment_length} cannot hold the header and a record"
            )));
        }
        if segment_length > u32::MAX as u64 {
            return Err(Error::OutOfRange(format!(
                "segment length {segment_length} exceeds the format limit of {}",
                u32::MAX
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BufferConfig::default();
        assert_eq!(config.resolved_segment_length(), DEFAULT_SEGMENT_LENGTH);
        assert_eq!(
            config.resolved_max_payload_size(),
            (DEFAULT_SEGMENT_LENGTH - 2048) as usize
        );
        assert_eq!(config.auto_sync_interval, Duration::from_millis(1000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_segment_length_derived_from_max_length() {
        let config = BufferConfig {
            max_length: 1024 * 1024 * 1024,
            ..Default::default()
        };
        assert_eq!(config.resolved_segment_length(), 1024 * 1024 * 1024 / 1000);
    }

    #[test]
    fn test_derived_segment_length_is_floored() {
        let config = BufferConfig {
            max_length: 1_000_000, // /1000 would be under the floor
            ..Default::default()
        };
        assert_eq!(config.resolved_segment_length(), 2 * 4096);

        let config = BufferConfig {
            max_length: 1_000_000,
            max_payload_size: 64 * 1024,
            ..Default::default()
        };
        assert_eq!(config.resolved_segment_length(), 64 * 1024 + 2048);
    }

    #[test]
    fn test_derived_segment_length_is_capped() {
        let config = BufferConfig {
            max_length: 10 * 1024 * 1024 * 1024 * 1024, // 10 TiB
            ..Default::default()
        };
        assert_eq!(config.resolved_segment_length(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_explicit_values_win() {
        let config = BufferConfig {
            max_length: 1 << 40,
            segment_length: 4096 + 115,
            max_payload_size: 100,
            ..Default::default()
        };
        assert_eq!(config.resolved_segment_length(), 4211);
        assert_eq!(config.resolved_max_payload_size(), 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_tiny_segments() {
        let config = BufferConfig {
            segment_length: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip_with_interval_in_ms() {
        let config = BufferConfig {
            auto_sync_interval: Duration::from_millis(250),
            max_length: 12345,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"auto_sync_interval\":250"), "{json}");
        let back: BufferConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.auto_sync_interval, Duration::from_millis(250));
        assert_eq!(back.max_length, 12345);
    }

    #[test]
    fn test_serde_defaults_apply_to_missing_fields() {
        let back: BufferConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(back.auto_sync_interval, Duration::from_millis(1000));
        assert_eq!(back.max_length, 0);
        assert!(!back.background_cleanup);
    }
}
