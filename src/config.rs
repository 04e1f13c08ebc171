//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every connection a [`crate::node::Node`] creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hard cap on a declared payload length. A header claiming more than
    /// this is a framing error, torn down before any allocation happens.
    pub max_frame_size: usize,
    /// Hard cap on the declared header length.
    pub max_header_size: usize,
    /// How long to wait for the peer's hello before giving up on the attempt.
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,
    /// Silence on the inbound side longer than this triggers a probe ping.
    #[serde(with = "duration_millis")]
    pub keepalive_interval: Duration,
    /// No inbound traffic at all for this long tears the connection down.
    #[serde(with = "duration_millis")]
    pub keepalive_timeout: Duration,
    /// Dial timeout for outbound connections.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Capacity of a connection's outbound frame queue. Senders suspend
    /// once the queue is full and the writer has not drained it, which is
    /// what keeps a stalled peer from growing memory without bound.
    pub send_queue_depth: usize,
    /// Consecutive per-packet transform failures tolerated before the
    /// connection is torn down.
    pub transform_failure_threshold: u32,
    /// Attach a CRC-32 checksum option to every outbound frame and verify
    /// it on inbound frames that carry one.
    pub use_checksum: bool,
    /// How many successive ports to try when a listener bind with failover
    /// enabled finds its desired port taken.
    pub port_failover_range: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_header_size: 8 * 1024,
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            send_queue_depth: 128,
            transform_failure_threshold: 8,
            use_checksum: true,
            port_failover_range: 16,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_sane() {
        let cfg = Config::default();
        assert!(cfg.max_header_size < cfg.max_frame_size);
        assert!(cfg.keepalive_interval < cfg.keepalive_timeout);
        assert!(cfg.transform_failure_threshold > 0);
        assert!(cfg.send_queue_depth > 0);
    }

    #[test]
    fn roundtrips_through_json() {
        let cfg = Config {
            handshake_timeout: Duration::from_millis(1500),
            ..Config::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(back.max_frame_size, cfg.max_frame_size);
    }
}
