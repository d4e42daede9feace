//! Compile-time capacities and runtime tunables.
//!
//! Capacities that size fixed tables and queues are `const`s; everything an
//! embedder may want to change per deployment lives in [`Options`], which can
//! be built in code or loaded from a TOML file.

use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::SwVersion;

/// Maximum concurrent connections the radio multiplexes on one link.
pub const MAX_CONNS: usize = 5;

/// Maximum SSID length accepted by the radio.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum access-point password length accepted by the radio.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Largest single data payload the radio accepts per send command.
pub const CONN_MAX_DATA_LEN: usize = 2048;

/// Depth of each netconn receive mailbox. One slot is always kept in reserve
/// for the close sentinel, so at most `RECEIVE_QUEUE_LEN - 1` data packets
/// are buffered.
pub const RECEIVE_QUEUE_LEN: usize = 32;

/// Depth of each listening netconn's accept mailbox.
pub const ACCEPT_QUEUE_LEN: usize = 5;

/// Depth of the producer command queue. API callers block while it is full.
pub const CMD_QUEUE_LEN: usize = 16;

/// Size of the UART receive ring between ingestion and the processor thread.
pub const RX_RING_SIZE: usize = 65536;

/// Longest AT response line the parser will accumulate before discarding.
pub const MAX_LINE_LEN: usize = 512;

/// Flash erase granularity on the radio side.
pub const FLASH_ERASE_ALIGN: u32 = 0x1000;

/// Flash write alignment for certificate partitions.
pub const FLASH_WRITE_ALIGN: u32 = 4;

/// Per-class command deadlines, milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub generic_ms: u64,
    pub join_ms: u64,
    pub connect_ms: u64,
    pub send_ms: u64,
    pub reset_ms: u64,
    pub restore_ms: u64,
    pub flash_ms: u64,
    pub ping_ms: u64,
    pub dns_ms: u64,
    pub scan_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            generic_ms: 1_000,
            join_ms: 30_000,
            connect_ms: 30_000,
            send_ms: 10_000,
            reset_ms: 5_000,
            restore_ms: 10_000,
            flash_ms: 5_000,
            ping_ms: 10_000,
            dns_ms: 20_000,
            scan_ms: 30_000,
        }
    }
}

impl Timeouts {
    #[inline]
    pub fn generic(&self) -> Duration {
        Duration::from_millis(self.generic_ms)
    }
}

/// Runtime driver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Baudrate the radio is probed at.
    pub baudrate: u32,
    /// When set, the link is raised to this rate after the probe succeeds.
    pub target_baudrate: Option<u32>,
    /// Pace receive windows explicitly instead of letting the radio push.
    pub manual_tcp_receive: bool,
    /// Period of the keep-alive tick delivered to event callbacks.
    /// `None` disables the tick.
    pub keepalive_interval_ms: Option<u64>,
    /// Oldest AT firmware version the driver accepts.
    pub min_at_version: SwVersion,
    pub timeouts: Timeouts,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            baudrate: 115_200,
            target_baudrate: None,
            manual_tcp_receive: false,
            keepalive_interval_ms: None,
            min_at_version: SwVersion::new(1, 2, 0),
            timeouts: Timeouts::default(),
        }
    }
}

impl Options {
    /// Load options from a TOML file on disk.
    pub fn from_toml_file(path: &str) -> Result<Options, String> {
        serdeconv::from_toml_file(path).map_err(|err| err.to_string())
    }

    /// Load options from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Options, String> {
        serdeconv::from_toml_str(toml).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let opts = Options::default();
        assert_eq!(opts.baudrate, 115_200);
        assert!(!opts.manual_tcp_receive);
        assert_eq!(opts.timeouts.join_ms, 30_000);
    }

    #[test]
    fn test_options_from_toml() {
        let opts = Options::from_toml_str(
            r#"
baudrate = 921600
manual_tcp_receive = true

[min_at_version]
major = 2
minor = 1
patch = 0

[timeouts]
generic_ms = 500
join_ms = 15000
connect_ms = 15000
send_ms = 5000
reset_ms = 2000
restore_ms = 4000
flash_ms = 3000
ping_ms = 4000
dns_ms = 8000
scan_ms = 10000
"#,
        )
        .unwrap();

        assert_eq!(opts.baudrate, 921_600);
        assert!(opts.manual_tcp_receive);
        assert_eq!(opts.timeouts.join_ms, 15_000);
        assert_eq!(opts.min_at_version, SwVersion::new(2, 1, 0));
    }

    #[test]
    fn test_bad_toml_rejected() {
        assert!(Options::from_toml_str("baudrate = \"fast\"").is_err());
    }

    #[test]
    fn test_receive_queue_reserves_close_slot() {
        // The netconn backpressure logic requires room for the close sentinel.
        assert!(RECEIVE_QUEUE_LEN >= 2);
        assert!(ACCEPT_QUEUE_LEN >= 2);
    }
}
