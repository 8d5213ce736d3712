//! Runtime tunables (§5, §7, §9, §10.3 of SPEC_FULL.md).
//!
//! Process bootstrap and full argument parsing are out of scope (§1); this
//! only specifies the values a host binary may want to override, mirroring
//! the handful of flags `tt_node` exposes via `clap` for its own node process.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Default UDP port the secure channel binds to.
pub const DEFAULT_PORT: u16 = 7878;

#[derive(Debug, Clone, Parser)]
#[command(name = "cardlink", about = "Secure smart-card-authenticated LAN chat node")]
pub struct Config {
    /// UDP port to bind the secure channel to.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Per-installation directory holding the challenge, wrapped key and
    /// encrypted database blob.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// How long a message may sit in `sent` without an ack before it is
    /// demoted back to `pending` and the session is torn down.
    #[arg(long, default_value = "500")]
    pub ack_timeout_ms: u64,

    /// How long a resumption attempt waits for `ReconnectResp` before giving
    /// up and falling back to a fresh handshake.
    #[arg(long, default_value = "100")]
    pub reconnect_deadline_ms: u64,

    /// Polling resolution of the reconnect-timeout scanner.
    #[arg(long, default_value = "100")]
    pub reconnect_scan_interval_ms: u64,

    /// Polling resolution of the ack-timeout scanner.
    #[arg(long, default_value = "500")]
    pub ack_scan_interval_ms: u64,

    /// Cooperative pause between consecutive messages during a pending-flush.
    #[arg(long, default_value = "200")]
    pub pending_flush_pace_ms: u64,

    /// If set, a session is torn down after this many consecutive `Msg`
    /// decryption failures. Unset (the default) matches the source behaviour
    /// of never tearing a session down on decrypt failure alone.
    #[arg(long)]
    pub max_consecutive_decrypt_failures: Option<u32>,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reconnect_deadline(&self) -> Duration {
        Duration::from_millis(self.reconnect_deadline_ms)
    }

    pub fn reconnect_scan_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_scan_interval_ms)
    }

    pub fn ack_scan_interval(&self) -> Duration {
        Duration::from_millis(self.ack_scan_interval_ms)
    }

    pub fn pending_flush_pace(&self) -> Duration {
        Duration::from_millis(self.pending_flush_pace_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            data_dir: None,
            ack_timeout_ms: 500,
            reconnect_deadline_ms: 100,
            reconnect_scan_interval_ms: 100,
            ack_scan_interval_ms: 500,
            pending_flush_pace_ms: 200,
            max_consecutive_decrypt_failures: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cardlink")
}
