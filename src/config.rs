//! Runtime configuration.
//!
//! [`BleConfiguration`] is handed to [`CentralContext`](crate::CentralContext)
//! once at startup; per-scan options live in
//! [`ScanConfig`](crate::ble::scanner::ScanConfig).

use std::time::Duration;

/// Default delay applied when hardware scan batching is requested.
pub const DEFAULT_BATCH_REPORT_DELAY: Duration = Duration::from_millis(100);

/// Connection retry settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionConfig {
    /// Maximum connection attempts when maintaining a connection.
    pub max_reconnect_attempts: u32,
    /// Delay between attempts.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Subsystem-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BleConfiguration {
    /// Report delay used when a scan asks for hardware batching.
    pub batch_report_delay: Duration,
    /// Connection retry settings for every peripheral.
    pub connection: ConnectionConfig,
}

impl Default for BleConfiguration {
    fn default() -> Self {
        Self {
            batch_report_delay: DEFAULT_BATCH_REPORT_DELAY,
            connection: ConnectionConfig::default(),
        }
    }
}

impl BleConfiguration {
    /// Set the batched scan report delay.
    pub fn with_batch_report_delay(mut self, delay: Duration) -> Self {
        self.batch_report_delay = delay;
        self
    }

    /// Set the connection retry parameters.
    pub fn with_reconnect_params(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.connection = ConnectionConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_delay: delay,
        };
        self
    }
}
