//! Engine configuration.
//!
//! Configuration can be built programmatically with the `with_*`
//! methods or loaded from a TOML file. Every tuning knob has a default
//! chosen for interactive sessions on flaky mobile networks.

use std::path::Path;
use std::time::Duration;

use handover_core::{ReconnectPolicy, DEFAULT_HANDOFF_TTL};
use handover_types::{Platform, SyncError};
use serde::Deserialize;

/// Configuration for the session engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Address of the sync endpoint.
    pub endpoint: String,
    /// Human-readable device name shown to other devices.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Platform reported in the device record.
    #[serde(default = "default_platform")]
    pub platform: Platform,

    /// Debounce window for local writes in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Whether writes sync automatically after the debounce window.
    /// When false, nothing leaves the device until `flush()`.
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long to wait for a heartbeat ack before declaring the
    /// connection dead. Must exceed the interval.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Base reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Cap on the reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Reconnect attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Timeout for the initial dial in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Lifetime of issued handoff tokens in milliseconds.
    #[serde(default = "default_handoff_token_ttl_ms")]
    pub handoff_token_ttl_ms: u64,
    /// Timeout for redeeming a handoff payload in milliseconds.
    #[serde(default = "default_handoff_redeem_timeout_ms")]
    pub handoff_redeem_timeout_ms: u64,

    /// Whether destroy() flushes pending writes before tearing down.
    #[serde(default = "default_flush_on_destroy")]
    pub flush_on_destroy: bool,
}

impl EngineConfig {
    /// Create a configuration for the given endpoint, defaults elsewhere.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            device_name: default_device_name(),
            platform: default_platform(),
            debounce_ms: default_debounce_ms(),
            auto_sync: default_auto_sync(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handoff_token_ttl_ms: default_handoff_token_ttl_ms(),
            handoff_redeem_timeout_ms: default_handoff_redeem_timeout_ms(),
            flush_on_destroy: default_flush_on_destroy(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::Internal(format!("read config: {}", e)))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| SyncError::Internal(format!("parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.endpoint.is_empty() {
            return Err(SyncError::Internal("endpoint must not be empty".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(SyncError::Internal(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(SyncError::Internal(
                "reconnect_max_delay_ms must be at least reconnect_base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the reported platform.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the write debounce window.
    pub fn with_debounce_ms(mut self, millis: u64) -> Self {
        self.debounce_ms = millis;
        self
    }

    /// Enable or disable automatic sync of debounced writes.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Set heartbeat interval and timeout together.
    pub fn with_heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    /// Set the reconnect backoff parameters.
    pub fn with_reconnect(mut self, base_ms: u64, max_ms: u64, attempts: u32) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the handoff token lifetime.
    pub fn with_handoff_ttl_ms(mut self, millis: u64) -> Self {
        self.handoff_token_ttl_ms = millis;
        self
    }

    /// Set the handoff redemption timeout.
    pub fn with_handoff_redeem_timeout_ms(mut self, millis: u64) -> Self {
        self.handoff_redeem_timeout_ms = millis;
        self
    }

    /// Set the destroy-time flush policy.
    pub fn with_flush_on_destroy(mut self, flush: bool) -> Self {
        self.flush_on_destroy = flush;
        self
    }

    /// The reconnect policy derived from the delay fields.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

// Default value functions

fn default_device_name() -> String {
    "handover device".to_string()
}

fn default_platform() -> Platform {
    Platform::Other
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_auto_sync() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    15_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    8
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_handoff_token_ttl_ms() -> u64 {
    DEFAULT_HANDOFF_TTL
}

fn default_handoff_redeem_timeout_ms() -> u64 {
    10_000
}

fn default_flush_on_destroy() -> bool {
    true
}
