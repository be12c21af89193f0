//! Settlement engine configuration.
//!
//! Timing values are stored as milliseconds so the config can be layered from
//! files and environment variables; accessors hand out [`Duration`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SettlementError, SettlementResult};

/// Environment variable prefix for [`SettlementConfig::load`].
pub const ENV_PREFIX: &str = "SETTLEMENT";

/// The screens that host a settlement confirmation flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Crypto settle pages.
    CryptoSettlement,
    /// Bank-transfer payment modal.
    BankTransfer,
    /// Key-change / token reveal modal.
    KeyChange,
}

/// Configuration for one settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Delay between status checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Status checks allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Countdown label refresh cadence.
    #[serde(default = "default_tracker_refresh_ms")]
    pub tracker_refresh_ms: u64,

    /// Deadline for a single oracle call.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    /// How long a "copied" acknowledgement stays visible.
    #[serde(default = "default_copy_ack_ms")]
    pub copy_ack_ms: u64,

    /// Run the first check as soon as polling starts instead of after one interval.
    #[serde(default)]
    pub check_immediately: bool,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            tracker_refresh_ms: default_tracker_refresh_ms(),
            check_timeout_ms: default_check_timeout_ms(),
            copy_ack_ms: default_copy_ack_ms(),
            check_immediately: false,
            event_capacity: default_event_capacity(),
        }
    }
}

impl SettlementConfig {
    /// Preset tuned for one of the hosting screens.
    pub fn for_flow(flow: FlowKind) -> Self {
        let mut config = Self::default();

        match flow {
            FlowKind::CryptoSettlement => {}
            FlowKind::BankTransfer => {
                // Bank rails settle in minutes; poll more often over a longer window
                config.poll_interval_ms = 15_000;
                config.max_attempts = 40;
            }
            FlowKind::KeyChange => {
                // Tokens are minted right after payment lands
                config.poll_interval_ms = 5_000;
                config.check_immediately = true;
                config.copy_ack_ms = 1_500;
            }
        }

        config
    }

    /// Layer defaults, an optional file, and `SETTLEMENT_*` environment variables.
    pub fn load(path: Option<&str>) -> SettlementResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&SettlementConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder =
            builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> SettlementResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(SettlementError::InvalidConfig(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(SettlementError::InvalidConfig(
                "max_attempts must be greater than zero".into(),
            ));
        }
        if self.tracker_refresh_ms == 0 {
            return Err(SettlementError::InvalidConfig(
                "tracker_refresh_ms must be greater than zero".into(),
            ));
        }
        if self.check_timeout_ms == 0 {
            return Err(SettlementError::InvalidConfig(
                "check_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SettlementError::InvalidConfig(
                "event_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn tracker_refresh(&self) -> Duration {
        Duration::from_millis(self.tracker_refresh_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn copy_ack(&self) -> Duration {
        Duration::from_millis(self.copy_ack_ms)
    }

    /// Outer time budget implied by the attempt ceiling.
    pub fn polling_budget(&self) -> Duration {
        self.poll_interval() * self.max_attempts
    }
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    12
}

fn default_tracker_refresh_ms() -> u64 {
    1_000
}

fn default_check_timeout_ms() -> u64 {
    15_000
}

fn default_copy_ack_ms() -> u64 {
    2_000
}

fn default_event_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SettlementConfig::default();
        assert_eq!(config.max_attempts, 12);
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.polling_budget(), Duration::from_secs(360));
        assert!(!config.check_immediately);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flow_presets() {
        let bank = SettlementConfig::for_flow(FlowKind::BankTransfer);
        let key_change = SettlementConfig::for_flow(FlowKind::KeyChange);

        assert!(bank.polling_budget() > SettlementConfig::default().polling_budget());
        assert!(key_change.check_immediately);
        assert!(key_change.copy_ack() < SettlementConfig::default().copy_ack());
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let config = SettlementConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = SettlementConfig::load(Some("does-not-exist/settlement")).unwrap();
        assert_eq!(config.max_attempts, SettlementConfig::default().max_attempts);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: SettlementConfig =
            serde_json::from_str(r#"{ "max_attempts": 3, "check_immediately": true }"#).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert!(config.check_immediately);
        assert_eq!(config.poll_interval_ms, 30_000);
    }
}
