//! Transaction timer and stack configuration.
//!
//! RFC 3261 derives every transaction timer from three base values:
//!
//! | Timer | Value | Purpose |
//! |-------|-------|---------|
//! | A / E | T1, doubling (E capped at T2) | request retransmission |
//! | B / F | 64*T1 | client transaction timeout |
//! | D     | 32s unreliable, 0 reliable | absorb INVITE final response retransmissions |
//! | G     | T1, doubling, capped at T2 | INVITE final response retransmission |
//! | H     | 64*T1 | wait for ACK |
//! | I / K | T4 unreliable, 0 reliable | absorb ACK / response retransmissions |
//! | J     | 64*T1 unreliable, 0 reliable | absorb non-INVITE request retransmissions |
//! | L / M | 64*T1 | absorb retransmissions after a 2xx |
//!
//! Only the base values (plus Timer D and the automatic `100 Trying`
//! delay) are configurable; everything else is computed.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sipflow_infra_common::config::{duration_ms, from_toml_str, load_toml, millis};
use sipflow_infra_common::LoggingConfig;
use sipflow_sip_transport::TransportConfig;

use crate::error::{Error, Result};

pub const T1: Duration = millis(500);
pub const T2: Duration = millis(4_000);
pub const T4: Duration = millis(5_000);
pub const TIMER_D: Duration = millis(32_000);
pub const TIMER_1XX: Duration = millis(200);

/// Default capacity of the transaction layer output queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Base values of the RFC 3261 transaction timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// RTT estimate
    #[serde(rename = "t1_ms", with = "duration_ms")]
    pub t1: Duration,
    /// Maximum retransmission interval for non-INVITE requests and INVITE responses
    #[serde(rename = "t2_ms", with = "duration_ms")]
    pub t2: Duration,
    /// Maximum duration a message will remain in the network
    #[serde(rename = "t4_ms", with = "duration_ms")]
    pub t4: Duration,
    /// Wait time for response retransmissions after an INVITE failure
    #[serde(rename = "timer_d_ms", with = "duration_ms")]
    pub timer_d: Duration,
    /// Delay before a server INVITE transaction answers `100 Trying` by itself
    #[serde(rename = "timer_1xx_ms", with = "duration_ms")]
    pub timer_1xx: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            t1: T1,
            t2: T2,
            t4: T4,
            timer_d: TIMER_D,
            timer_1xx: TIMER_1XX,
        }
    }
}

impl TimerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.t1.is_zero() {
            return Err(Error::Config("t1 must be positive".to_string()));
        }
        if self.t2 < self.t1 {
            return Err(Error::Config(format!(
                "t2 ({:?}) must not be shorter than t1 ({:?})",
                self.t2, self.t1
            )));
        }
        Ok(())
    }

    pub fn timer_a(&self) -> Duration {
        self.t1
    }

    pub fn timer_b(&self) -> Duration {
        64 * self.t1
    }

    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.timer_d
        }
    }

    pub fn timer_e(&self) -> Duration {
        self.t1
    }

    pub fn timer_f(&self) -> Duration {
        64 * self.t1
    }

    pub fn timer_g(&self) -> Duration {
        self.t1
    }

    pub fn timer_h(&self) -> Duration {
        64 * self.t1
    }

    pub fn timer_i(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            64 * self.t1
        }
    }

    pub fn timer_k(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    pub fn timer_l(&self) -> Duration {
        64 * self.t1
    }

    pub fn timer_m(&self) -> Duration {
        64 * self.t1
    }
}

/// Settings of a [`TransactionLayer`](crate::TransactionLayer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub timers: TimerSettings,
    /// Capacity of the request, ACK, response and error queues
    pub queue_capacity: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            timers: TimerSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TransactionConfig {
    pub fn with_timers(mut self, timers: TimerSettings) -> Self {
        self.timers = timers;
        self
    }
}

/// Configuration of a whole stack, usually loaded from one TOML file:
///
/// ```toml
/// [logging]
/// level = "debug"
///
/// [transport]
/// host_ip = "192.0.2.1"
/// sock_ttl_ms = 600000
///
/// [transaction.timers]
/// t1_ms = 250
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub logging: LoggingConfig,
    pub transport: TransportConfig,
    pub transaction: TransactionConfig,
}

impl StackConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StackConfig = from_toml_str(text)?;
        config.transaction.timers.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: StackConfig = load_toml(path)?;
        config.transaction.timers.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc_defaults() {
        let timers = TimerSettings::default();
        assert_eq!(timers.timer_a(), Duration::from_millis(500));
        assert_eq!(timers.timer_b(), Duration::from_secs(32));
        assert_eq!(timers.timer_d(false), Duration::from_secs(32));
        assert_eq!(timers.timer_d(true), Duration::ZERO);
        assert_eq!(timers.timer_h(), Duration::from_secs(32));
        assert_eq!(timers.timer_i(false), Duration::from_secs(5));
        assert_eq!(timers.timer_j(true), Duration::ZERO);
        assert_eq!(timers.timer_k(false), Duration::from_secs(5));
        assert_eq!(timers.timer_m(), Duration::from_secs(32));
        assert!(timers.validate().is_ok());
    }

    #[test]
    fn test_stack_config_from_toml() {
        let config = StackConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"

            [transport]
            host_ip = "192.0.2.1"

            [transaction]
            queue_capacity = 16

            [transaction.timers]
            t1_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, tracing::Level::DEBUG);
        assert_eq!(config.transport.host_ip.to_string(), "192.0.2.1");
        assert_eq!(config.transaction.queue_capacity, 16);
        assert_eq!(config.transaction.timers.t1, Duration::from_millis(250));
        assert_eq!(config.transaction.timers.timer_b(), Duration::from_secs(16));
        assert_eq!(config.transaction.timers.t2, T2);
    }

    #[test]
    fn test_invalid_timers_rejected() {
        let err = StackConfig::from_toml_str("[transaction.timers]\nt1_ms = 5000\nt2_ms = 1000\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
