//! # Connection Configuration
//!
//! All tunables of a connection in one structure, with defaults that match
//! common daemon expectations and a builder that rejects nonsensical
//! values before any I/O happens.
//!
//! | option | default | effect |
//! |---|---|---|
//! | `method_call_timeout` | 30 s | per-pending-call deadline |
//! | `connect_timeout` | 10 s | socket + SASL + Hello bound |
//! | `read_timeout` | 60 s | stall bound while mid-frame |
//! | `write_timeout` | 10 s | per-write flush bound |
//! | `health_check_enabled` | on | periodic Ping probe |
//! | `health_check_interval` | 30 s | probe period |
//! | `health_check_timeout` | 5 s | per-probe bound |
//! | `auto_reconnect_enabled` | on | reconnect on drop |
//! | `reconnect_initial_delay` | 1 s | first backoff |
//! | `reconnect_max_delay` | 5 min | backoff cap |
//! | `reconnect_backoff_multiplier` | 2.0 | growth factor (≥ 1.0) |
//! | `max_reconnect_attempts` | 10 | 0 means unlimited |
//! | `close_timeout` | 5 s | drain bound on close |

use std::time::Duration;

use crate::error::{Error, Result};

/// Validated connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub method_call_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub auto_reconnect_enabled: bool,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_backoff_multiplier: f64,
    /// 0 means unlimited attempts.
    pub max_reconnect_attempts: u32,
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            method_call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            health_check_enabled: true,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            auto_reconnect_enabled: true,
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(300),
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_attempts: 10,
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Check the cross-field rules. The builder calls this; direct struct
    /// updates can re-run it.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("method_call_timeout", self.method_call_timeout),
            ("connect_timeout", self.connect_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("health_check_interval", self.health_check_interval),
            ("health_check_timeout", self.health_check_timeout),
            ("reconnect_initial_delay", self.reconnect_initial_delay),
            ("reconnect_max_delay", self.reconnect_max_delay),
            ("close_timeout", self.close_timeout),
        ];
        for (name, duration) in positive {
            if duration.is_zero() {
                return Err(Error::Config(format!("{name} must be strictly positive")));
            }
        }
        if !(self.reconnect_backoff_multiplier >= 1.0) {
            return Err(Error::Config(
                "reconnect_backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(Error::Config(
                "reconnect_initial_delay must not exceed reconnect_max_delay".into(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`ConnectionConfig`].
#[derive(Debug, Default, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

macro_rules! duration_setter {
    ($name:ident) => {
        pub fn $name(mut self, value: Duration) -> Self {
            self.config.$name = value;
            self
        }
    };
}

impl ConnectionConfigBuilder {
    duration_setter!(method_call_timeout);
    duration_setter!(connect_timeout);
    duration_setter!(read_timeout);
    duration_setter!(write_timeout);
    duration_setter!(health_check_interval);
    duration_setter!(health_check_timeout);
    duration_setter!(reconnect_initial_delay);
    duration_setter!(reconnect_max_delay);
    duration_setter!(close_timeout);

    pub fn health_check_enabled(mut self, enabled: bool) -> Self {
        self.config.health_check_enabled = enabled;
        self
    }

    pub fn auto_reconnect_enabled(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect_enabled = enabled;
        self
    }

    pub fn reconnect_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.reconnect_backoff_multiplier = multiplier;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<ConnectionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
