//! Runtime configuration for a channel assignment node.
//!
//! Every protocol period and tuning constant lives in [`SicaConfig`]. The
//! struct is built before the node starts and validated once by
//! [`Node::new`](crate::Node::new); there are no setters on a running node.
//!
//! # Defaults
//!
//! | Parameter | Default | Meaning |
//! |-----------|--------:|---------|
//! | `hello_interval` | 100 s | beacon period (TH in the loss function) |
//! | `hello_expire` | 100 s | lifetime of a queued hello |
//! | `data_expire` | 2000 s | lifetime of queued data |
//! | `neighbor_expire` | 200 s | neighbor entry lifetime without a hello |
//! | `assignment_interval` | 400 s | channel decision period |
//! | `sense_interval` | 200 s | gap between sensing windows |
//! | `sense_period` | 300 ms | sensing window length |
//! | `sense_rate` | 1 ms | busy/idle sampling step |
//! | `bx_expire` | 400 s | validity of an external load estimate |
//! | `switching_delay` | 300 µs | radio retune cost (Ds) |
//! | `tx_dwell` | 10 ms | transmit radio dwell budget per channel |
//! | `alpha` / `beta` / `gamma` | 0.5 / 0.7 / 0.8 | loss mixing, weight base, load vs. switch cost |
//! | channels | 1..=8 | capacity 11 per channel |
//!
//! # Example
//!
//! ```
//! use sica::{SicaConfig, Duration};
//!
//! let config = SicaConfig::default()
//!     .with_channels(1, 3)
//!     .with_hello_interval(Duration::from_secs(10));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.channels().count(), 3);
//! ```

use core::fmt;
use core::ops::RangeInclusive;

use crate::time::Duration;
use crate::types::ChannelId;

/// Engine configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct SicaConfig {
    /// Link-layer tag of data frames.
    pub data_port: u16,
    /// Link-layer tag of hello frames.
    pub hello_port: u16,
    /// Lowest usable channel (inclusive).
    pub min_channel: ChannelId,
    /// Highest usable channel (inclusive).
    pub max_channel: ChannelId,
    /// Capacity of every channel in the units used by sensing (Max_BW).
    pub channel_capacity: u32,
    /// Weight of channel load against switching cost.
    pub gamma: f64,
    /// Multiplicative-weights base, strictly between 0 and 1.
    pub beta: f64,
    /// Weight of external load against neighbor load.
    pub alpha: f64,
    pub hello_interval: Duration,
    pub hello_expire: Duration,
    pub data_expire: Duration,
    pub neighbor_expire: Duration,
    pub assignment_interval: Duration,
    pub sense_interval: Duration,
    pub sense_period: Duration,
    pub sense_rate: Duration,
    pub bx_expire: Duration,
    pub switching_delay: Duration,
    /// Dwell budget of the transmit radio on one channel (T_max).
    pub tx_dwell: Duration,
    /// Settling time between a transmit retune and the first send.
    pub tx_send_delay: Duration,
    /// Poll interval of the receive-channel queue drain.
    pub rx_poll_interval: Duration,
    /// Upper bound of the random delay applied to each hello send. Zero sends immediately.
    pub broadcast_jitter: Duration,
}

impl Default for SicaConfig {
    fn default() -> Self {
        Self {
            data_port: 550,
            hello_port: 551,
            min_channel: 1,
            max_channel: 8,
            channel_capacity: 11,
            gamma: 0.8,
            beta: 0.7,
            alpha: 0.5,
            hello_interval: Duration::from_secs(100),
            hello_expire: Duration::from_secs(100),
            data_expire: Duration::from_secs(2000),
            neighbor_expire: Duration::from_secs(200),
            assignment_interval: Duration::from_secs(400),
            sense_interval: Duration::from_secs(200),
            sense_period: Duration::from_millis(300),
            sense_rate: Duration::from_millis(1),
            bx_expire: Duration::from_secs(400),
            switching_delay: Duration::from_micros(300),
            tx_dwell: Duration::from_millis(10),
            tx_send_delay: Duration::from_micros(10),
            rx_poll_interval: Duration::from_millis(1),
            broadcast_jitter: Duration::ZERO,
        }
    }
}

impl SicaConfig {
    /// Protocol periods scaled down 100x, for simulation runs that need
    /// several assignment rounds within a few simulated minutes.
    pub fn accelerated() -> Self {
        Self {
            hello_interval: Duration::from_secs(1),
            hello_expire: Duration::from_secs(1),
            data_expire: Duration::from_secs(20),
            neighbor_expire: Duration::from_secs(2),
            assignment_interval: Duration::from_secs(4),
            sense_interval: Duration::from_secs(2),
            sense_period: Duration::from_millis(30),
            bx_expire: Duration::from_secs(4),
            ..Self::default()
        }
    }

    pub fn with_channels(mut self, min: ChannelId, max: ChannelId) -> Self {
        self.min_channel = min;
        self.max_channel = max;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set alpha, beta and gamma at once.
    pub fn with_weights(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self.gamma = gamma;
        self
    }

    pub fn with_hello_interval(mut self, interval: Duration) -> Self {
        self.hello_interval = interval;
        self
    }

    pub fn with_assignment_interval(mut self, interval: Duration) -> Self {
        self.assignment_interval = interval;
        self
    }

    pub fn with_sensing(mut self, interval: Duration, period: Duration, rate: Duration) -> Self {
        self.sense_interval = interval;
        self.sense_period = period;
        self.sense_rate = rate;
        self
    }

    pub fn with_expiry(mut self, hello: Duration, data: Duration, neighbor: Duration) -> Self {
        self.hello_expire = hello;
        self.data_expire = data;
        self.neighbor_expire = neighbor;
        self
    }

    pub fn with_switching_delay(mut self, delay: Duration) -> Self {
        self.switching_delay = delay;
        self
    }

    pub fn with_tx_dwell(mut self, dwell: Duration) -> Self {
        self.tx_dwell = dwell;
        self
    }

    pub fn with_broadcast_jitter(mut self, jitter: Duration) -> Self {
        self.broadcast_jitter = jitter;
        self
    }

    /// Usable channels in ascending order.
    pub fn channels(&self) -> RangeInclusive<ChannelId> {
        self.min_channel..=self.max_channel
    }

    pub fn contains_channel(&self, channel: ChannelId) -> bool {
        self.channels().contains(&channel)
    }

    /// Bounds of the receive switch jitter, in whole milliseconds: `[2H, 3H]`.
    pub fn switch_jitter_range(&self) -> (u64, u64) {
        let hello_ms = self.hello_interval.as_millis();
        (hello_ms.saturating_mul(2), hello_ms.saturating_mul(3))
    }

    /// Check every range constraint the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_channel == 0 || self.min_channel > self.max_channel {
            return Err(ConfigError::ChannelRange);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if !(self.beta > 0.0 && self.beta < 1.0) {
            return Err(ConfigError::Beta);
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::Alpha);
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ConfigError::Gamma);
        }
        if self.data_port == self.hello_port {
            return Err(ConfigError::PortClash);
        }
        let periods = [
            ("hello_interval", self.hello_interval),
            ("hello_expire", self.hello_expire),
            ("data_expire", self.data_expire),
            ("neighbor_expire", self.neighbor_expire),
            ("assignment_interval", self.assignment_interval),
            ("sense_interval", self.sense_interval),
            ("sense_period", self.sense_period),
            ("sense_rate", self.sense_rate),
            ("bx_expire", self.bx_expire),
            ("switching_delay", self.switching_delay),
            ("tx_dwell", self.tx_dwell),
            ("rx_poll_interval", self.rx_poll_interval),
        ];
        for (name, value) in periods {
            if value.is_zero() {
                return Err(ConfigError::ZeroPeriod(name));
            }
        }
        Ok(())
    }
}

/// Reason a [`SicaConfig`] was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `min_channel` is 0 or above `max_channel`.
    ChannelRange,
    ZeroCapacity,
    /// `beta` outside (0, 1).
    Beta,
    /// `alpha` outside [0, 1].
    Alpha,
    /// `gamma` outside [0, 1].
    Gamma,
    /// Data and hello ports are equal.
    PortClash,
    /// A period that must be positive is zero.
    ZeroPeriod(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ChannelRange => write!(f, "invalid channel range"),
            ConfigError::ZeroCapacity => write!(f, "channel capacity must be positive"),
            ConfigError::Beta => write!(f, "beta must lie strictly between 0 and 1"),
            ConfigError::Alpha => write!(f, "alpha must lie in [0, 1]"),
            ConfigError::Gamma => write!(f, "gamma must lie in [0, 1]"),
            ConfigError::PortClash => write!(f, "data and hello ports must differ"),
            ConfigError::ZeroPeriod(name) => write!(f, "{} must be positive", name),
        }
    }
}
