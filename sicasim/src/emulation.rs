//! External interference emulation.
//!
//! Each channel alternates between idle and busy periods that do not
//! belong to the simulated mesh (other networks, microwave ovens...).
//! Busy periods have a fixed length; idle periods are exponentially
//! distributed with a mean of 2 ms and capped at 8 ms. A busy length of
//! zero keeps the channel idle forever.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;
use sica::traits::ChannelOracle;
use sica::{ChannelId, Duration, Timestamp};

/// Busy period length when interference is switched on without a value.
pub const DEFAULT_BUSY_DURATION: Duration = Duration::from_millis(8);

/// Mean idle gap between busy periods.
pub const MEAN_IDLE: Duration = Duration::from_millis(2);

/// Longest idle gap drawn.
pub const MAX_IDLE: Duration = Duration::from_millis(8);

#[derive(Debug, Clone)]
struct ChannelProcess {
    busy_duration: Duration,
    busy: bool,
    /// End of the current period.
    until: Timestamp,
    /// Accumulated busy time, for reporting.
    busy_total: Duration,
}

impl ChannelProcess {
    fn idle_forever() -> Self {
        Self {
            busy_duration: Duration::ZERO,
            busy: false,
            until: Timestamp::MAX,
            busy_total: Duration::ZERO,
        }
    }
}

/// Per-channel idle/busy processes driven by one seeded generator.
///
/// Queries must not go back in time; the process is advanced lazily up to
/// the queried instant.
pub struct ChannelEmulator {
    channels: HashMap<ChannelId, ChannelProcess>,
    rng: WyRand,
}

impl ChannelEmulator {
    pub fn new(seed: u64) -> Self {
        Self {
            channels: HashMap::new(),
            rng: WyRand::seed_from_u64(seed),
        }
    }

    /// Set the busy period length of `channel` from `now` on. Zero turns
    /// interference off.
    pub fn set_busy_duration(&mut self, channel: ChannelId, busy_duration: Duration, now: Timestamp) {
        self.advance(channel, now);
        if busy_duration.is_zero() {
            let total = self
                .channels
                .get(&channel)
                .map(|p| p.busy_total)
                .unwrap_or(Duration::ZERO);
            let mut process = ChannelProcess::idle_forever();
            process.busy_total = total;
            self.channels.insert(channel, process);
            return;
        }
        let idle = self.draw_idle();
        let process = self
            .channels
            .entry(channel)
            .or_insert_with(ChannelProcess::idle_forever);
        process.busy_duration = busy_duration;
        process.busy = false;
        process.until = now + idle;
    }

    /// Busy period length of `channel`, zero when it never turns busy.
    pub fn busy_duration(&self, channel: ChannelId) -> Duration {
        self.channels
            .get(&channel)
            .map(|p| p.busy_duration)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_busy(&mut self, channel: ChannelId, now: Timestamp) -> bool {
        self.advance(channel, now);
        self.channels.get(&channel).is_some_and(|p| p.busy)
    }

    /// Remaining busy time, zero while idle.
    pub fn idle_in(&mut self, channel: ChannelId, now: Timestamp) -> Duration {
        self.advance(channel, now);
        match self.channels.get(&channel) {
            Some(p) if p.busy => p.until.saturating_sub(now),
            _ => Duration::ZERO,
        }
    }

    /// Busy time of all periods completed before the last query.
    pub fn busy_total(&self, channel: ChannelId) -> Duration {
        self.channels
            .get(&channel)
            .map(|p| p.busy_total)
            .unwrap_or(Duration::ZERO)
    }

    fn advance(&mut self, channel: ChannelId, now: Timestamp) {
        loop {
            let Some(process) = self.channels.get(&channel) else {
                return;
            };
            if process.busy_duration.is_zero() || process.until > now {
                return;
            }
            let next_idle = if process.busy {
                self.draw_idle()
            } else {
                Duration::ZERO
            };
            let Some(process) = self.channels.get_mut(&channel) else {
                return;
            };
            if process.busy {
                process.busy_total += process.busy_duration;
                process.busy = false;
                process.until += next_idle;
            } else {
                process.busy = true;
                process.until += process.busy_duration;
            }
        }
    }

    /// Exponential idle gap, never zero, capped at [`MAX_IDLE`].
    fn draw_idle(&mut self) -> Duration {
        // (0, 1]
        let u = ((self.rng.next_u64() >> 11) + 1) as f64 / (1u64 << 53) as f64;
        let micros = -(MEAN_IDLE.as_micros() as f64) * u.ln();
        let micros = (micros as u64).clamp(1, MAX_IDLE.as_micros());
        Duration::from_micros(micros)
    }
}

/// Emulator handle shared by every simulated node as its carrier sense.
#[derive(Clone)]
pub struct SharedChannels(Rc<RefCell<ChannelEmulator>>);

impl SharedChannels {
    pub fn new(seed: u64) -> Self {
        Self(Rc::new(RefCell::new(ChannelEmulator::new(seed))))
    }

    pub fn set_busy_duration(&self, channel: ChannelId, busy_duration: Duration, now: Timestamp) {
        self.0
            .borrow_mut()
            .set_busy_duration(channel, busy_duration, now);
    }

    pub fn busy_duration(&self, channel: ChannelId) -> Duration {
        self.0.borrow().busy_duration(channel)
    }

    pub fn busy_total(&self, channel: ChannelId) -> Duration {
        self.0.borrow().busy_total(channel)
    }
}

impl ChannelOracle for SharedChannels {
    fn is_busy(&self, channel: ChannelId, now: Timestamp) -> bool {
        self.0.borrow_mut().is_busy(channel, now)
    }

    fn idle_in(&self, channel: ChannelId, now: Timestamp) -> Duration {
        self.0.borrow_mut().idle_in(channel, now)
    }
}
