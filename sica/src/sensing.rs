//! Receive channel sensing.
//!
//! Once per sensing interval a node measures its own receive channel: it
//! samples carrier sense every `sense_rate` for `sense_period` and turns
//! the busy share into an external load estimate. While measuring, nothing
//! is transmitted on that channel, and neighbors learn the window from the
//! hello so they hold off too.

use log::{log, Level};

use crate::node::{Node, Task};
use crate::time::{Duration, Timestamp};
use crate::traits::{ChannelOracle, Clock, Random, RouteLookup, Transport};
use crate::types::{ChannelId, Event};

/// Busy/idle accumulators of one sensing window.
#[derive(Clone, Debug, Default)]
pub struct SensingEngine {
    channel: Option<ChannelId>,
    busy: Duration,
    idle: Duration,
}

/// Outcome of a finished window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenseResult {
    pub channel: ChannelId,
    pub busy: Duration,
    pub idle: Duration,
}

impl SenseResult {
    /// External load as a share of `capacity`, rounded down.
    pub fn bandwidth(&self, capacity: u32) -> u32 {
        let total = self.busy + self.idle;
        if total.is_zero() {
            return 0;
        }
        (self.busy.as_micros() as u128 * capacity as u128 / total.as_micros() as u128) as u32
    }
}

impl SensingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a window on `channel`, discarding any previous samples.
    pub fn start(&mut self, channel: ChannelId) {
        self.channel = Some(channel);
        self.busy = Duration::ZERO;
        self.idle = Duration::ZERO;
    }

    /// Account one sample covering `step`. Ignored outside a window.
    pub fn record(&mut self, busy: bool, step: Duration) {
        if self.channel.is_none() {
            return;
        }
        if busy {
            self.busy += step;
        } else {
            self.idle += step;
        }
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    /// Channel under measurement.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Close the window.
    pub fn finish(&mut self) -> Option<SenseResult> {
        let channel = self.channel.take()?;
        Some(SenseResult {
            channel,
            busy: core::mem::take(&mut self.busy),
            idle: core::mem::take(&mut self.idle),
        })
    }
}

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Sense timer: re-arm and open a window on the receive channel, unless
    /// a receive switch is due before the window would end.
    pub(crate) fn start_sensing(&mut self, now: Timestamp) {
        let interval = self.config().sense_interval;
        let period = self.config().sense_period;
        let timers = self.timers();
        self.scheduler_mut().schedule_after(timers.sense, now, interval);

        let switch_left = self.scheduler().remaining(timers.switch, now);
        if self.scheduler().is_armed(timers.switch) && switch_left < period {
            log!(
                Level::Info,
                "node {}: switch in {:?}, sensing skipped",
                self.node_id(),
                switch_left
            );
            return;
        }
        if self.sensing().is_active() {
            return;
        }

        let rx = self.rx_channel();
        log!(Level::Debug, "node {}: sensing channel {}", self.node_id(), rx);
        self.sensing_mut().start(rx);
        self.channels_mut().begin_sensing(rx);
        self.metrics_mut().sensing_windows += 1;
        self.scheduler_mut().defer(now + period, Task::SenseEnd);
        self.sample_channel(now);
    }

    /// Sense rate timer: take one carrier sense sample.
    pub(crate) fn sample_channel(&mut self, now: Timestamp) {
        let Some(channel) = self.sensing().channel() else {
            return;
        };
        let rate = self.config().sense_rate;
        let busy = self.oracle().is_busy(channel, now);
        self.sensing_mut().record(busy, rate);
        let timer = self.timers().sense_rate;
        self.scheduler_mut().schedule_after(timer, now, rate);
    }

    /// Close the window and store the estimate.
    pub(crate) fn end_sensing(&mut self, now: Timestamp) {
        let timer = self.timers().sense_rate;
        self.scheduler_mut().cancel(timer);
        let Some(result) = self.sensing_mut().finish() else {
            return;
        };
        self.channels_mut().end_sensing(result.channel);

        let capacity = self.config().channel_capacity;
        let expiry = self.config().bx_expire;
        let bx = result.bandwidth(capacity);
        self.channels_mut()
            .set_external_bandwidth(result.channel, bx, expiry, now);
        self.push_event(Event::BandwidthSensed {
            channel: result.channel,
            bandwidth: bx,
        });
        log!(
            Level::Debug,
            "node {}: channel {} busy {:?} idle {:?}, external load {}",
            self.node_id(),
            result.channel,
            result.busy,
            result.idle,
            bx
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_support::*;
    use crate::routing::StaticRoutes;

    #[test]
    fn test_engine_accumulates_only_inside_window() {
        let mut engine = SensingEngine::new();
        engine.record(true, Duration::from_millis(1));
        assert!(engine.finish().is_none());

        engine.start(3);
        assert_eq!(engine.channel(), Some(3));
        for i in 0..10 {
            engine.record(i < 4, Duration::from_millis(1));
        }
        let result = engine.finish().unwrap();
        assert!(!engine.is_active());
        assert_eq!(result.busy, Duration::from_millis(4));
        assert_eq!(result.idle, Duration::from_millis(6));
        assert_eq!(result.bandwidth(11), 4);
    }

    #[test]
    fn test_empty_window_reads_zero() {
        let result = SenseResult {
            channel: 1,
            busy: Duration::ZERO,
            idle: Duration::ZERO,
        };
        assert_eq!(result.bandwidth(11), 0);
    }

    #[test]
    fn test_busy_window_sets_external_bandwidth() {
        let mut node = test_node(1, StaticRoutes::new());
        node.initialize(Timestamp::ZERO);
        let rx = node.rx_channel();
        node.oracle().set_busy(rx, true);

        let start = Timestamp::from_secs(10);
        node.start_sensing(start);
        assert!(node.sensing().is_active());
        assert!(node.channels().is_sensed(rx));

        let mut now = start;
        let end = start + node.config().sense_period;
        while now < end {
            now = now + node.config().sense_rate;
            node.handle_timer(now);
        }
        assert!(!node.sensing().is_active());
        assert!(!node.channels().is_sensed(rx));
        assert_eq!(node.channels_mut().external_bandwidth(rx, end), 11);
        assert_eq!(node.metrics().sensing_windows, 1);
        assert!(drain_events(&node).contains(&Event::BandwidthSensed {
            channel: rx,
            bandwidth: 11
        }));
    }

    #[test]
    fn test_sensing_skipped_before_imminent_switch() {
        let mut node = test_node(1, StaticRoutes::new());
        node.initialize(Timestamp::ZERO);
        let now = Timestamp::from_secs(10);
        let timers = node.timers();
        node.scheduler_mut()
            .schedule_after(timers.switch, now, Duration::from_millis(100));

        node.start_sensing(now);
        assert!(!node.sensing().is_active());
        assert_eq!(node.metrics().sensing_windows, 0);
        assert_eq!(
            node.scheduler().remaining(timers.sense, now),
            node.config().sense_interval
        );
    }
}
