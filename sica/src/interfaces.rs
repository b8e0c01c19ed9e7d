//! Radio drains.
//!
//! The transmit radio (T) visits channels round-robin and spends at most
//! one dwell budget on each; it sends hellos first, then data, back to
//! back. The receive radio (R) never leaves its channel and drains that
//! channel's queue on a short poll.
//!
//! Both use the same readiness shape: the channel must be free of external
//! traffic, not under measurement, the radio not mid-retune, and the
//! estimated airtime must fit before the next interruption.

use log::{log, Level};

use crate::node::{Node, Task};
use crate::time::{Duration, Timestamp};
use crate::traits::{ChannelOracle, Clock, Frame, Random, RouteLookup, Transport};
use crate::types::{
    ChannelId, MacAddr, PacketKind, Radio, DATA_TX_ESTIMATE_BYTES, HELLO_TX_ESTIMATE_BYTES,
};

/// Result of one send attempt from a queue front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    /// Frame handed to the transport, entry removed.
    Sent,
    /// Entry removed without sending (no usable destination).
    Discarded,
    /// Transport full; entry kept for the next round.
    Blocked,
}

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Round-robin step of the T radio starting at `start`.
    ///
    /// Picks the first channel from `start` upwards that has traffic and
    /// that the radio can tune to, then sends after the retune settles.
    /// The next step starts one channel further on, wrapping to the first
    /// channel after the last.
    pub(crate) fn tx_round_robin(&mut self, start: ChannelId, now: Timestamp) {
        let min = self.config().min_channel;
        let max = self.config().max_channel;
        let dwell = self.config().tx_dwell;
        let settle = self.config().switching_delay + self.config().tx_send_delay;

        let mut ch = start.max(min) as u16;
        let mut found = false;
        while ch <= max as u16 {
            let channel = ch as ChannelId;
            if !self.queues_mut().is_empty(channel, now) && self.tune_transmitter(channel, now) {
                self.scheduler_mut().defer(now + settle, Task::TxSend(channel));
                found = true;
                break;
            }
            ch += 1;
        }

        let next = if !found || ch >= max as u16 {
            min
        } else {
            (ch + 1) as ChannelId
        };
        let tx = self.timers().tx;
        self.scheduler_mut()
            .schedule_with(tx, Task::TxRoundRobin(next), now, dwell);
    }

    /// Tune the T radio to `channel`. Refused while its current channel is busy.
    pub(crate) fn tune_transmitter(&mut self, channel: ChannelId, now: Timestamp) -> bool {
        let current = self.transport().channel(Radio::Transmit);
        if current == channel {
            return true;
        }
        if self.oracle().is_busy(current, now) {
            return false;
        }
        self.transport_mut().set_channel(Radio::Transmit, channel, now);
        log!(
            Level::Trace,
            "node {}: transmit radio {} -> {}",
            self.node_id(),
            current,
            channel
        );
        true
    }

    /// Drain `channel` on the T radio within what is left of the dwell budget.
    pub(crate) fn tx_send(&mut self, channel: ChannelId, now: Timestamp) {
        let jitter = self.config().broadcast_jitter;
        let mut spent = Duration::ZERO;
        let mut sent = 0u32;

        while let Some(kind) = self.front_kind(channel, now) {
            let estimate = self.tx_estimate(kind);
            if !self.tx_ready(channel, estimate, spent, now) {
                break;
            }
            match self.send_front(Radio::Transmit, channel, kind, now) {
                SendOutcome::Sent => {
                    sent += 1;
                    spent += estimate;
                    if kind == PacketKind::Hello {
                        spent += jitter;
                    }
                }
                SendOutcome::Discarded => {}
                SendOutcome::Blocked => break,
            }
        }

        if sent > 0 {
            log!(
                Level::Debug,
                "node {}: {} frames sent on channel {} by transmit radio",
                self.node_id(),
                sent,
                channel
            );
        }
        // Move on as soon as the burst is over.
        let tx = self.timers().tx;
        self.scheduler_mut().reschedule_if_sooner(tx, now, spent);
    }

    /// R radio poll: drain the receive channel queue.
    pub(crate) fn rx_poll(&mut self, now: Timestamp) {
        let channel = self.rx_channel();
        let mut spent = Duration::ZERO;
        let mut sent = 0u32;

        while let Some(kind) = self.front_kind(channel, now) {
            let estimate = self.tx_estimate(kind);
            if !self.rx_ready(estimate, spent, now) {
                break;
            }
            match self.send_front(Radio::Receive, channel, kind, now) {
                SendOutcome::Sent => {
                    sent += 1;
                    spent += estimate;
                }
                SendOutcome::Discarded => {}
                SendOutcome::Blocked => break,
            }
        }

        if sent > 0 {
            log!(
                Level::Debug,
                "node {}: {} frames sent on channel {} by receive radio",
                self.node_id(),
                sent,
                channel
            );
        }
        let interval = self.config().rx_poll_interval;
        let poll = self.timers().rx_poll;
        self.scheduler_mut().schedule_after(poll, now, interval);
    }

    /// Readiness of the T radio on `channel` for a frame of `estimate` airtime
    /// after `spent` of the dwell budget is used up.
    pub(crate) fn tx_ready(
        &self,
        channel: ChannelId,
        estimate: Duration,
        spent: Duration,
        now: Timestamp,
    ) -> bool {
        if self.channels().is_sensed(channel) {
            return false;
        }
        if self.oracle().is_busy(channel, now) {
            return false;
        }
        if self.transport().is_switching(Radio::Transmit, now) {
            return false;
        }
        let left = self
            .scheduler()
            .remaining(self.timers().tx, now)
            .saturating_sub(spent);
        estimate <= left
    }

    /// Readiness of the R radio on its own channel.
    pub(crate) fn rx_ready(&self, estimate: Duration, spent: Duration, now: Timestamp) -> bool {
        if self.oracle().is_busy(self.rx_channel(), now) {
            return false;
        }
        if self.sensing().is_active() {
            return false;
        }
        let needed = estimate + spent;
        let timers = self.timers();
        for timer in [timers.switch, timers.sense] {
            if self.scheduler().is_armed(timer) && needed > self.scheduler().remaining(timer, now) {
                return false;
            }
        }
        !self.transport().is_switching(Radio::Receive, now)
    }

    /// Kind of the next frame to send: hellos go first.
    fn front_kind(&mut self, channel: ChannelId, now: Timestamp) -> Option<PacketKind> {
        if self.queues_mut().len(channel, PacketKind::Hello, now) > 0 {
            Some(PacketKind::Hello)
        } else if self.queues_mut().len(channel, PacketKind::Data, now) > 0 {
            Some(PacketKind::Data)
        } else {
            None
        }
    }

    fn tx_estimate(&self, kind: PacketKind) -> Duration {
        let bytes = match kind {
            PacketKind::Hello => HELLO_TX_ESTIMATE_BYTES,
            PacketKind::Data => DATA_TX_ESTIMATE_BYTES,
        };
        self.transport().tx_duration(bytes)
    }

    /// Send the front entry of one FIFO. The entry is removed only once the
    /// transport accepted it (or it can never be sent).
    pub(crate) fn send_front(
        &mut self,
        radio: Radio,
        channel: ChannelId,
        kind: PacketKind,
        now: Timestamp,
    ) -> SendOutcome {
        let Some(entry) = self.queues_mut().peek(channel, kind, now) else {
            return SendOutcome::Discarded;
        };

        let (dest, port) = match kind {
            PacketKind::Hello => (MacAddr::BROADCAST, self.config().hello_port),
            PacketKind::Data => {
                let next_hop = entry.next_hop.unwrap_or_default();
                let addr = self.neighbors().get(next_hop).and_then(|n| n.recv_addr);
                match addr {
                    Some(addr) => (addr, self.config().data_port),
                    None => {
                        self.queues_mut().erase_front(channel, kind);
                        self.drop_data(
                            entry.dest.unwrap_or(next_hop),
                            crate::types::DropReason::NoNeighborAddress,
                        );
                        return SendOutcome::Discarded;
                    }
                }
            }
        };

        let frame = Frame {
            radio,
            channel,
            dest,
            port,
            payload: entry.bytes,
        };

        let jitter = self.config().broadcast_jitter;
        if kind == PacketKind::Hello && !jitter.is_zero() {
            let delay = self.random_mut().gen_range(0, jitter.as_micros() + 1);
            self.scheduler_mut()
                .defer(now + Duration::from_micros(delay), Task::Transmit(frame));
            self.queues_mut().erase_front(channel, kind);
            return SendOutcome::Sent;
        }

        if !self.push_frame(frame) {
            return SendOutcome::Blocked;
        }
        self.queues_mut().erase_front(channel, kind);
        SendOutcome::Sent
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::SendOutcome;
    use crate::config::SicaConfig;
    use crate::node::test_support::*;
    use crate::routing::StaticRoutes;
    use crate::time::{Duration, Timestamp};
    use crate::traits::{Frame, Transport};
    use crate::types::{Event, MacAddr, PacketKind, Radio};
    use crate::wire::{Decode, Hello};

    fn run_until(node: &mut TestNode, end: Timestamp) {
        while let Some(at) = node.next_wakeup() {
            if at > end {
                break;
            }
            node.handle_timer(at);
        }
    }

    fn routed_node() -> TestNode {
        let mut routes = StaticRoutes::new();
        routes.add(1, 2, 2, 1);
        let mut node = test_node(1, routes);
        node.initialize(Timestamp::ZERO);
        node
    }

    fn tx_frames(frames: &[Frame]) -> Vec<&Frame> {
        frames.iter().filter(|f| f.radio == Radio::Transmit).collect()
    }

    #[test]
    fn test_round_robin_visits_each_bootstrap_channel() {
        let mut node = routed_node();
        run_until(&mut node, Timestamp::from_millis(200));

        let sent = node.transport().take_sent();
        let mut channels: Vec<u8> = sent.iter().map(|f| f.channel).collect();
        channels.sort_unstable();
        assert_eq!(channels, (1..=8).collect::<Vec<_>>());
        for frame in &sent {
            let hello = Hello::decode_from_slice(&frame.payload).unwrap();
            assert_eq!(hello.origin, 1);
            assert_eq!(frame.dest, MacAddr::BROADCAST);
        }
        assert!((1..=8).all(|ch| node.queues_mut().is_empty(ch, Timestamp::from_millis(200))));
    }

    #[test]
    fn test_data_goes_to_neighbor_receive_address() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);
        run_until(&mut node, now);
        let other = if node.rx_channel() == 3 { 4 } else { 3 };
        deliver_hello(&mut node, &hello_from(2, 1, other, now), now);
        node.send_data(2, vec![5; 100], now).unwrap();
        node.transport().take_sent();

        run_until(&mut node, now + Duration::from_millis(200));
        let sent = node.transport().take_sent();
        let data: Vec<_> = tx_frames(&sent)
            .into_iter()
            .filter(|f| f.port == node.config().data_port)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].dest, mac(2, 0));
        assert_eq!(data[0].channel, other);
        assert_eq!(node.transport().channel(Radio::Transmit), other);
    }

    #[test]
    fn test_busy_or_sensed_channel_holds_traffic() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);
        run_until(&mut node, now);
        let other = if node.rx_channel() == 3 { 4 } else { 3 };
        deliver_hello(&mut node, &hello_from(2, 1, other, now), now);
        node.send_data(2, vec![5; 100], now).unwrap();
        node.oracle().set_busy(other, true);
        node.transport().take_sent();

        run_until(&mut node, now + Duration::from_millis(100));
        assert!(node
            .transport()
            .take_sent()
            .iter()
            .all(|f| f.channel != other));
        assert_eq!(node.queues_mut().len(other, PacketKind::Data, now), 1);

        node.oracle().set_busy(other, false);
        run_until(&mut node, now + Duration::from_millis(200));
        assert_eq!(node.queues_mut().len(other, PacketKind::Data, now), 0);
    }

    #[test]
    fn test_dwell_budget_caps_a_burst() {
        // 1 µs per byte: a 10 ms dwell fits nine full data frames
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);
        run_until(&mut node, now);
        let other = if node.rx_channel() == 3 { 4 } else { 3 };
        deliver_hello(&mut node, &hello_from(2, 1, other, now), now);
        for _ in 0..20 {
            node.send_data(2, vec![1; 1000], now).unwrap();
        }
        node.transport().take_sent();

        node.tx_round_robin(other, now);
        let settle = node.config().switching_delay + node.config().tx_send_delay;
        node.handle_timer(now + settle);
        let sent = node.transport().take_sent();
        assert_eq!(sent.len(), 9);
        assert_eq!(node.queues_mut().len(other, PacketKind::Data, now + settle), 11);
    }

    #[test]
    fn test_receive_radio_drains_own_channel() {
        let mut node = routed_node();
        let rx = node.rx_channel();
        let now = Timestamp::from_secs(1);
        deliver_hello(&mut node, &hello_from(2, 1, rx, now), now);
        node.send_data(2, vec![0; 10], now).unwrap();
        node.transport().take_sent();

        node.rx_poll(now);
        let sent = node.transport().take_sent();
        assert!(sent
            .iter()
            .any(|f| f.radio == Radio::Receive && f.port == node.config().data_port));
        assert!(node.queues_mut().is_empty(rx, now));
    }

    #[test]
    fn test_receive_radio_waits_for_imminent_switch() {
        let mut node = routed_node();
        let rx = node.rx_channel();
        let now = Timestamp::from_secs(1);
        let switch = node.timers().switch;
        node.scheduler_mut()
            .schedule_after(switch, now, Duration::from_micros(100));
        node.rx_poll(now);
        assert!(node.transport().take_sent().is_empty());
        assert!(!node.queues_mut().is_empty(rx, now));
    }

    #[test]
    fn test_unknown_next_hop_is_discarded_at_send() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);
        deliver_hello(&mut node, &hello_from(2, 1, 5, now), now);
        node.send_data(2, vec![0; 10], now).unwrap();
        node.neighbors_mut().get_mut(2).unwrap().recv_addr = None;
        drain_events(&node);

        assert_eq!(
            node.send_front(Radio::Transmit, 5, PacketKind::Data, now),
            SendOutcome::Discarded
        );
        assert_eq!(node.queues_mut().len(5, PacketKind::Data, now), 0);
        assert!(drain_events(&node).iter().any(|e| matches!(
            e,
            Event::DataDropped { dest: 2, .. }
        )));
    }

    #[test]
    fn test_full_transport_keeps_entry() {
        let mut node = routed_node();
        let now = Timestamp::ZERO;
        // fill the outgoing channel
        while node.send_front(Radio::Transmit, 1, PacketKind::Hello, now) == SendOutcome::Sent {
            let hello = node.build_hello(now);
            node.distribute_hello(&hello, now);
        }
        assert_eq!(node.queues_mut().len(1, PacketKind::Hello, now), 1);
        assert_eq!(
            node.send_front(Radio::Transmit, 1, PacketKind::Hello, now),
            SendOutcome::Blocked
        );
        assert!(node.metrics().frames_blocked >= 2);
    }

    #[test]
    fn test_broadcast_jitter_defers_hello() {
        let config = SicaConfig::default().with_broadcast_jitter(Duration::from_millis(5));
        let mut node = test_node_with(1, StaticRoutes::new(), config);
        node.initialize(Timestamp::ZERO);
        assert_eq!(
            node.send_front(Radio::Transmit, 2, PacketKind::Hello, Timestamp::ZERO),
            SendOutcome::Sent
        );
        assert!(node.transport().take_sent().is_empty());

        node.handle_timer(Timestamp::from_millis(5));
        let sent = node.transport().take_sent();
        assert!(sent.iter().any(|f| f.channel == 2));
        assert!(drain_events(&node)
            .iter()
            .any(|e| matches!(e, Event::HelloSent { channel: 2, .. })));
    }
}
