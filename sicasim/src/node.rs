//! SimNode wrapper for simulated sica nodes.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};
use std::rc::Rc;

use embassy_sync::channel::Channel;
use sica::traits::{TransportInChannel, TransportOutChannel};
use sica::{
    ChannelId, Clock, ConfigError, Duration, Error, Event as NodeEvent, Frame, IncomingData,
    MacAddr, Node, NodeId, Payload, Radio, Received, RouteLookup, SicaConfig, StaticRoutes,
    Timestamp, Transport, WyRandom,
};

use crate::emulation::SharedChannels;

/// Fixed per-frame overhead (preamble and PLCP header).
pub const PREAMBLE: Duration = Duration::from_micros(96);

/// Payload bit rate in bits per microsecond.
pub const BITS_PER_MICRO: u64 = 11;

/// Airtime of a frame of `bytes` bytes at 11 Mbit/s.
pub fn airtime(bytes: usize) -> Duration {
    let bits = bytes as u64 * 8;
    PREAMBLE + Duration::from_micros(bits.div_ceil(BITS_PER_MICRO))
}

/// Dual-radio transport of a simulated node.
///
/// Frames pushed by the node wait in the outgoing channel until the
/// simulator collects them. Each radio serialises its frames back to back.
pub struct SimTransport {
    node: NodeId,
    channels: [ChannelId; 2],
    switch_done: [Timestamp; 2],
    busy_until: [Cell<Timestamp>; 2],
    switching_delay: Duration,
    outgoing: TransportOutChannel,
    incoming: TransportInChannel,
}

fn radio_index(radio: Radio) -> usize {
    match radio {
        Radio::Receive => 0,
        Radio::Transmit => 1,
    }
}

impl SimTransport {
    pub fn new(node: NodeId, switching_delay: Duration) -> Self {
        Self {
            node,
            channels: [0; 2],
            switch_done: [Timestamp::ZERO; 2],
            busy_until: [Cell::new(Timestamp::ZERO), Cell::new(Timestamp::ZERO)],
            switching_delay,
            outgoing: Channel::new(),
            incoming: Channel::new(),
        }
    }

    /// Locally administered address: `02:<id, 4 bytes>:<radio>`.
    pub fn address_of(node: NodeId, radio: Radio) -> MacAddr {
        let id = node.to_be_bytes();
        MacAddr([2, id[0], id[1], id[2], id[3], radio_index(radio) as u8])
    }

    /// Inverse of [`address_of`](Self::address_of).
    pub fn owner_of(addr: MacAddr) -> Option<(NodeId, Radio)> {
        let b = addr.0;
        if b[0] != 2 {
            return None;
        }
        let radio = match b[5] {
            0 => Radio::Receive,
            1 => Radio::Transmit,
            _ => return None,
        };
        Some((NodeId::from_be_bytes([b[1], b[2], b[3], b[4]]), radio))
    }

    /// Reserve the radio for `bytes` of airtime starting no earlier than
    /// `now`. Returns when the frame is fully on the air.
    pub fn reserve_airtime(&self, radio: Radio, bytes: usize, now: Timestamp) -> Timestamp {
        let slot = &self.busy_until[radio_index(radio)];
        let end = now.max(slot.get()) + airtime(bytes);
        slot.set(end);
        end
    }

    /// Take all frames pushed by the node, in send order.
    pub fn take_sent(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outgoing.try_receive() {
            frames.push(frame);
        }
        frames
    }
}

impl Transport for SimTransport {
    fn address(&self, radio: Radio) -> MacAddr {
        Self::address_of(self.node, radio)
    }

    fn channel(&self, radio: Radio) -> ChannelId {
        self.channels[radio_index(radio)]
    }

    fn set_channel(&mut self, radio: Radio, channel: ChannelId, now: Timestamp) {
        let idx = radio_index(radio);
        if self.channels[idx] != channel {
            self.channels[idx] = channel;
            self.switch_done[idx] = now + self.switching_delay;
        }
    }

    fn is_switching(&self, radio: Radio, now: Timestamp) -> bool {
        now < self.switch_done[radio_index(radio)]
    }

    fn tx_duration(&self, bytes: usize) -> Duration {
        airtime(bytes)
    }

    fn outgoing(&self) -> &TransportOutChannel {
        &self.outgoing
    }

    fn incoming(&self) -> &TransportInChannel {
        &self.incoming
    }
}

/// Clock controlled by the simulator.
#[derive(Default)]
pub struct SimClock {
    current: Cell<Timestamp>,
}

impl SimClock {
    pub fn at(time: Timestamp) -> Self {
        Self {
            current: Cell::new(time),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.current.set(time);
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.current.get()
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Route table shared by all nodes, recomputed when the topology is set.
#[derive(Clone, Default)]
pub struct SharedRoutes(Rc<RefCell<StaticRoutes>>);

impl SharedRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, routes: StaticRoutes) {
        *self.0.borrow_mut() = routes;
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl RouteLookup for SharedRoutes {
    fn next_hop(&self, src: NodeId, dst: NodeId) -> Option<NodeId> {
        self.0.borrow().next_hop(src, dst)
    }
}

/// Node type driven by the simulator.
pub type SimNodeInner = Node<SimTransport, WyRandom, SimClock, SharedChannels, SharedRoutes>;

/// Wrapper around a sica Node for simulation.
pub struct SimNode {
    inner: SimNodeInner,
    /// When the node was created.
    pub created_at: Timestamp,
    /// Deadline of the wake event currently queued for this node.
    pub(crate) wake_at: Option<Timestamp>,
}

impl SimNode {
    pub fn new(
        id: NodeId,
        seed: u64,
        config: SicaConfig,
        channels: SharedChannels,
        routes: SharedRoutes,
        created_at: Timestamp,
    ) -> Result<Self, ConfigError> {
        let transport = SimTransport::new(id, config.switching_delay);
        let inner = Node::new(
            transport,
            WyRandom::seed_from_u64(seed),
            SimClock::at(created_at),
            channels,
            routes,
            id,
            config,
        )?;
        Ok(Self {
            inner,
            created_at,
            wake_at: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id()
    }

    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn rx_channel(&self) -> ChannelId {
        self.inner.rx_channel()
    }

    pub fn address(&self, radio: Radio) -> MacAddr {
        self.inner.transport().address(radio)
    }

    /// True when the receive radio is parked on `channel` and not retuning.
    pub fn listens_on(&self, channel: ChannelId, now: Timestamp) -> bool {
        let transport = self.inner.transport();
        transport.channel(Radio::Receive) == channel && !transport.is_switching(Radio::Receive, now)
    }

    /// Packets queued across all channels.
    pub fn backlog(&self) -> usize {
        let queues = self.inner.queues();
        self.inner
            .config()
            .channels()
            .map(|ch| queues.total_len(ch))
            .sum()
    }

    /// Distinct next hops with queued data, across all channels.
    pub fn flow_count(&self) -> usize {
        let queues = self.inner.queues();
        self.inner
            .config()
            .channels()
            .map(|ch| queues.flow_count(ch))
            .sum()
    }

    pub fn initialize(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.initialize(now);
    }

    pub fn handle_frame(&mut self, frame: Received, now: Timestamp) -> bool {
        self.inner.clock().set(now);
        self.inner.handle_transport_rx(frame, now)
    }

    pub fn handle_timer(&mut self, now: Timestamp) {
        self.inner.clock().set(now);
        self.inner.handle_timer(now);
    }

    pub fn send_data(&mut self, dest: NodeId, payload: Payload, now: Timestamp) -> Result<(), Error> {
        self.inner.clock().set(now);
        self.inner.send_data(dest, payload, now)
    }

    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.inner.next_wakeup()
    }

    /// Frames pushed since the last call, each with the time its radio
    /// finishes sending it.
    pub fn take_outgoing(&self, now: Timestamp) -> Vec<(Frame, Timestamp)> {
        let transport = self.inner.transport();
        transport
            .take_sent()
            .into_iter()
            .map(|frame| {
                let done = transport.reserve_airtime(frame.radio, frame.payload.len(), now);
                (frame, done)
            })
            .collect()
    }

    pub fn take_events(&self) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.events().try_receive() {
            events.push(event);
        }
        events
    }

    pub fn take_incoming(&self) -> Vec<IncomingData> {
        let mut data = Vec::new();
        while let Ok(d) = self.inner.incoming().try_receive() {
            data.push(d);
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_node(id: NodeId) -> SimNode {
        SimNode::new(
            id,
            id as u64,
            SicaConfig::accelerated(),
            SharedChannels::new(1),
            SharedRoutes::new(),
            Timestamp::ZERO,
        )
        .unwrap()
    }

    #[test]
    fn test_addresses_identify_node_and_radio() {
        let addr = SimTransport::address_of(0x0102_0304, Radio::Transmit);
        assert_eq!(addr, MacAddr([2, 1, 2, 3, 4, 1]));
        assert_eq!(
            SimTransport::owner_of(addr),
            Some((0x0102_0304, Radio::Transmit))
        );
        assert_eq!(SimTransport::owner_of(MacAddr::BROADCAST), None);
    }

    #[test]
    fn test_airtime_model() {
        assert_eq!(airtime(0), PREAMBLE);
        // 1054 bytes = 8432 bits = 767 us at 11 Mbit/s
        assert_eq!(airtime(1054), Duration::from_micros(96 + 767));
    }

    #[test]
    fn test_frames_are_serialised_per_radio() {
        let transport = SimTransport::new(1, Duration::ZERO);
        let now = Timestamp::from_millis(1);
        let first = transport.reserve_airtime(Radio::Transmit, 110, now);
        let second = transport.reserve_airtime(Radio::Transmit, 110, now);
        assert_eq!(first, now + airtime(110));
        assert_eq!(second, first + airtime(110));
        // the other radio is independent
        assert_eq!(
            transport.reserve_airtime(Radio::Receive, 110, now),
            now + airtime(110)
        );
    }

    #[test]
    fn test_retune_takes_switching_delay() {
        let mut transport = SimTransport::new(1, Duration::from_micros(300));
        let now = Timestamp::from_secs(1);
        transport.set_channel(Radio::Receive, 4, now);
        assert!(transport.is_switching(Radio::Receive, now + Duration::from_micros(299)));
        assert!(!transport.is_switching(Radio::Receive, now + Duration::from_micros(300)));
        // staying on the same channel costs nothing
        transport.set_channel(Radio::Receive, 4, now + Duration::from_secs(1));
        assert!(!transport.is_switching(Radio::Receive, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_simnode_initialization_sends_bootstrap_hellos() {
        let mut node = sim_node(3);
        node.initialize(Timestamp::ZERO);
        let rx = node.rx_channel();
        assert!(node.listens_on(rx, Timestamp::from_millis(1)));
        assert_eq!(node.address(Radio::Receive), SimTransport::address_of(3, Radio::Receive));
        assert_eq!(node.backlog(), 8);
        assert_eq!(node.flow_count(), 0);

        let mut now = Timestamp::ZERO;
        let mut frames = Vec::new();
        while frames.len() < 8 {
            now = node.next_wakeup().unwrap();
            node.handle_timer(now);
            frames.extend(node.take_outgoing(now));
        }
        assert!(frames.iter().all(|(f, _)| f.dest.is_broadcast()));
        let mut channels: Vec<ChannelId> = frames.iter().map(|(f, _)| f.channel).collect();
        channels.sort_unstable();
        assert_eq!(channels, (1..=8).collect::<Vec<_>>());
        assert_eq!(node.backlog(), 0);
    }

    #[test]
    fn test_send_without_route_fails() {
        let mut node = sim_node(1);
        node.initialize(Timestamp::ZERO);
        assert_eq!(
            node.send_data(2, vec![0; 8], Timestamp::ZERO),
            Err(Error::NoRoute)
        );
        assert!(node
            .take_events()
            .iter()
            .any(|e| matches!(e, NodeEvent::DataDropped { dest: 2, .. })));
    }
}
