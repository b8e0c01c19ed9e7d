//! Discrete event simulator for sica networks.

use std::collections::BinaryHeap;

use hashbrown::HashMap;
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;
use sica::{
    ConfigError, Duration, Event as NodeEvent, Frame, NodeId, Radio, Received, SicaConfig,
    Timestamp,
};

use crate::emulation::SharedChannels;
use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{ChannelSnapshot, SimMetrics, SimulationResult};
use crate::node::{SharedRoutes, SimNode};
use crate::topology::Topology;

/// Periodic application traffic between two nodes.
#[derive(Debug, Clone)]
pub struct Flow {
    pub src: NodeId,
    pub dst: NodeId,
    pub interval: Duration,
    pub payload_size: usize,
    /// No packets are sent at or after this time.
    pub stop_at: Option<Timestamp>,
    /// Packets generated so far.
    pub sent: u64,
}

/// Discrete event simulator for sica networks.
pub struct Simulator {
    nodes: HashMap<NodeId, SimNode>,
    topology: Topology,
    config: SicaConfig,
    channels: SharedChannels,
    routes: SharedRoutes,
    flows: Vec<Flow>,
    current_time: Timestamp,
    event_queue: BinaryHeap<ScheduledEvent>,
    metrics: SimMetrics,
    next_seq: u64,
    seed: u64,
    /// Link loss draws.
    rng: WyRand,
    snapshot_interval: Option<Duration>,
    next_snapshot: Option<Timestamp>,
}

impl Simulator {
    /// Create a simulator whose nodes run `config`.
    pub fn new(seed: u64, config: SicaConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            topology: Topology::new(),
            config,
            channels: SharedChannels::new(seed ^ 0x5eed_c4a7),
            routes: SharedRoutes::new(),
            flows: Vec::new(),
            current_time: Timestamp::ZERO,
            event_queue: BinaryHeap::new(),
            metrics: SimMetrics::new(),
            next_seq: 0,
            seed,
            rng: WyRand::seed_from_u64(seed),
            snapshot_interval: None,
            next_snapshot: None,
        }
    }

    /// Set the topology and recompute routes for the nodes added so far.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self.update_routes();
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self.next_snapshot = Some(self.current_time + interval);
        self
    }

    /// Add and initialize node `id`. Its first hellos go out immediately.
    pub fn add_node(&mut self, id: NodeId) -> Result<NodeId, ConfigError> {
        let seed = self.seed.wrapping_add(id as u64 * 1000);
        let mut node = SimNode::new(
            id,
            seed,
            self.config.clone(),
            self.channels.clone(),
            self.routes.clone(),
            self.current_time,
        )?;
        node.initialize(self.current_time);
        self.nodes.insert(id, node);
        self.after_node_activity(id);
        Ok(id)
    }

    /// Recompute shortest-path routes over the current topology.
    pub fn update_routes(&mut self) {
        let ids = self.node_ids();
        let routes = self.topology.shortest_path_routes(&ids);
        log!(Level::Debug, "sim: {} routes for {} nodes", routes.len(), ids.len());
        self.routes.replace(routes);
    }

    pub fn node(&self, id: NodeId) -> Option<&SimNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(&id)
    }

    /// All node IDs, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn channels(&self) -> &SharedChannels {
        &self.channels
    }

    pub fn routes(&self) -> &SharedRoutes {
        &self.routes
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    pub fn schedule_action(&mut self, time: Timestamp, action: ScenarioAction) {
        self.schedule(time, Event::ScenarioAction(action));
    }

    /// Send `payload_size` bytes from `src` to `dst` every `interval`,
    /// starting at `start`. Returns the flow index.
    pub fn add_flow(
        &mut self,
        src: NodeId,
        dst: NodeId,
        interval: Duration,
        payload_size: usize,
        start: Timestamp,
        stop_at: Option<Timestamp>,
    ) -> usize {
        let flow = self.flows.len();
        self.flows.push(Flow {
            src,
            dst,
            interval,
            payload_size,
            stop_at,
            sent: 0,
        });
        self.schedule(start, Event::FlowTick { flow });
        flow
    }

    /// Start or stop external traffic on `channel` right away.
    pub fn set_channel_busy(&mut self, channel: sica::ChannelId, busy_duration: Duration) {
        self.execute_action(ScenarioAction::SetChannelBusy {
            channel,
            busy_duration,
        });
    }

    /// Run simulation until specified time.
    pub fn run_until(&mut self, end_time: Timestamp) -> SimulationResult {
        while let Some(event) = self.event_queue.peek() {
            if event.time > end_time {
                break;
            }
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
        }

        self.advance_time(end_time);
        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.peek().is_none(),
        }
    }

    pub fn run_for(&mut self, duration: Duration) -> SimulationResult {
        self.run_until(self.current_time + duration)
    }

    /// Process at most `max_events` events.
    pub fn run_events(&mut self, max_events: usize) -> SimulationResult {
        let mut processed = 0;
        while processed < max_events {
            let Some(event) = self.event_queue.pop() else {
                break;
            };
            self.advance_time(event.time);
            self.process_event(event.event);
            self.maybe_take_snapshot();
            processed += 1;
        }

        self.take_snapshot();

        SimulationResult {
            end_time: self.current_time,
            metrics: self.metrics.clone(),
            queue_exhausted: self.event_queue.is_empty(),
        }
    }

    fn advance_time(&mut self, time: Timestamp) {
        if time > self.current_time {
            self.current_time = time;
        }
    }

    fn process_event(&mut self, event: Event) {
        match event {
            Event::FrameArrival { to, from, frame } => self.deliver_frame(to, from, frame),
            Event::NodeWake { node, at } => self.wake_node(node, at),
            Event::AppSend { from, to, payload } => self.app_send(from, to, payload),
            Event::FlowTick { flow } => self.flow_tick(flow),
            Event::ScenarioAction(action) => self.execute_action(action),
        }
    }

    /// Hand a frame to its receiver if the receive radio is there to hear it.
    fn deliver_frame(&mut self, to: NodeId, from: NodeId, frame: Frame) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        let addressed = frame.dest.is_broadcast() || frame.dest == node.address(Radio::Receive);
        if !addressed || !node.listens_on(frame.channel, now) {
            self.metrics.frames_missed += 1;
            return;
        }
        if sica::ChannelOracle::is_busy(&self.channels, frame.channel, now) {
            self.metrics.frames_collided += 1;
            return;
        }

        let received = Received {
            radio: Radio::Receive,
            port: frame.port,
            src: crate::node::SimTransport::address_of(from, frame.radio),
            payload: frame.payload,
        };
        node.handle_frame(received, now);
        self.metrics.frames_delivered += 1;
        self.after_node_activity(to);
    }

    /// Run due timers, unless a newer wake superseded this one.
    fn wake_node(&mut self, id: NodeId, at: Timestamp) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.wake_at != Some(at) {
            return;
        }
        node.wake_at = None;
        node.handle_timer(now);
        self.after_node_activity(id);
    }

    fn app_send(&mut self, from: NodeId, to: NodeId, payload: Vec<u8>) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        self.metrics.data_sent += 1;
        if let Err(e) = node.send_data(to, payload, now) {
            log!(Level::Debug, "sim: node {} refused data for {}: {}", from, to, e);
            self.metrics.data_refused += 1;
        }
        self.after_node_activity(from);
    }

    fn flow_tick(&mut self, idx: usize) {
        let now = self.current_time;
        let Some(flow) = self.flows.get_mut(idx) else {
            return;
        };
        if flow.stop_at.is_some_and(|stop| now >= stop) {
            return;
        }
        flow.sent += 1;
        let (src, dst, interval) = (flow.src, flow.dst, flow.interval);
        // sequence tag in the first bytes so payloads differ
        let mut payload = vec![0u8; flow.payload_size];
        for (b, tag) in payload.iter_mut().zip(flow.sent.to_be_bytes()) {
            *b = tag;
        }
        self.app_send(src, dst, payload);
        self.schedule(now + interval, Event::FlowTick { flow: idx });
    }

    /// Collect a node's frames and events and re-arm its wake event.
    fn after_node_activity(&mut self, id: NodeId) {
        let now = self.current_time;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let frames = node.take_outgoing(now);
        let events = node.take_events();
        node.take_incoming();

        let next = node.next_wakeup().map(|t| t.max(now));
        let reschedule = match (next, node.wake_at) {
            (Some(t), Some(armed)) => t != armed,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if reschedule {
            node.wake_at = next;
        }

        for event in events {
            self.record_node_event(id, event);
        }
        if let (true, Some(at)) = (reschedule, next) {
            self.schedule(at, Event::NodeWake { node: id, at });
        }
        for (frame, done) in frames {
            self.transmit(id, frame, done);
        }
    }

    fn record_node_event(&mut self, id: NodeId, event: NodeEvent) {
        match event {
            NodeEvent::DataDelivered { delay, .. } => {
                self.metrics.data_delivered += 1;
                self.metrics.total_delay += delay;
            }
            NodeEvent::DataDropped { .. } => self.metrics.data_dropped += 1,
            NodeEvent::ChannelSwitched { from, to } => {
                log!(Level::Debug, "sim: node {} moved {} -> {}", id, from, to);
                self.metrics.channel_switches += 1;
            }
            NodeEvent::BandwidthSensed { channel, bandwidth } => {
                self.metrics.bandwidth_samples.push((id, channel, bandwidth));
            }
            _ => {}
        }
    }

    /// Put a frame on the air: every linked node may hear it once the
    /// sender's radio is done, unless the link loses it.
    fn transmit(&mut self, sender: NodeId, frame: Frame, done: Timestamp) {
        self.metrics.frames_sent += 1;

        let mut deliveries = Vec::new();
        for neighbor in self.topology.neighbors(sender) {
            let Some(link) = self.topology.get_link(sender, neighbor) else {
                continue;
            };
            let (loss_rate, delay) = (link.loss_rate, link.delay);
            if loss_rate > 0.0 && self.random_f64() < loss_rate {
                self.metrics.frames_lost += 1;
                continue;
            }
            deliveries.push((neighbor, done + delay));
        }

        for (neighbor, at) in deliveries {
            self.schedule(
                at,
                Event::FrameArrival {
                    to: neighbor,
                    from: sender,
                    frame: frame.clone(),
                },
            );
        }
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Partition { groups } => self.topology.partition(&groups),
            ScenarioAction::HealPartition => self.topology.heal(),
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::SetChannelBusy {
                channel,
                busy_duration,
            } => {
                log!(
                    Level::Info,
                    "sim: channel {} busy periods {:?}",
                    channel,
                    busy_duration
                );
                self.channels
                    .set_busy_duration(channel, busy_duration, self.current_time);
            }
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    fn maybe_take_snapshot(&mut self) {
        if let Some(next) = self.next_snapshot {
            if self.current_time >= next {
                self.take_snapshot();
                if let Some(interval) = self.snapshot_interval {
                    self.next_snapshot = Some(next + interval);
                }
            }
        }
    }

    /// Record every node's channel assignment.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = ChannelSnapshot::new(self.current_time);
        for (&id, node) in &self.nodes {
            snapshot.record_node(
                id,
                node.rx_channel(),
                node.inner().pending_channel(),
                node.backlog(),
            );
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Uniform in [0, 1).
    fn random_f64(&mut self) -> f64 {
        (self.rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
