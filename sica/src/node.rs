//! Node implementation - the per-node protocol state machine.
//!
//! The Node owns its tables, queues and timers and is driven entirely by
//! three inputs:
//! - frames arriving on the receive radio (`handle_transport_rx`)
//! - application sends (`send_data`)
//! - timer expiry (`handle_timer`)
//!
//! The protocol logic is split by concern into `hello`, `forwarding`,
//! `sensing`, `assignment`, `switching` and `interfaces`; each adds an
//! `impl Node` block.
//!
//! # Usage
//!
//! ```ignore
//! let mut node = Node::new(transport, random, clock, oracle, routes, id, SicaConfig::default())?;
//!
//! spawn(async move {
//!     node.run().await;
//! });
//!
//! node.outgoing().send(OutgoingData { target, payload }).await;
//! let data = node.incoming().receive().await;
//! ```

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use embassy_sync::channel::Channel;
use log::{log, Level};

use crate::channel::ChannelTable;
use crate::config::{ConfigError, SicaConfig};
use crate::neighbor::NeighborTable;
use crate::queue::ChannelQueueSet;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::sensing::SensingEngine;
use crate::time::{Duration, Timestamp};
use crate::traits::{
    AppInChannel, AppOutChannel, ChannelOracle, Clock, EventChannel, Frame, IncomingData, Random,
    Received, RouteLookup, Transport,
};
use crate::types::{ChannelId, Event, NodeId, NodeMetrics, Radio};

/// Work items run by the node scheduler.
#[derive(Clone, Debug)]
pub(crate) enum Task {
    Hello,
    SenseStart,
    SenseSample,
    SenseEnd,
    /// A sensing window announced by a neighbor opens on this channel.
    ForeignSenseBegin(ChannelId),
    /// Closes one window opened by `ForeignSenseBegin`.
    ForeignSenseEnd(ChannelId),
    Assignment,
    ReceiveSwitch,
    NeighborSwitch,
    /// Round-robin step of the transmit radio, starting at this channel.
    TxRoundRobin(ChannelId),
    /// Drain one channel on the transmit radio after retuning.
    TxSend(ChannelId),
    RxPoll,
    /// Hello held back by broadcast jitter.
    Transmit(Frame),
}

/// Handles of the named timers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timers {
    pub hello: TimerHandle,
    pub sense: TimerHandle,
    pub sense_rate: TimerHandle,
    pub assignment: TimerHandle,
    pub switch: TimerHandle,
    pub neighbor_switch: TimerHandle,
    pub tx: TimerHandle,
    pub rx_poll: TimerHandle,
}

impl Timers {
    fn register(scheduler: &mut Scheduler<Task>, min_channel: ChannelId) -> Self {
        Self {
            hello: scheduler.register(Task::Hello),
            sense: scheduler.register(Task::SenseStart),
            sense_rate: scheduler.register(Task::SenseSample),
            assignment: scheduler.register(Task::Assignment),
            switch: scheduler.register(Task::ReceiveSwitch),
            neighbor_switch: scheduler.register(Task::NeighborSwitch),
            tx: scheduler.register(Task::TxRoundRobin(min_channel)),
            rx_poll: scheduler.register(Task::RxPoll),
        }
    }
}

/// Per-channel decision loss from the latest assignment cycle.
pub type LossMap = BTreeMap<ChannelId, f64>;

/// The channel assignment node.
///
/// Generic over:
/// - `T`: Transport (both radios)
/// - `R`: Random number generator
/// - `Clk`: Clock
/// - `O`: Channel interference oracle
/// - `Rt`: Static route lookup
pub struct Node<T, R, Clk, O, Rt> {
    // Dependencies (injected)
    transport: T,
    random: R,
    clock: Clk,
    oracle: O,
    routes: Rt,

    // Application-level channels
    app_incoming: AppInChannel,
    app_outgoing: AppOutChannel,
    events: EventChannel,

    // Identity and configuration
    node_id: NodeId,
    config: SicaConfig,

    // Receive radio
    rx_channel: ChannelId,
    new_rx_channel: ChannelId,
    seq: u32,

    // Tables
    neighbors: NeighborTable,
    channels: ChannelTable,
    queues: ChannelQueueSet,
    losses: LossMap,
    sensing: SensingEngine,

    // Scheduling
    scheduler: Scheduler<Task>,
    timers: Timers,
    initialized: bool,

    metrics: NodeMetrics,
}

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Create a node. The configuration is validated here, once.
    pub fn new(
        transport: T,
        random: R,
        clock: Clk,
        oracle: O,
        routes: Rt,
        node_id: NodeId,
        config: SicaConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut scheduler = Scheduler::new();
        let timers = Timers::register(&mut scheduler, config.min_channel);
        let min_channel = config.min_channel;

        Ok(Self {
            transport,
            random,
            clock,
            oracle,
            routes,

            app_incoming: Channel::new(),
            app_outgoing: Channel::new(),
            events: Channel::new(),

            node_id,
            config,

            rx_channel: min_channel,
            new_rx_channel: min_channel,
            seq: 0,

            neighbors: NeighborTable::new(node_id),
            channels: ChannelTable::new(),
            queues: ChannelQueueSet::new(),
            losses: LossMap::new(),
            sensing: SensingEngine::new(),

            scheduler,
            timers,
            initialized: false,

            metrics: NodeMetrics::default(),
        })
    }

    /// Set up queues and channel entries, pick a random receive channel,
    /// arm the periodic timers and send the first hello.
    pub fn initialize(&mut self, now: Timestamp) {
        if self.initialized {
            return;
        }
        let capacity = self.config.channel_capacity;
        let bx_expire = self.config.bx_expire;
        for ch in self.config.channels() {
            self.queues.create(ch);
            self.channels
                .update_or_insert(ch, capacity, 0, 0, bx_expire, now);
            self.channels.set_weight(ch, 1.0);
            self.losses.insert(ch, 0.0);
        }

        let (min, max) = (self.config.min_channel, self.config.max_channel);
        let rx = self.random.gen_range(min as u64, max as u64 + 1) as ChannelId;
        self.rx_channel = rx;
        self.new_rx_channel = rx;
        self.transport.set_channel(Radio::Receive, rx, now);
        self.transport.set_channel(Radio::Transmit, min, now);

        let t = self.timers;
        let c = &self.config;
        self.scheduler.schedule_after(t.hello, now, c.hello_interval);
        self.scheduler.schedule_after(t.sense, now, c.sense_interval);
        self.scheduler
            .schedule_after(t.assignment, now, c.assignment_interval);
        self.scheduler
            .schedule_with(t.tx, Task::TxRoundRobin(min), now, c.tx_dwell);
        self.scheduler.schedule_after(t.rx_poll, now, c.rx_poll_interval);
        self.initialized = true;

        log!(
            Level::Info,
            "node {}: initialized on receive channel {} (channels {}..={})",
            self.node_id,
            rx,
            min,
            max
        );
        self.create_hello(now);
    }

    /// Handle a frame from the receive radio. Returns whether it was accepted.
    pub fn handle_transport_rx(&mut self, frame: Received, now: Timestamp) -> bool {
        if !self.initialized {
            return false;
        }
        if frame.port == self.config.hello_port {
            self.process_hello(&frame.payload, frame.src, now)
        } else if frame.port == self.config.data_port {
            self.process_data(&frame.payload, now)
        } else {
            log!(
                Level::Debug,
                "node {}: frame on unknown port {}",
                self.node_id,
                frame.port
            );
            false
        }
    }

    /// Run every task due at or before `now`, in deadline order.
    pub fn handle_timer(&mut self, now: Timestamp) {
        while let Some(task) = self.scheduler.pop_due(now) {
            self.run_task(task, now);
        }
    }

    fn run_task(&mut self, task: Task, now: Timestamp) {
        match task {
            Task::Hello => self.create_hello(now),
            Task::SenseStart => self.start_sensing(now),
            Task::SenseSample => self.sample_channel(now),
            Task::SenseEnd => self.end_sensing(now),
            Task::ForeignSenseBegin(ch) => self.channels.begin_sensing(ch),
            Task::ForeignSenseEnd(ch) => self.channels.end_sensing(ch),
            Task::Assignment => self.run_assignment(now),
            Task::ReceiveSwitch => self.switch_receive_radio(now),
            Task::NeighborSwitch => self.handle_neighbor_switches(now),
            Task::TxRoundRobin(ch) => self.tx_round_robin(ch, now),
            Task::TxSend(ch) => self.tx_send(ch, now),
            Task::RxPoll => self.rx_poll(now),
            Task::Transmit(frame) => {
                self.push_frame(frame);
            }
        }
    }

    /// Earliest pending timer deadline.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.scheduler.next_deadline()
    }

    /// Run the node's main loop.
    ///
    /// Initializes the node if needed, then waits for received frames,
    /// application sends and timer deadlines forever.
    pub async fn run(&mut self) -> ! {
        use embassy_futures::select::{select3, Either3};

        let now = self.clock.now();
        self.initialize(now);

        loop {
            let wake = self
                .next_wakeup()
                .unwrap_or_else(|| self.clock.now() + Duration::from_secs(60));

            let result = select3(
                self.transport.incoming().receive(),
                self.app_outgoing.receive(),
                self.clock.sleep_until(wake),
            )
            .await;

            let now = self.clock.now();
            match result {
                Either3::First(frame) => {
                    self.handle_transport_rx(frame, now);
                }
                Either3::Second(data) => {
                    if let Err(e) = self.send_data(data.target, data.payload, now) {
                        log!(Level::Debug, "node {}: send failed: {}", self.node_id, e);
                    }
                }
                Either3::Third(()) => self.handle_timer(now),
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &SicaConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Channel the receive radio is on.
    pub fn rx_channel(&self) -> ChannelId {
        self.rx_channel
    }

    /// Target receive channel; equals [`rx_channel`](Self::rx_channel) when no switch is pending.
    pub fn pending_channel(&self) -> ChannelId {
        self.new_rx_channel
    }

    pub fn switch_pending(&self) -> bool {
        self.new_rx_channel != self.rx_channel
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn queues(&self) -> &ChannelQueueSet {
        &self.queues
    }

    /// Per-channel losses of the latest assignment cycle.
    pub fn losses(&self) -> &LossMap {
        &self.losses
    }

    pub fn sensing(&self) -> &SensingEngine {
        &self.sensing
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Channel for data delivered to this node.
    pub fn incoming(&self) -> &AppInChannel {
        &self.app_incoming
    }

    /// Channel the application sends data into; consumed by `run()`.
    pub fn outgoing(&self) -> &AppOutChannel {
        &self.app_outgoing
    }

    /// Channel for protocol events.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn clock(&self) -> &Clk {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // Crate-internal accessors for the protocol modules.

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn random_mut(&mut self) -> &mut R {
        &mut self.random
    }

    pub(crate) fn routes(&self) -> &Rt {
        &self.routes
    }

    pub(crate) fn neighbors_mut(&mut self) -> &mut NeighborTable {
        &mut self.neighbors
    }

    pub(crate) fn channels_mut(&mut self) -> &mut ChannelTable {
        &mut self.channels
    }

    pub(crate) fn queues_mut(&mut self) -> &mut ChannelQueueSet {
        &mut self.queues
    }

    pub(crate) fn losses_mut(&mut self) -> &mut LossMap {
        &mut self.losses
    }

    pub(crate) fn sensing_mut(&mut self) -> &mut SensingEngine {
        &mut self.sensing
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut NodeMetrics {
        &mut self.metrics
    }

    pub(crate) fn scheduler(&self) -> &Scheduler<Task> {
        &self.scheduler
    }

    pub(crate) fn scheduler_mut(&mut self) -> &mut Scheduler<Task> {
        &mut self.scheduler
    }

    pub(crate) fn timers(&self) -> Timers {
        self.timers
    }

    pub(crate) fn set_rx_channel(&mut self, channel: ChannelId) {
        self.rx_channel = channel;
    }

    pub(crate) fn set_pending_channel(&mut self, channel: ChannelId) {
        self.new_rx_channel = channel;
    }

    /// Next sequence number; zero is skipped because it marks invalid hellos.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    /// Push a frame to the transport. Returns false when the outgoing channel is full.
    pub(crate) fn push_frame(&mut self, frame: Frame) -> bool {
        let is_hello = frame.port == self.config.hello_port;
        let channel = frame.channel;
        let seq = frame
            .payload
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0);
        if self.transport.outgoing().try_send(frame).is_err() {
            self.metrics.frames_blocked += 1;
            log!(Level::Debug, "node {}: transport queue full", self.node_id);
            return false;
        }
        if is_hello {
            self.metrics.hellos_sent += 1;
            self.push_event(Event::HelloSent { channel, seq });
        }
        true
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        if self.events.try_send(event).is_err() {
            self.metrics.events_dropped += 1;
        }
    }

    pub(crate) fn push_incoming_data(&mut self, from: NodeId, payload: Vec<u8>) {
        if self
            .app_incoming
            .try_send(IncomingData { from, payload })
            .is_err()
        {
            log!(
                Level::Debug,
                "node {}: application queue full, data from {} discarded",
                self.node_id,
                from
            );
        }
    }
}
