//! Scenario builder for setting up and running simulations.

use sica::{ChannelId, ConfigError, Duration, NodeId, SicaConfig, Timestamp};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::sim::Simulator;
use crate::topology::Topology;

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    /// Each node connected only to its predecessor and successor.
    Chain,
    /// First node is the hub.
    Star,
    /// Row-major grid of the given width.
    Grid { width: usize },
    Custom(Topology),
}

/// Application flow between node indices.
#[derive(Debug, Clone)]
struct FlowSpec {
    src: usize,
    dst: usize,
    interval: Duration,
    payload_size: usize,
}

/// Builder for simulation scenarios.
///
/// Nodes get IDs `1..=num_nodes`; node indices passed to the builder are
/// zero based.
pub struct ScenarioBuilder {
    num_nodes: usize,
    /// RNG seed for determinism.
    seed: u64,
    topology_type: TopologyType,
    /// Global frame loss rate.
    loss_rate: f64,
    /// Link delay, `None` keeps the link default.
    delay: Option<Duration>,
    config: SicaConfig,
    /// External traffic running from time zero.
    busy_channels: Vec<(ChannelId, Duration)>,
    flows: Vec<FlowSpec>,
    traffic_start: Timestamp,
    traffic_stop: Option<Timestamp>,
    /// Scheduled actions. Partition groups hold node indices until build.
    actions: Vec<(Timestamp, ScenarioAction)>,
    snapshot_interval: Option<Duration>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Create a fully connected scenario running the accelerated timers.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            loss_rate: 0.0,
            delay: None,
            config: SicaConfig::accelerated(),
            busy_channels: Vec::new(),
            flows: Vec::new(),
            traffic_start: Timestamp::from_secs(1),
            traffic_stop: None,
            actions: Vec::new(),
            snapshot_interval: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: SicaConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a custom network topology over node IDs `1..=num_nodes`.
    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    pub fn grid_topology(mut self, width: usize) -> Self {
        self.topology_type = TopologyType::Grid { width };
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// External traffic on `channel` with busy periods of `busy_duration`.
    pub fn with_busy_channel(mut self, channel: ChannelId, busy_duration: Duration) -> Self {
        self.busy_channels.push((channel, busy_duration));
        self
    }

    /// Periodic traffic from node index `src` to node index `dst`.
    pub fn with_flow(mut self, src: usize, dst: usize, interval: Duration, payload_size: usize) -> Self {
        self.flows.push(FlowSpec {
            src,
            dst,
            interval,
            payload_size,
        });
        self
    }

    /// When flows start (default 1 s, after the first hello round).
    pub fn traffic_start(mut self, time: Timestamp) -> Self {
        self.traffic_start = time;
        self
    }

    pub fn traffic_stop(mut self, time: Timestamp) -> Self {
        self.traffic_stop = Some(time);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    /// Schedule a network partition; groups hold node indices.
    pub fn partition_at(mut self, time: Timestamp, groups: Vec<Vec<usize>>) -> Self {
        self.actions.push((
            time,
            ScenarioAction::Partition {
                groups: groups
                    .into_iter()
                    .map(|g| g.into_iter().map(|i| i as NodeId).collect())
                    .collect(),
            },
        ));
        self
    }

    pub fn heal_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::HealPartition));
        self
    }

    /// Start or stop external traffic on `channel` at `time`.
    pub fn channel_busy_at(mut self, time: Timestamp, channel: ChannelId, busy_duration: Duration) -> Self {
        self.actions.push((
            time,
            ScenarioAction::SetChannelBusy {
                channel,
                busy_duration,
            },
        ));
        self
    }

    pub fn snapshot_at(mut self, time: Timestamp) -> Self {
        self.actions.push((time, ScenarioAction::TakeSnapshot));
        self
    }

    /// Build the simulator with all nodes, topology, traffic and actions.
    pub fn build(self) -> Result<(Simulator, Vec<NodeId>), ConfigError> {
        self.config.validate()?;
        let mut sim = Simulator::new(self.seed, self.config.clone());
        if let Some(interval) = self.snapshot_interval {
            sim = sim.with_snapshot_interval(interval);
        }

        for &(channel, busy) in &self.busy_channels {
            sim.set_channel_busy(channel, busy);
        }

        let node_ids: Vec<NodeId> = (1..=self.num_nodes as NodeId).collect();
        for &id in &node_ids {
            sim.add_node(id)?;
        }

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&node_ids),
            TopologyType::Chain => Topology::chain(&node_ids),
            TopologyType::Star => Topology::star(&node_ids),
            TopologyType::Grid { width } => Topology::grid(&node_ids, width),
            TopologyType::Custom(t) => t,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        if let Some(delay) = self.delay {
            topo.set_global_delay(delay);
        }
        let mut sim = sim.with_topology(topo);

        let id_of = |idx: usize| node_ids.get(idx).copied();
        for flow in &self.flows {
            let (Some(src), Some(dst)) = (id_of(flow.src), id_of(flow.dst)) else {
                continue;
            };
            sim.add_flow(
                src,
                dst,
                flow.interval,
                flow.payload_size,
                self.traffic_start,
                self.traffic_stop,
            );
        }

        for (time, action) in self.actions {
            let action = match action {
                ScenarioAction::Partition { groups } => ScenarioAction::Partition {
                    groups: groups
                        .into_iter()
                        .map(|g| g.into_iter().filter_map(|i| id_of(i as usize)).collect())
                        .collect(),
                },
                other => other,
            };
            sim.schedule_action(time, action);
        }

        Ok((sim, node_ids))
    }

    /// Build and run the simulation for the specified duration.
    pub fn run_for(self, duration: Duration) -> Result<SimulationResult, ConfigError> {
        let (mut sim, _) = self.build()?;
        Ok(sim.run_for(duration))
    }

    /// Build and run until the specified time.
    pub fn run_until(self, time: Timestamp) -> Result<SimulationResult, ConfigError> {
        let (mut sim, _) = self.build()?;
        Ok(sim.run_until(time))
    }
}

/// N-node fully connected scenario.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}

/// Fully connected scenario with 8 ms busy periods on `busy` channels.
pub fn interference_scenario(num_nodes: usize, busy: &[ChannelId]) -> ScenarioBuilder {
    busy.iter().fold(simple_scenario(num_nodes), |builder, &ch| {
        builder.with_busy_channel(ch, Duration::from_millis(8))
    })
}
