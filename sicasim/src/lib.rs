//! sicasim - Discrete event simulator for the sica channel assignment engine.
//!
//! Runs many dual-radio sica nodes in one process, against emulated
//! channels, without real-time delays. Every run is reproducible from its
//! seed.
//!
//! # Features
//!
//! - **Dual-radio transport model**: per-radio channel, retune delay and
//!   back-to-back airtime at 11 Mbit/s
//! - **Channel emulation**: external traffic with configurable busy periods
//! - **Configurable topology**: fully connected, chain, star, grid or custom,
//!   with per-link loss and delay
//! - **Traffic flows**: periodic application packets between nodes
//! - **Metrics collection**: channel snapshots, delivery ratio and delay,
//!   bandwidth samples
//!
//! # Example
//!
//! ```
//! use sicasim::{Duration, ScenarioBuilder};
//!
//! let result = ScenarioBuilder::new(3)
//!     .with_seed(7)
//!     .run_for(Duration::from_secs(2))
//!     .unwrap();
//!
//! assert!(result.metrics.frames_delivered > 0);
//! ```
//!
//! # Architecture
//!
//! The simulator keeps a priority queue of events ordered by
//! (time, sequence number). The main loop:
//! 1. Pop next event from queue
//! 2. Advance simulation time
//! 3. Process event (call node handlers)
//! 4. Collect outgoing frames and node events
//! 5. Route frames through the topology, schedule arrivals and the next wake
//!
//! Handlers (`handle_transport_rx`, `handle_timer`) are called directly
//! instead of the async `Node::run` loop.

pub mod emulation;
pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod sim;
pub mod topology;

pub use emulation::{ChannelEmulator, SharedChannels};
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{ChannelSnapshot, SimMetrics, SimulationResult};
pub use node::{SharedRoutes, SimNode, SimTransport};
pub use scenario::{interference_scenario, simple_scenario, ScenarioBuilder};
pub use sica::{ChannelId, Duration, NodeId, Timestamp};
pub use sim::{Flow, Simulator};
pub use topology::{Link, Topology};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_keeps_its_channel() {
        let result = ScenarioBuilder::new(1)
            .with_seed(42)
            .run_for(Duration::from_secs(5))
            .unwrap();

        let snapshot = result.metrics.latest_snapshot().unwrap();
        assert_eq!(snapshot.rx_channels.len(), 1);
        assert_eq!(result.metrics.frames_delivered, 0);
        // bootstrap round plus hello rounds at 1, 2, 3 and 4 s on 8 channels
        assert!(result.metrics.frames_sent >= 8 * 5);
    }

    #[test]
    fn test_two_nodes_discover_each_other() {
        let (mut sim, nodes) = ScenarioBuilder::new(2).with_seed(42).build().unwrap();
        sim.run_for(Duration::from_millis(1500));

        for &id in &nodes {
            let node = sim.node(id).unwrap();
            let other = if id == nodes[0] { nodes[1] } else { nodes[0] };
            let peer = sim.node(other).unwrap();
            assert_eq!(
                node.inner().neighbors().channel_of(other),
                Some(peer.rx_channel())
            );
            assert!(node.inner().metrics().hellos_received > 0);
        }
    }

    #[test]
    fn test_chain_delivers_multi_hop_flow() {
        let result = ScenarioBuilder::new(3)
            .with_seed(9)
            .chain_topology()
            .with_flow(0, 2, Duration::from_millis(50), 200)
            .traffic_start(Timestamp::from_secs(1))
            .traffic_stop(Timestamp::from_millis(3500))
            .run_until(Timestamp::from_millis(3900))
            .unwrap();

        let metrics = &result.metrics;
        assert_eq!(metrics.data_sent, 50);
        assert_eq!(metrics.data_refused, 0);
        assert!(
            result.delivery_ratio() > 0.5,
            "delivered {} of {}",
            metrics.data_delivered,
            metrics.data_sent
        );
        assert!(metrics.mean_delay().is_some_and(|d| d > Duration::ZERO));
    }

    #[test]
    fn test_busy_channels_are_sensed() {
        let busy: Vec<ChannelId> = (1..=8).collect();
        let result = interference_scenario(3, &busy)
            .with_seed(5)
            .run_for(Duration::from_secs(3))
            .unwrap();

        let samples = &result.metrics.bandwidth_samples;
        assert!(samples.len() >= 3);
        // channels are busy most of the time, capacity is 11
        assert!(samples.iter().all(|&(_, _, bw)| (1..=11).contains(&bw)));
    }

    #[test]
    fn test_partitioned_neighbors_expire() {
        let (mut sim, nodes) = ScenarioBuilder::new(2)
            .partition_at(Timestamp::from_millis(500), vec![vec![0], vec![1]])
            .build()
            .unwrap();

        sim.run_until(Timestamp::from_millis(400));
        assert_eq!(sim.node(nodes[0]).unwrap().inner().neighbors().len(), 1);

        sim.run_until(Timestamp::from_millis(3500));
        for &id in &nodes {
            assert!(sim.node(id).unwrap().inner().neighbors().is_empty());
        }
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = |seed: u64| {
            let (mut sim, nodes) = ScenarioBuilder::new(4)
                .with_seed(seed)
                .with_flow(0, 3, Duration::from_millis(100), 64)
                .build()
                .unwrap();
            let result = sim.run_for(Duration::from_secs(5));
            let channels: Vec<ChannelId> = nodes
                .iter()
                .map(|&id| sim.node(id).unwrap().rx_channel())
                .collect();
            (
                channels,
                result.metrics.frames_sent,
                result.metrics.frames_delivered,
                result.metrics.data_delivered,
            )
        };

        assert_eq!(run(11), run(11));
    }
}
