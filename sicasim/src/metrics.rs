//! Metrics collection for simulation analysis.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use sica::{ChannelId, Duration, NodeId, Timestamp};

/// Channel assignment of every node at one instant.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub time: Timestamp,
    /// Receive channel of each node.
    pub rx_channels: HashMap<NodeId, ChannelId>,
    /// Channel each node is about to move to, when different.
    pub pending: HashMap<NodeId, ChannelId>,
    /// Packets queued at each node.
    pub backlog: HashMap<NodeId, usize>,
}

impl ChannelSnapshot {
    pub fn new(time: Timestamp) -> Self {
        Self {
            time,
            rx_channels: HashMap::new(),
            pending: HashMap::new(),
            backlog: HashMap::new(),
        }
    }

    pub fn record_node(
        &mut self,
        node: NodeId,
        rx_channel: ChannelId,
        pending: ChannelId,
        backlog: usize,
    ) {
        self.rx_channels.insert(node, rx_channel);
        if pending != rx_channel {
            self.pending.insert(node, pending);
        }
        self.backlog.insert(node, backlog);
    }

    /// Number of nodes listening on each channel.
    pub fn histogram(&self) -> BTreeMap<ChannelId, usize> {
        let mut counts = BTreeMap::new();
        for &ch in self.rx_channels.values() {
            *counts.entry(ch).or_insert(0) += 1;
        }
        counts
    }

    /// Channels with at least one listener.
    pub fn distinct_channels(&self) -> usize {
        self.histogram().len()
    }

    /// Largest number of nodes sharing one receive channel.
    pub fn max_co_channel(&self) -> usize {
        self.histogram().values().copied().max().unwrap_or(0)
    }

    pub fn switches_pending(&self) -> usize {
        self.pending.len()
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on the air.
    pub frames_sent: u64,
    /// Frames handed to a receiving node.
    pub frames_delivered: u64,
    /// Frames lost to the link loss rate.
    pub frames_lost: u64,
    /// Frames that arrived on a channel busy with external traffic.
    pub frames_collided: u64,
    /// Frames that reached a node whose receive radio was elsewhere.
    pub frames_missed: u64,
    /// Application packets handed to a node.
    pub data_sent: u64,
    /// Application packets refused by the node.
    pub data_refused: u64,
    /// Packets dropped inside the mesh (no route, unknown next hop...).
    pub data_dropped: u64,
    pub data_delivered: u64,
    /// Sum of one-way delays of delivered packets.
    pub total_delay: Duration,
    /// Receive radio switches across all nodes.
    pub channel_switches: u64,
    /// External load estimates: (node, channel, bandwidth).
    pub bandwidth_samples: Vec<(NodeId, ChannelId, u32)>,
    pub snapshots: Vec<ChannelSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: ChannelSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&ChannelSnapshot> {
        self.snapshots.last()
    }

    /// Delivered over accepted packets, 0 when nothing was sent.
    pub fn delivery_ratio(&self) -> f64 {
        let accepted = self.data_sent - self.data_refused;
        if accepted == 0 {
            return 0.0;
        }
        self.data_delivered as f64 / accepted as f64
    }

    pub fn mean_delay(&self) -> Option<Duration> {
        if self.data_delivered == 0 {
            return None;
        }
        Some(Duration::from_micros(
            self.total_delay.as_micros() / self.data_delivered,
        ))
    }

    /// First snapshot in which every node listens on a distinct channel.
    pub fn spread_time(&self) -> Option<Timestamp> {
        self.snapshots
            .iter()
            .find(|s| !s.rx_channels.is_empty() && s.max_co_channel() == 1)
            .map(|s| s.time)
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub end_time: Timestamp,
    pub metrics: SimMetrics,
    /// Whether simulation ended due to event queue exhaustion (vs time limit).
    pub queue_exhausted: bool,
}

impl SimulationResult {
    pub fn delivery_ratio(&self) -> f64 {
        self.metrics.delivery_ratio()
    }

    pub fn final_distinct_channels(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.distinct_channels())
            .unwrap_or(0)
    }

    pub fn final_max_co_channel(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.max_co_channel())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_histogram() {
        let mut snapshot = ChannelSnapshot::new(Timestamp::ZERO);
        snapshot.record_node(1, 3, 3, 0);
        snapshot.record_node(2, 3, 5, 2);
        snapshot.record_node(3, 7, 7, 1);

        assert_eq!(snapshot.histogram().into_iter().collect::<Vec<_>>(), vec![(3, 2), (7, 1)]);
        assert_eq!(snapshot.distinct_channels(), 2);
        assert_eq!(snapshot.max_co_channel(), 2);
        assert_eq!(snapshot.switches_pending(), 1);
        assert_eq!(snapshot.backlog[&2], 2);
    }

    #[test]
    fn test_spread_time() {
        let mut metrics = SimMetrics::new();

        let mut s1 = ChannelSnapshot::new(Timestamp::from_secs(4));
        s1.record_node(1, 2, 2, 0);
        s1.record_node(2, 2, 2, 0);
        metrics.add_snapshot(s1);

        let mut s2 = ChannelSnapshot::new(Timestamp::from_secs(8));
        s2.record_node(1, 2, 2, 0);
        s2.record_node(2, 6, 6, 0);
        metrics.add_snapshot(s2);

        assert_eq!(metrics.spread_time(), Some(Timestamp::from_secs(8)));
    }

    #[test]
    fn test_delivery_ratio_and_delay() {
        let mut metrics = SimMetrics::new();
        assert_eq!(metrics.delivery_ratio(), 0.0);
        assert_eq!(metrics.mean_delay(), None);

        metrics.data_sent = 10;
        metrics.data_refused = 2;
        metrics.data_delivered = 6;
        metrics.total_delay = Duration::from_millis(12);
        assert!((metrics.delivery_ratio() - 0.75).abs() < 1e-12);
        assert_eq!(metrics.mean_delay(), Some(Duration::from_millis(2)));
    }
}
