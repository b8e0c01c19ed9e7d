//! Event types and priority queue ordering for discrete event simulation.

use std::cmp::Ordering;

use sica::{ChannelId, Duration, Frame, NodeId, Payload, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Scenario actions that can be scheduled during simulation.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Partition the network into isolated groups.
    Partition { groups: Vec<Vec<NodeId>> },
    /// Re-enable every link.
    HealPartition,
    DisableLink { from: NodeId, to: NodeId },
    EnableLink { from: NodeId, to: NodeId },
    SetLossRate { from: NodeId, to: NodeId, rate: f64 },
    /// Start external interference on a channel; a zero busy duration stops it.
    SetChannelBusy {
        channel: ChannelId,
        busy_duration: Duration,
    },
    /// Record the channel assignment of every node.
    TakeSnapshot,
}

/// Events in the discrete event simulation.
#[derive(Debug, Clone)]
pub enum Event {
    /// A frame finished arriving at a node in range of the sender.
    FrameArrival { to: NodeId, from: NodeId, frame: Frame },
    /// A node's earliest protocol timer is due.
    NodeWake { node: NodeId, at: Timestamp },
    /// Application sends data from one node to another.
    AppSend {
        from: NodeId,
        to: NodeId,
        payload: Payload,
    },
    /// Next packet of a traffic flow.
    FlowTick { flow: usize },
    /// Execute a scenario action.
    ScenarioAction(ScenarioAction),
}

/// A scheduled event with timestamp and sequence number for ordering.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    /// Tie breaker for events at the same instant.
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

// Reversed so that BinaryHeap (a max-heap) pops the earliest event first.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn wake(node: NodeId, time: Timestamp, seq: u64) -> ScheduledEvent {
        ScheduledEvent::new(
            time,
            SequenceNumber::new(seq),
            Event::NodeWake { node, at: time },
        )
    }

    #[test]
    fn test_earlier_event_pops_first() {
        let late = wake(1, Timestamp::from_secs(10), 1);
        let early = wake(2, Timestamp::from_micros(5), 2);
        assert!(early > late);

        let mut heap = BinaryHeap::new();
        heap.push(late);
        heap.push(early);
        assert_eq!(heap.pop().unwrap().time, Timestamp::from_micros(5));
    }

    #[test]
    fn test_same_time_keeps_insertion_order() {
        let t = Timestamp::from_millis(3);
        let mut heap = BinaryHeap::new();
        for seq in [4, 1, 3, 2] {
            heap.push(wake(seq as NodeId, t, seq));
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.seq.value())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }
}
