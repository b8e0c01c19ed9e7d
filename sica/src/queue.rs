//! Per-channel transmit queues.
//!
//! Every channel owns one FIFO of hellos and one of data packets. Packets
//! wait in the queue of the channel their receiver listens on, so when a
//! neighbor moves its receive radio the packets for it move with it.
//!
//! Expiry is lazy: size queries and peeks purge first. Sending is two-phase
//! (`peek` then `erase_front`) so a blocked transmission never loses the
//! packet.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::time::Timestamp;
use crate::types::{ChannelId, NodeId, PacketKind};
use crate::wire::DataHeader;

/// One queued packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub kind: PacketKind,
    /// Encoded frame payload.
    pub bytes: Vec<u8>,
    pub expires_at: Timestamp,
    /// Data only: origin of the packet.
    pub origin: Option<NodeId>,
    /// Data only: final destination.
    pub dest: Option<NodeId>,
    /// Data only: neighbor the packet is addressed to on this link.
    pub next_hop: Option<NodeId>,
}

impl QueueEntry {
    pub fn hello(bytes: Vec<u8>, expires_at: Timestamp) -> Self {
        Self {
            kind: PacketKind::Hello,
            bytes,
            expires_at,
            origin: None,
            dest: None,
            next_hop: None,
        }
    }

    pub fn data(header: &DataHeader, bytes: Vec<u8>, expires_at: Timestamp) -> Self {
        Self {
            kind: PacketKind::Data,
            bytes,
            expires_at,
            origin: Some(header.origin),
            dest: Some(header.dest),
            next_hop: Some(header.next_hop),
        }
    }

    fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

#[derive(Default, Debug)]
struct ChannelQueue {
    hello: VecDeque<QueueEntry>,
    data: VecDeque<QueueEntry>,
    closed: bool,
}

impl ChannelQueue {
    fn fifo(&self, kind: PacketKind) -> &VecDeque<QueueEntry> {
        match kind {
            PacketKind::Hello => &self.hello,
            PacketKind::Data => &self.data,
        }
    }

    fn fifo_mut(&mut self, kind: PacketKind) -> &mut VecDeque<QueueEntry> {
        match kind {
            PacketKind::Hello => &mut self.hello,
            PacketKind::Data => &mut self.data,
        }
    }

    fn purge(&mut self, now: Timestamp) {
        // Migration can append older packets behind newer ones, so sweep it all.
        self.hello.retain(|e| !e.is_expired(now));
        self.data.retain(|e| !e.is_expired(now));
    }
}

/// Queues of every channel, indexed by channel id.
#[derive(Default)]
pub struct ChannelQueueSet {
    queues: HashMap<ChannelId, ChannelQueue>,
}

impl ChannelQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `channel` has an (open) queue.
    pub fn create(&mut self, channel: ChannelId) {
        self.queues.entry(channel).or_default().closed = false;
    }

    /// Append to the FIFO matching the entry kind. Creates or reopens the queue.
    pub fn enqueue(&mut self, channel: ChannelId, entry: QueueEntry) {
        let queue = self.queues.entry(channel).or_default();
        queue.closed = false;
        queue.fifo_mut(entry.kind).push_back(entry);
    }

    /// Live entries of one kind. Purges first; closed or unknown queues are empty.
    pub fn len(&mut self, channel: ChannelId, kind: PacketKind, now: Timestamp) -> usize {
        match self.queues.get_mut(&channel) {
            Some(q) if !q.closed => {
                q.purge(now);
                q.fifo(kind).len()
            }
            _ => 0,
        }
    }

    /// True when both FIFOs of `channel` hold no live entry.
    pub fn is_empty(&mut self, channel: ChannelId, now: Timestamp) -> bool {
        self.len(channel, PacketKind::Hello, now) == 0
            && self.len(channel, PacketKind::Data, now) == 0
    }

    /// Drop every expired entry of `channel`.
    pub fn purge(&mut self, channel: ChannelId, now: Timestamp) {
        if let Some(q) = self.queues.get_mut(&channel) {
            q.purge(now);
        }
    }

    /// Copy of the front entry after purging. The entry stays queued.
    pub fn peek(&mut self, channel: ChannelId, kind: PacketKind, now: Timestamp) -> Option<QueueEntry> {
        let q = self.queues.get_mut(&channel)?;
        if q.closed {
            return None;
        }
        q.purge(now);
        q.fifo(kind).front().cloned()
    }

    /// Remove the front entry after a successful send.
    pub fn erase_front(&mut self, channel: ChannelId, kind: PacketKind) -> Option<QueueEntry> {
        self.queues
            .get_mut(&channel)
            .and_then(|q| q.fifo_mut(kind).pop_front())
    }

    /// Position of the first data entry for next hop `neighbor`.
    pub fn find_for_destination(&self, channel: ChannelId, neighbor: NodeId) -> Option<usize> {
        self.queues
            .get(&channel)?
            .data
            .iter()
            .position(|e| e.next_hop == Some(neighbor))
    }

    /// Drop every data entry for next hop `neighbor`. Returns how many went.
    pub fn erase_for_destination(&mut self, channel: ChannelId, neighbor: NodeId) -> usize {
        let Some(q) = self.queues.get_mut(&channel) else {
            return 0;
        };
        let before = q.data.len();
        q.data.retain(|e| e.next_hop != Some(neighbor));
        before - q.data.len()
    }

    /// Move entries from `from` to `to`, keeping their relative order.
    ///
    /// With a filter only the data entries for that next hop move. Without
    /// one the whole queue moves, data first, then hellos. Returns the
    /// number of entries moved.
    pub fn migrate(&mut self, from: ChannelId, to: ChannelId, neighbor: Option<NodeId>) -> usize {
        if from == to {
            return 0;
        }
        let Some(source) = self.queues.get_mut(&from) else {
            return 0;
        };

        let mut moved: Vec<QueueEntry> = Vec::new();
        match neighbor {
            Some(id) => {
                let mut kept = VecDeque::with_capacity(source.data.len());
                for entry in source.data.drain(..) {
                    if entry.next_hop == Some(id) {
                        moved.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                source.data = kept;
            }
            None => {
                moved.extend(source.data.drain(..));
                moved.extend(source.hello.drain(..));
            }
        }

        let count = moved.len();
        if count > 0 {
            let target = self.queues.entry(to).or_default();
            target.closed = false;
            for entry in moved {
                target.fifo_mut(entry.kind).push_back(entry);
            }
        }
        count
    }

    /// Mark `channel` closed and drop everything in it. The next enqueue reopens it.
    pub fn close(&mut self, channel: ChannelId) {
        let q = self.queues.entry(channel).or_default();
        q.closed = true;
        q.hello.clear();
        q.data.clear();
    }

    pub fn is_closed(&self, channel: ChannelId) -> bool {
        self.queues.get(&channel).is_some_and(|q| q.closed)
    }

    /// Number of distinct data origins waiting on `channel`.
    pub fn flow_count(&self, channel: ChannelId) -> usize {
        self.queues.get(&channel).map_or(0, |q| {
            q.data
                .iter()
                .filter_map(|e| e.origin)
                .collect::<BTreeSet<_>>()
                .len()
        })
    }

    /// Entries of one kind without purging, in queue order.
    pub fn entries(&self, channel: ChannelId, kind: PacketKind) -> impl Iterator<Item = &QueueEntry> {
        self.queues
            .get(&channel)
            .into_iter()
            .flat_map(move |q| q.fifo(kind).iter())
    }

    /// Entries of both kinds without purging.
    pub fn total_len(&self, channel: ChannelId) -> usize {
        self.queues
            .get(&channel)
            .map_or(0, |q| q.hello.len() + q.data.len())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn data(origin: NodeId, next_hop: NodeId, tag: u8, expires_ms: u64) -> QueueEntry {
        let header = DataHeader {
            seq: tag as u32,
            origin,
            dest: next_hop,
            next_hop,
            origin_time: Timestamp::ZERO,
        };
        QueueEntry::data(&header, vec![tag], Timestamp::from_millis(expires_ms))
    }

    fn tags(set: &ChannelQueueSet, channel: ChannelId, kind: PacketKind) -> Vec<u8> {
        set.entries(channel, kind).map(|e| e.bytes[0]).collect()
    }

    #[test]
    fn test_peek_then_erase() {
        let mut set = ChannelQueueSet::new();
        let now = Timestamp::ZERO;
        set.enqueue(1, data(1, 2, 10, 100));
        set.enqueue(1, data(1, 2, 11, 100));

        let first = set.peek(1, PacketKind::Data, now).unwrap();
        assert_eq!(first.bytes, vec![10]);
        assert_eq!(set.len(1, PacketKind::Data, now), 2);

        set.erase_front(1, PacketKind::Data);
        assert_eq!(set.peek(1, PacketKind::Data, now).unwrap().bytes, vec![11]);
        assert_eq!(set.len(1, PacketKind::Hello, now), 0);
    }

    #[test]
    fn test_purge_drops_expired_everywhere() {
        let mut set = ChannelQueueSet::new();
        set.enqueue(1, data(1, 2, 1, 50));
        set.enqueue(1, data(1, 2, 2, 200));
        set.enqueue(1, data(1, 2, 3, 10));
        set.enqueue(1, QueueEntry::hello(vec![9], Timestamp::from_millis(20)));

        let now = Timestamp::from_millis(50);
        set.purge(1, now);
        assert!(set
            .entries(1, PacketKind::Data)
            .chain(set.entries(1, PacketKind::Hello))
            .all(|e| e.expires_at >= now));
        assert_eq!(tags(&set, 1, PacketKind::Data), vec![1, 2]);
        assert_eq!(set.len(1, PacketKind::Hello, now), 0);
    }

    #[test]
    fn test_unknown_and_closed_channels_read_empty() {
        let mut set = ChannelQueueSet::new();
        let now = Timestamp::ZERO;
        assert_eq!(set.len(4, PacketKind::Data, now), 0);
        assert!(set.peek(4, PacketKind::Data, now).is_none());

        set.enqueue(4, data(1, 2, 1, 100));
        set.close(4);
        assert!(set.is_closed(4));
        assert!(set.is_empty(4, now));

        set.enqueue(4, data(1, 2, 2, 100));
        assert!(!set.is_closed(4));
        assert_eq!(tags(&set, 4, PacketKind::Data), vec![2]);
    }

    #[test]
    fn test_filtered_migration_preserves_counts_and_order() {
        let mut set = ChannelQueueSet::new();
        set.enqueue(2, data(1, 7, 1, 100));
        set.enqueue(2, data(1, 8, 2, 100));
        set.enqueue(2, data(1, 7, 3, 100));
        set.enqueue(2, QueueEntry::hello(vec![50], Timestamp::from_millis(100)));
        set.enqueue(4, data(1, 9, 4, 100));

        let before = set.total_len(2) + set.total_len(4);
        assert_eq!(set.migrate(2, 4, Some(7)), 2);
        assert_eq!(set.total_len(2) + set.total_len(4), before);

        assert_eq!(tags(&set, 2, PacketKind::Data), vec![2]);
        assert_eq!(tags(&set, 2, PacketKind::Hello), vec![50]);
        assert_eq!(tags(&set, 4, PacketKind::Data), vec![4, 1, 3]);
    }

    #[test]
    fn test_unfiltered_migration_moves_everything() {
        let mut set = ChannelQueueSet::new();
        set.enqueue(1, data(1, 7, 1, 100));
        set.enqueue(1, QueueEntry::hello(vec![50], Timestamp::from_millis(100)));
        set.close(3);

        assert_eq!(set.migrate(1, 3, None), 2);
        assert_eq!(set.total_len(1), 0);
        assert!(!set.is_closed(3));
        assert_eq!(tags(&set, 3, PacketKind::Data), vec![1]);
        assert_eq!(tags(&set, 3, PacketKind::Hello), vec![50]);
        assert_eq!(set.migrate(3, 3, None), 0);
    }

    #[test]
    fn test_destination_lookup_and_erase() {
        let mut set = ChannelQueueSet::new();
        set.enqueue(5, data(1, 7, 1, 100));
        set.enqueue(5, data(2, 8, 2, 100));
        set.enqueue(5, data(3, 8, 3, 100));
        assert_eq!(set.find_for_destination(5, 8), Some(1));
        assert_eq!(set.find_for_destination(5, 9), None);
        assert_eq!(set.flow_count(5), 3);

        assert_eq!(set.erase_for_destination(5, 8), 2);
        assert_eq!(tags(&set, 5, PacketKind::Data), vec![1]);
        assert_eq!(set.flow_count(5), 1);
    }
}
