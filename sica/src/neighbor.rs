//! Neighbor table.
//!
//! Entries are keyed by node id in a `BTreeMap`, so iteration order is
//! deterministic and no lookup result is invalidated by a later insert.
//! Direct neighbors (`hops == 1`) come from their own hellos; two-hop
//! entries come from the summaries embedded in those hellos.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{log, Level};

use crate::time::{Duration, Timestamp};
use crate::types::{ChannelId, MacAddr, NodeId};

/// State kept about one neighbor.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborEntry {
    pub id: NodeId,
    /// Hop distance, 1 for direct neighbors. Never grows once lowered.
    pub hops: u8,
    pub radios: u8,
    /// Channel the neighbor's receive radio is tuned to.
    pub channel: ChannelId,
    /// Address of the neighbor's receive radio, if heard directly.
    pub recv_addr: Option<MacAddr>,
    /// Address of the radio the neighbor's hellos arrived from, when it differs.
    pub xmit_addr: Option<MacAddr>,
    /// Origin time of the newest accepted update, on the sender's clock.
    /// Only compared with later origin times, never with the local clock.
    pub updated_at: Timestamp,
    /// Local time the newest accepted update arrived. Drives expiry.
    pub heard_at: Timestamp,
    /// Local time at which the announced switch takes effect.
    pub switch_at: Timestamp,
    /// Announced next channel, equal to `channel` when none is pending.
    pub new_channel: ChannelId,
    /// No hello heard for longer than one hello interval.
    pub stale: bool,
}

impl NeighborEntry {
    pub fn is_direct(&self) -> bool {
        self.hops == 1
    }

    /// Switch announced and not yet applied locally.
    pub fn has_pending_switch(&self) -> bool {
        self.new_channel != self.channel
    }
}

/// Origin times travel as 32-bit milliseconds and wrap about every 49.7
/// days, so they are ordered on that circle: `candidate` is older when it
/// lies less than half a wrap behind `stored`.
fn is_older(candidate: Timestamp, stored: Timestamp) -> bool {
    let delta = (candidate.as_millis() as u32).wrapping_sub(stored.as_millis() as u32);
    (delta as i32) < 0
}

/// Input of [`NeighborTable::update`].
#[derive(Clone, Debug)]
pub struct NeighborUpdate {
    pub id: NodeId,
    pub hops: u8,
    pub radios: u8,
    pub channel: ChannelId,
    pub recv_addr: Option<MacAddr>,
    pub xmit_addr: Option<MacAddr>,
    pub update_time: Timestamp,
    /// Time until the announced switch, relative to the local clock.
    pub switch_in: Duration,
    pub new_channel: ChannelId,
}

/// All neighbors known to one node.
pub struct NeighborTable {
    own_id: NodeId,
    entries: BTreeMap<NodeId, NeighborEntry>,
}

impl NeighborTable {
    pub fn new(own_id: NodeId) -> Self {
        Self {
            own_id,
            entries: BTreeMap::new(),
        }
    }

    /// Merge one observation into the table.
    ///
    /// Returns false without touching the table when the update is about
    /// this node itself or older than what is stored. Direct updates
    /// overwrite channel, addresses and switch plan. Two-hop updates only
    /// move the channel of entries that are not direct neighbors.
    pub fn update(&mut self, u: NeighborUpdate, now: Timestamp) -> bool {
        if u.id == self.own_id {
            return false;
        }
        match self.entries.get_mut(&u.id) {
            Some(entry) => {
                if is_older(u.update_time, entry.updated_at) {
                    log!(
                        Level::Debug,
                        "neighbor {}: stale update ({:?} < {:?})",
                        u.id,
                        u.update_time,
                        entry.updated_at
                    );
                    return false;
                }
                if u.hops == 1 {
                    entry.switch_at = now + u.switch_in;
                    entry.new_channel = u.new_channel;
                    entry.radios = u.radios;
                    entry.channel = u.channel;
                    entry.recv_addr = u.recv_addr;
                    entry.xmit_addr = if u.xmit_addr != u.recv_addr {
                        u.xmit_addr
                    } else {
                        None
                    };
                } else if entry.hops > 1 {
                    entry.channel = u.channel;
                }
                entry.hops = entry.hops.min(u.hops);
                entry.updated_at = u.update_time;
                entry.heard_at = now;
                entry.stale = false;
            }
            None => {
                let xmit_addr = if u.xmit_addr != u.recv_addr {
                    u.xmit_addr
                } else {
                    None
                };
                self.entries.insert(
                    u.id,
                    NeighborEntry {
                        id: u.id,
                        hops: u.hops,
                        radios: u.radios,
                        channel: u.channel,
                        recv_addr: u.recv_addr,
                        xmit_addr,
                        updated_at: u.update_time,
                        heard_at: now,
                        switch_at: now + u.switch_in,
                        new_channel: u.new_channel,
                        stale: false,
                    },
                );
            }
        }
        true
    }

    /// Delete every entry older than `max_age`. Returns how many were removed.
    pub fn remove_expired(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_sub(e.heard_at) <= max_age);
        let removed = before - self.entries.len();
        if removed > 0 {
            log!(Level::Debug, "expired {} neighbors", removed);
        }
        removed
    }

    /// Flag entries not refreshed within `interval` as stale.
    pub fn mark_stale(&mut self, now: Timestamp, interval: Duration) {
        for entry in self.entries.values_mut() {
            entry.stale = now.saturating_sub(entry.heard_at) > interval;
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&NeighborEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut NeighborEntry> {
        self.entries.get_mut(&id)
    }

    /// Neighbor owning either radio address. Linear scan.
    pub fn find_by_address(&self, addr: &MacAddr) -> Option<&NeighborEntry> {
        self.entries.values().find(|e| {
            e.recv_addr.as_ref() == Some(addr) || e.xmit_addr.as_ref() == Some(addr)
        })
    }

    pub fn channel_of(&self, id: NodeId) -> Option<ChannelId> {
        self.entries.get(&id).map(|e| e.channel)
    }

    pub fn is_direct(&self, id: NodeId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.is_direct())
    }

    /// Neighbors (any hop count) whose receive radio is on `channel`.
    pub fn count_on_channel(&self, channel: ChannelId) -> u32 {
        self.entries.values().filter(|e| e.channel == channel).count() as u32
    }

    /// Neighbors on `channel` with a hop count in `[min_hops, max_hops]`.
    pub fn count_on_channel_by_hops(&self, channel: ChannelId, min_hops: u8, max_hops: u8) -> u32 {
        self.entries
            .values()
            .filter(|e| e.channel == channel && (min_hops..=max_hops).contains(&e.hops))
            .count() as u32
    }

    /// Neighbors with a hop count in `[min_hops, max_hops]`.
    pub fn count_by_hops(&self, min_hops: u8, max_hops: u8) -> u32 {
        self.entries
            .values()
            .filter(|e| (min_hops..=max_hops).contains(&e.hops))
            .count() as u32
    }

    /// Direct neighbors as (id, channel), ascending by id.
    pub fn direct_neighbors(&self) -> Vec<(NodeId, ChannelId)> {
        self.entries
            .values()
            .filter(|e| e.is_direct())
            .map(|e| (e.id, e.channel))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> MacAddr {
        MacAddr([2, 0, 0, 0, n, 0])
    }

    fn direct(id: NodeId, channel: ChannelId, at_ms: u64) -> NeighborUpdate {
        NeighborUpdate {
            id,
            hops: 1,
            radios: 2,
            channel,
            recv_addr: Some(mac(id as u8)),
            xmit_addr: Some(MacAddr([2, 0, 0, 0, id as u8, 1])),
            update_time: Timestamp::from_millis(at_ms),
            switch_in: Duration::ZERO,
            new_channel: channel,
        }
    }

    fn two_hop(id: NodeId, channel: ChannelId, at_ms: u64) -> NeighborUpdate {
        NeighborUpdate {
            id,
            hops: 2,
            radios: 1,
            channel,
            recv_addr: None,
            xmit_addr: None,
            update_time: Timestamp::from_millis(at_ms),
            switch_in: Duration::ZERO,
            new_channel: channel,
        }
    }

    #[test]
    fn test_rejects_self_and_stale_updates() {
        let now = Timestamp::from_secs(10);
        let mut table = NeighborTable::new(1);
        assert!(!table.update(direct(1, 3, 100), now));

        assert!(table.update(direct(2, 3, 500), now));
        let before = table.get(2).cloned();
        assert!(!table.update(direct(2, 6, 400), now));
        assert_eq!(table.get(2).cloned(), before);
    }

    #[test]
    fn test_equal_timestamp_is_accepted() {
        let now = Timestamp::from_secs(1);
        let mut table = NeighborTable::new(1);
        assert!(table.update(direct(2, 3, 500), now));
        assert!(table.update(direct(2, 4, 500), now));
        assert_eq!(table.channel_of(2), Some(4));
    }

    #[test]
    fn test_two_hop_never_overrides_direct() {
        let now = Timestamp::from_secs(1);
        let mut table = NeighborTable::new(1);
        assert!(table.update(direct(2, 3, 100), now));
        assert!(table.update(two_hop(2, 7, 200), now));
        let entry = table.get(2).unwrap();
        assert_eq!(entry.hops, 1);
        assert_eq!(entry.channel, 3);
        assert_eq!(entry.recv_addr, Some(mac(2)));

        assert!(table.update(two_hop(9, 5, 100), now));
        assert!(table.update(two_hop(9, 6, 200), now));
        assert_eq!(table.channel_of(9), Some(6));
        assert!(!table.is_direct(9));

        // hop count only decreases
        assert!(table.update(direct(9, 6, 300), now));
        assert!(table.is_direct(9));
        assert!(table.update(two_hop(9, 2, 400), now));
        assert!(table.is_direct(9));
    }

    #[test]
    fn test_switch_plan_is_relative_to_local_clock() {
        let now = Timestamp::from_secs(50);
        let mut table = NeighborTable::new(1);
        let mut u = direct(2, 3, 100);
        u.switch_in = Duration::from_secs(5);
        u.new_channel = 4;
        assert!(table.update(u, now));
        let entry = table.get(2).unwrap();
        assert_eq!(entry.switch_at, Timestamp::from_secs(55));
        assert!(entry.has_pending_switch());
    }

    #[test]
    fn test_transmit_address_only_kept_when_distinct() {
        let now = Timestamp::ZERO;
        let mut table = NeighborTable::new(1);
        let mut u = direct(2, 3, 0);
        u.xmit_addr = u.recv_addr;
        assert!(table.update(u, now));
        assert_eq!(table.get(2).unwrap().xmit_addr, None);

        assert!(table.update(direct(3, 3, 0), now));
        let by_xmit = MacAddr([2, 0, 0, 0, 3, 1]);
        assert_eq!(table.find_by_address(&by_xmit).map(|e| e.id), Some(3));
        assert_eq!(table.find_by_address(&mac(2)).map(|e| e.id), Some(2));
        assert!(table.find_by_address(&mac(99)).is_none());
    }

    #[test]
    fn test_remove_expired_leaves_only_fresh_entries() {
        let mut table = NeighborTable::new(1);
        assert!(table.update(direct(2, 1, 50_000), Timestamp::from_secs(50)));
        assert!(table.update(direct(3, 1, 100_000), Timestamp::from_secs(100)));
        assert!(table.update(direct(4, 1, 250_000), Timestamp::from_secs(250)));

        let now = Timestamp::from_secs(300);
        let max_age = Duration::from_secs(200);
        assert_eq!(table.remove_expired(now, max_age), 1);
        assert!(table
            .iter()
            .all(|e| now.saturating_sub(e.heard_at) <= max_age));
        assert_eq!(table.ids(), alloc::vec![3, 4]);
    }

    #[test]
    fn test_expiry_uses_local_receive_time() {
        let mut table = NeighborTable::new(1);
        // sender clock far behind ours
        let now = Timestamp::from_secs(10_000);
        assert!(table.update(direct(2, 1, 5_000), now));
        assert_eq!(table.get(2).unwrap().heard_at, now);

        let later = now + Duration::from_secs(1);
        assert_eq!(table.remove_expired(later, Duration::from_secs(2)), 0);
        table.mark_stale(later, Duration::from_secs(2));
        assert!(!table.get(2).unwrap().stale);
        assert_eq!(table.remove_expired(later + Duration::from_secs(2), Duration::from_secs(2)), 1);
    }

    #[test]
    fn test_origin_time_order_survives_wrap() {
        let wrap = 1u64 << 32;
        let mut table = NeighborTable::new(1);
        let now = Timestamp::from_secs(1);
        assert!(table.update(direct(2, 3, wrap - 500), now));
        // the sender's clock passed 2^32 ms, its low 32 bits restart at 0
        assert!(table.update(direct(2, 4, 100), now));
        assert_eq!(table.channel_of(2), Some(4));
        assert!(!table.update(direct(2, 5, wrap - 200), now));
        assert_eq!(table.channel_of(2), Some(4));
    }

    #[test]
    fn test_aggregates() {
        let now = Timestamp::ZERO;
        let mut table = NeighborTable::new(1);
        assert!(table.update(direct(2, 5, 0), now));
        assert!(table.update(direct(3, 5, 0), now));
        assert!(table.update(two_hop(4, 5, 0), now));
        assert!(table.update(two_hop(5, 2, 0), now));

        assert_eq!(table.count_on_channel(5), 3);
        assert_eq!(table.count_on_channel_by_hops(5, 1, 1), 2);
        assert_eq!(table.count_by_hops(2, 2), 2);
        assert_eq!(table.direct_neighbors(), alloc::vec![(2, 5), (3, 5)]);
    }

    #[test]
    fn test_mark_stale() {
        let mut table = NeighborTable::new(1);
        assert!(table.update(direct(2, 1, 0), Timestamp::ZERO));
        assert!(table.update(direct(3, 1, 9_000), Timestamp::from_secs(9)));
        table.mark_stale(Timestamp::from_secs(10), Duration::from_secs(5));
        assert!(table.get(2).unwrap().stale);
        assert!(!table.get(3).unwrap().stale);
    }
}
