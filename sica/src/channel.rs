//! Per-channel statistics: capacity, external load, neighbor count,
//! decision weight and the sensing flag.

use hashbrown::HashMap;
use log::{log, Level};

use crate::time::{Duration, Timestamp};
use crate::types::ChannelId;

/// State of one channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEntry {
    pub id: ChannelId,
    /// Total capacity.
    pub bandwidth: u32,
    /// External load estimate, meaningful only until `bx_expires_at`.
    pub ext_bandwidth: u32,
    pub bx_expires_at: Timestamp,
    /// Neighbors whose receive radio is on this channel.
    pub neighbors: u32,
    /// Multiplicative-weights decision weight, always positive.
    pub weight: f64,
    /// Sensing windows open on this channel, own and announced by
    /// neighbors. Nobody may transmit into it while any is open.
    pub sensing_windows: u32,
}

impl ChannelEntry {
    fn fresh(id: ChannelId) -> Self {
        Self {
            id,
            bandwidth: 0,
            ext_bandwidth: 0,
            bx_expires_at: Timestamp::ZERO,
            neighbors: 0,
            weight: 1.0,
            sensing_windows: 0,
        }
    }
}

/// All channels one node has heard of. Entries are created on first
/// reference and never removed.
#[derive(Default)]
pub struct ChannelTable {
    entries: HashMap<ChannelId, ChannelEntry>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, id: ChannelId) -> &mut ChannelEntry {
        self.entries
            .entry(id)
            .or_insert_with(|| ChannelEntry::fresh(id))
    }

    /// Overwrite capacity, load and neighbor count. The estimate expiry only
    /// moves forward: `max(existing, now + expiry)`.
    pub fn update_or_insert(
        &mut self,
        id: ChannelId,
        bandwidth: u32,
        ext_bandwidth: u32,
        neighbors: u32,
        expiry: Duration,
        now: Timestamp,
    ) {
        let entry = self.entry(id);
        entry.bandwidth = bandwidth;
        entry.ext_bandwidth = ext_bandwidth;
        entry.neighbors = neighbors;
        entry.bx_expires_at = entry.bx_expires_at.max(now + expiry);
    }

    /// Record a measured external load. Rejected (returns false) when the
    /// load exceeds the channel capacity.
    pub fn set_external_bandwidth(
        &mut self,
        id: ChannelId,
        bx: u32,
        expiry: Duration,
        now: Timestamp,
    ) -> bool {
        let entry = self.entry(id);
        if bx > entry.bandwidth {
            log!(
                Level::Warn,
                "channel {}: external load {} above capacity {}",
                id,
                bx,
                entry.bandwidth
            );
            return false;
        }
        entry.ext_bandwidth = bx;
        entry.bx_expires_at = entry.bx_expires_at.max(now + expiry);
        true
    }

    /// Current external load estimate. An expired estimate is cleared and
    /// reads as zero.
    pub fn external_bandwidth(&mut self, id: ChannelId, now: Timestamp) -> u32 {
        let entry = self.entry(id);
        if now > entry.bx_expires_at {
            entry.ext_bandwidth = 0;
        }
        entry.ext_bandwidth
    }

    pub fn bandwidth(&self, id: ChannelId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.bandwidth)
    }

    pub fn weight(&self, id: ChannelId) -> f64 {
        self.entries.get(&id).map_or(1.0, |e| e.weight)
    }

    pub fn set_weight(&mut self, id: ChannelId, weight: f64) {
        self.entry(id).weight = weight;
    }

    pub fn neighbor_count(&self, id: ChannelId) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.neighbors)
    }

    pub fn set_neighbor_count(&mut self, id: ChannelId, count: u32) {
        self.entry(id).neighbors = count;
    }

    pub fn increment_neighbors(&mut self, id: ChannelId) {
        let entry = self.entry(id);
        entry.neighbors = entry.neighbors.saturating_add(1);
    }

    pub fn decrement_neighbors(&mut self, id: ChannelId) {
        let entry = self.entry(id);
        entry.neighbors = entry.neighbors.saturating_sub(1);
    }

    pub fn is_sensed(&self, id: ChannelId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.sensing_windows > 0)
    }

    /// Open a sensing window. Every call is matched by one
    /// [`end_sensing`](Self::end_sensing), so windows announced more than
    /// once or overlapping keep the channel quiet until the last one closes.
    pub fn begin_sensing(&mut self, id: ChannelId) {
        let entry = self.entry(id);
        entry.sensing_windows += 1;
    }

    pub fn end_sensing(&mut self, id: ChannelId) {
        let entry = self.entry(id);
        entry.sensing_windows = entry.sensing_windows.saturating_sub(1);
    }

    /// Lowest weight among all channels except `excluding` (0 when there is none).
    pub fn clcpf(&self, excluding: ChannelId) -> f64 {
        self.entries
            .values()
            .filter(|e| e.id != excluding)
            .map(|e| e.weight)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Channel with the highest weight except `excluding`. Ties go to the lower id.
    pub fn max_weight_channel(&self, excluding: ChannelId) -> Option<ChannelId> {
        let mut best: Option<&ChannelEntry> = None;
        for entry in self.entries.values().filter(|e| e.id != excluding) {
            best = match best {
                Some(b) if b.weight > entry.weight => Some(b),
                Some(b) if b.weight == entry.weight && b.id < entry.id => Some(b),
                _ => Some(entry),
            };
        }
        best.map(|e| e.id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&ChannelEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
