//! Hello beacons: building, distribution and processing.
//!
//! Every node periodically announces its receive channel, pending switch,
//! sensing plan and the channels of its direct neighbors. Receivers learn
//! direct neighbors from the origin and two-hop neighbors from the
//! summary list.

use alloc::vec::Vec;

use log::{log, Level};

use crate::neighbor::NeighborUpdate;
use crate::node::{Node, Task};
use crate::queue::QueueEntry;
use crate::time::{Duration, Timestamp};
use crate::traits::{ChannelOracle, Clock, Random, RouteLookup, Transport};
use crate::types::{ChannelId, MacAddr, Radio};
use crate::wire::{Decode, Encode, Hello};

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Hello timer: re-arm, build a fresh hello and queue it.
    pub(crate) fn create_hello(&mut self, now: Timestamp) {
        let interval = self.config().hello_interval;
        let hello_timer = self.timers().hello;
        self.scheduler_mut().schedule_after(hello_timer, now, interval);

        let expire = self.config().neighbor_expire;
        self.neighbors_mut().remove_expired(now, expire);

        let hello = self.build_hello(now);
        log!(
            Level::Debug,
            "node {}: hello seq {} with {} neighbor summaries",
            self.node_id(),
            hello.seq,
            hello.neighbors.len()
        );
        self.distribute_hello(&hello, now);
    }

    /// Snapshot of this node's state as a hello.
    ///
    /// Panics if more than 255 direct neighbors would be summarized.
    pub(crate) fn build_hello(&mut self, now: Timestamp) -> Hello {
        let seq = self.next_seq();
        let rx = self.rx_channel();
        let radios = self.transport().radio_count();
        let recv_addr = self.transport().address(Radio::Receive);
        let mut hello = Hello::new(
            seq,
            self.node_id(),
            now,
            radios,
            rx,
            self.pending_channel(),
            recv_addr,
        );

        let bx = self.channels_mut().external_bandwidth(rx, now);
        hello.ext_bw = bx.min(u8::MAX as u32) as u8;
        let timers = self.timers();
        hello.switch_in = self.scheduler().remaining(timers.switch, now);
        hello.sense_in = self.scheduler().remaining(timers.sense, now);
        hello.clcpf = self.channels().clcpf(rx);

        for (id, channel) in self.neighbors().direct_neighbors() {
            hello.push_neighbor(id, channel);
        }
        hello
    }

    /// Queue a hello on every channel that has a direct neighbor, or on
    /// every channel when there is none. Returns the channels used.
    pub(crate) fn distribute_hello(&mut self, hello: &Hello, now: Timestamp) -> Vec<ChannelId> {
        let mut targets: Vec<ChannelId> = self
            .neighbors()
            .direct_neighbors()
            .into_iter()
            .map(|(_, channel)| channel)
            .filter(|ch| self.config().contains_channel(*ch))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        if targets.is_empty() {
            targets = self.config().channels().collect();
        }

        let bytes = hello.encode_to_vec();
        let expires_at = now + self.config().hello_expire;
        for ch in &targets {
            self.queues_mut()
                .enqueue(*ch, QueueEntry::hello(bytes.clone(), expires_at));
        }
        targets
    }

    /// Handle a received hello. Returns true when it changed our tables.
    pub(crate) fn process_hello(&mut self, payload: &[u8], src: MacAddr, now: Timestamp) -> bool {
        let hello = match Hello::decode_from_slice(payload) {
            Ok(h) => h,
            Err(e) => {
                log!(Level::Debug, "node {}: bad hello: {}", self.node_id(), e);
                self.metrics_mut().hellos_rejected += 1;
                return false;
            }
        };
        if !hello.is_valid() {
            log!(
                Level::Debug,
                "node {}: invalid hello from {}",
                self.node_id(),
                hello.origin
            );
            self.metrics_mut().hellos_rejected += 1;
            return false;
        }

        if !self.update_neighbor_table(&hello, src, now) {
            self.metrics_mut().hellos_rejected += 1;
            return false;
        }
        self.update_channel_table(&hello, now);

        // Recount every channel, two-hop moves included.
        let channels: Vec<ChannelId> = self.config().channels().collect();
        for ch in channels {
            let n = self.neighbors().count_on_channel(ch);
            self.channels_mut().set_neighbor_count(ch, n);
        }

        if !hello.switch_in.is_zero() {
            log!(
                Level::Debug,
                "node {}: neighbor {} switches to {} in {:?}",
                self.node_id(),
                hello.origin,
                hello.new_channel,
                hello.switch_in
            );
        }
        let timer = self.timers().neighbor_switch;
        self.scheduler_mut()
            .reschedule_if_sooner(timer, now, hello.switch_in);

        self.metrics_mut().hellos_received += 1;
        true
    }

    /// Merge the origin (one hop) and its summaries (two hops).
    pub(crate) fn update_neighbor_table(&mut self, hello: &Hello, src: MacAddr, now: Timestamp) -> bool {
        let origin = hello.origin;
        if origin == self.node_id() {
            return false;
        }
        if !self.config().contains_channel(hello.channel)
            || !self.config().contains_channel(hello.new_channel)
        {
            log!(
                Level::Debug,
                "node {}: hello from {} with channel {} -> {} out of range",
                self.node_id(),
                origin,
                hello.channel,
                hello.new_channel
            );
            return false;
        }

        let previous = self.neighbors().channel_of(origin);
        let accepted = self.neighbors_mut().update(
            NeighborUpdate {
                id: origin,
                hops: 1,
                radios: hello.radios,
                channel: hello.channel,
                recv_addr: (!hello.recv_addr.is_unset()).then_some(hello.recv_addr),
                xmit_addr: (!src.is_unset()).then_some(src),
                update_time: hello.origin_time,
                switch_in: hello.switch_in,
                new_channel: hello.new_channel,
            },
            now,
        );
        if !accepted {
            return false;
        }

        // The neighbor moved without us seeing the switch announcement.
        if let Some(prev) = previous.filter(|p| *p != hello.channel) {
            let moved = self.queues_mut().migrate(prev, hello.channel, Some(origin));
            log!(
                Level::Debug,
                "node {}: neighbor {} now on {} (was {}), moved {} packets",
                self.node_id(),
                origin,
                hello.channel,
                prev,
                moved
            );
        }

        for &(id, channel) in &hello.neighbors {
            if id == self.node_id() {
                continue;
            }
            if !self.config().contains_channel(channel) {
                log!(
                    Level::Debug,
                    "node {}: summary for {} with channel {} out of range",
                    self.node_id(),
                    id,
                    channel
                );
                continue;
            }
            let previous = self.neighbors().channel_of(id);
            self.neighbors_mut().update(
                NeighborUpdate {
                    id,
                    hops: 2,
                    radios: 1,
                    channel,
                    recv_addr: None,
                    xmit_addr: None,
                    update_time: hello.origin_time,
                    switch_in: Duration::ZERO,
                    new_channel: previous.unwrap_or(channel),
                },
                now,
            );
        }
        true
    }

    /// Fold the sender's load report and sensing plan into the channel table.
    pub(crate) fn update_channel_table(&mut self, hello: &Hello, now: Timestamp) {
        let ch = hello.channel;
        let n = self.neighbors().count_on_channel(ch);
        let capacity = self.config().channel_capacity;
        let bx_expire = self.config().bx_expire;
        self.channels_mut()
            .update_or_insert(ch, capacity, hello.ext_bw as u32, n, bx_expire, now);

        if hello.sense_in.is_zero() {
            return;
        }
        if ch != self.rx_channel() {
            // Keep quiet on that channel while the neighbor measures it.
            let period = self.config().sense_period;
            let start = now + hello.sense_in;
            self.scheduler_mut().defer(start, Task::ForeignSenseBegin(ch));
            self.scheduler_mut()
                .defer(start + period, Task::ForeignSenseEnd(ch));
        } else {
            let timer = self.timers().sense;
            self.scheduler_mut()
                .reschedule_if_sooner(timer, now, hello.sense_in);
        }
    }
}
