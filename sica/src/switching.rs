//! Receive channel switches, local and remote.
//!
//! A local switch is announced in hellos for a jittered 2-3 hello
//! intervals before the receive radio retunes, so neighbors learn the new
//! channel in time. When a neighbor's announced switch time passes, its
//! queued data follows it to the new channel.

use alloc::vec::Vec;

use log::{log, Level};

use crate::node::Node;
use crate::time::{Duration, Timestamp};
use crate::traits::{ChannelOracle, Clock, Random, RouteLookup, Transport};
use crate::types::{ChannelId, Event, NodeId, Radio};

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Arm the receive switch timer after a random 2-3 hello intervals,
    /// plus the remaining busy time when the channel is occupied. Never
    /// pushes an earlier deadline out. Returns the delay drawn.
    pub(crate) fn schedule_switch(&mut self, now: Timestamp) -> Duration {
        let rx = self.rx_channel();
        let to_idle = if self.oracle().is_busy(rx, now) {
            self.oracle().idle_in(rx, now)
        } else {
            Duration::ZERO
        };
        let (lo, hi) = self.config().switch_jitter_range();
        let jitter_ms = self.random_mut().gen_range(lo, hi + 1);
        let delay = Duration::from_millis(jitter_ms) + to_idle;

        let timer = self.timers().switch;
        self.scheduler_mut().reschedule_if_sooner(timer, now, delay);
        log!(
            Level::Debug,
            "node {}: receive radio moves {} -> {} in {:?}",
            self.node_id(),
            rx,
            self.pending_channel(),
            self.scheduler().remaining(timer, now)
        );
        delay
    }

    /// Switch timer: retune the receive radio to the pending channel.
    pub(crate) fn switch_receive_radio(&mut self, now: Timestamp) {
        let timer = self.timers().switch;
        self.scheduler_mut().cancel(timer);
        let from = self.rx_channel();
        let to = self.pending_channel();
        if from == to {
            return;
        }
        self.transport_mut().set_channel(Radio::Receive, to, now);
        self.set_rx_channel(to);
        self.metrics_mut().channel_switches += 1;
        self.push_event(Event::ChannelSwitched { from, to });
        log!(
            Level::Info,
            "node {}: receive radio switched {} -> {}",
            self.node_id(),
            from,
            to
        );
    }

    /// Neighbor switch timer: apply every announced switch whose time has
    /// come, then re-arm for the nearest one still pending.
    pub(crate) fn handle_neighbor_switches(&mut self, now: Timestamp) {
        let expire = self.config().neighbor_expire;
        self.neighbors_mut().remove_expired(now, expire);

        let mut due: Vec<(NodeId, ChannelId, ChannelId)> = Vec::new();
        let mut nearest = Duration::ZERO;
        for entry in self.neighbors().iter() {
            if !entry.is_direct()
                || !entry.has_pending_switch()
                || !self.config().contains_channel(entry.new_channel)
            {
                continue;
            }
            if entry.switch_at <= now {
                due.push((entry.id, entry.channel, entry.new_channel));
            } else {
                let left = entry.switch_at - now;
                if nearest.is_zero() || left < nearest {
                    nearest = left;
                }
            }
        }

        for (id, from, to) in due {
            self.apply_neighbor_switch(id, from, to);
        }

        let timer = self.timers().neighbor_switch;
        self.scheduler_mut().reschedule_if_sooner(timer, now, nearest);
    }

    /// Move a neighbor from `from` to `to`: its queued data, the channel
    /// neighbor counts and its table entry.
    ///
    /// The old channel's queue is closed when no direct neighbor is left on
    /// it while others remain elsewhere.
    pub(crate) fn apply_neighbor_switch(&mut self, id: NodeId, from: ChannelId, to: ChannelId) {
        let moved = self.queues_mut().migrate(from, to, Some(id));
        self.channels_mut().increment_neighbors(to);
        self.channels_mut().decrement_neighbors(from);
        if let Some(entry) = self.neighbors_mut().get_mut(id) {
            entry.channel = to;
            entry.new_channel = to;
        }
        self.metrics_mut().neighbor_switches += 1;
        self.push_event(Event::NeighborSwitched {
            neighbor: id,
            from,
            to,
        });
        log!(
            Level::Debug,
            "node {}: neighbor {} switched {} -> {}, moved {} packets",
            self.node_id(),
            id,
            from,
            to,
            moved
        );

        let direct = self.neighbors().direct_neighbors();
        if !direct.is_empty() && direct.iter().all(|(_, ch)| *ch != from) {
            self.queues_mut().close(from);
            log!(
                Level::Debug,
                "node {}: no direct neighbor left on {}, queue closed",
                self.node_id(),
                from
            );
        }
    }
}
