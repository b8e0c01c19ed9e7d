//! Game-theoretic receive channel selection.
//!
//! Every assignment interval a node scores each channel with a loss that
//! mixes external load, neighbor crowding and the cost of leaving its
//! current channel, shrinks the channel weights multiplicatively
//! (`w <- w * beta^loss`) and draws the next receive channel from the
//! normalized weights.
//!
//! ```
//! use sica::assignment::{update_weight, ChannelDistribution};
//!
//! assert_eq!(update_weight(0.5, 0.7, 0.0), 0.5);
//! assert!(update_weight(0.5, 0.7, 0.3) < 0.5);
//!
//! let dist = ChannelDistribution::from_weights(&[(1, 3.0), (2, 1.0)]).unwrap();
//! assert_eq!(dist.probabilities(), &[(2, 0.25), (1, 0.75)]);
//! assert_eq!(dist.sample(0.1), 2);
//! assert_eq!(dist.sample(0.9), 1);
//! ```

use alloc::vec::Vec;

use log::{log, Level};

use crate::config::SicaConfig;
use crate::node::Node;
use crate::time::Timestamp;
use crate::traits::{ChannelOracle, Clock, Random, RouteLookup, Transport};
use crate::types::{ChannelId, Event};

/// Weights below this are scaled back up, keeping their ratios.
const WEIGHT_FLOOR: f64 = 1e-100;

/// Inputs of one channel's loss.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossInputs {
    /// Current external load estimate.
    pub ext_bandwidth: u32,
    pub capacity: u32,
    /// Neighbors listening on the channel.
    pub neighbors_on_channel: u32,
    /// Neighbors in the table, any hop count.
    pub total_neighbors: u32,
    /// True for every channel except the current receive channel.
    pub leaving: bool,
}

/// Stage loss of one channel, in `[0, 1]` for sane inputs.
///
/// `gamma * (alpha * bx/B + (1 - alpha) * n_c/n) + (1 - gamma) * Ds/TH`,
/// where `Ds` is the switching delay when leaving the current channel and
/// `TH` the hello interval. Without neighbors the crowding term drops out.
pub fn channel_loss(config: &SicaConfig, inputs: &LossInputs) -> f64 {
    let load = if inputs.capacity > 0 {
        inputs.ext_bandwidth as f64 / inputs.capacity as f64
    } else {
        0.0
    };
    let switch_cost = if inputs.leaving {
        config.switching_delay.as_secs_f64() / config.hello_interval.as_secs_f64()
    } else {
        0.0
    };
    let medium = if inputs.total_neighbors > 0 {
        let crowding = inputs.neighbors_on_channel as f64 / inputs.total_neighbors as f64;
        config.alpha * load + (1.0 - config.alpha) * crowding
    } else {
        config.alpha * load
    };
    config.gamma * medium + (1.0 - config.gamma) * switch_cost
}

/// Multiplicative weights step: `weight * beta^loss`.
pub fn update_weight(weight: f64, beta: f64, loss: f64) -> f64 {
    weight * libm::pow(beta, loss)
}

/// Selection distribution over channels, ordered by ascending weight.
///
/// Probabilities and cumulative values are derived from one sorted list of
/// (channel, weight) pairs, so index `i` of both always refers to the same
/// channel. Equal weights keep channel id order.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelDistribution {
    entries: Vec<(ChannelId, f64)>,
    cumulative: Vec<f64>,
}

impl ChannelDistribution {
    /// Normalize `weights`. None when empty or when no weight is positive.
    pub fn from_weights(weights: &[(ChannelId, f64)]) -> Option<Self> {
        let mut sorted: Vec<(ChannelId, f64)> = weights
            .iter()
            .map(|&(ch, w)| (ch, if w.is_finite() && w > 0.0 { w } else { 0.0 }))
            .collect();
        let total: f64 = sorted.iter().map(|(_, w)| w).sum();
        if sorted.is_empty() || total <= 0.0 {
            return None;
        }
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        let entries: Vec<(ChannelId, f64)> =
            sorted.into_iter().map(|(ch, w)| (ch, w / total)).collect();
        let mut cumulative = Vec::with_capacity(entries.len());
        let mut acc = 0.0;
        for (_, p) in &entries {
            acc += p;
            cumulative.push(acc);
        }
        if let Some(last) = cumulative.last_mut() {
            *last = 1.0;
        }
        Some(Self {
            entries,
            cumulative,
        })
    }

    /// (channel, probability) in ascending probability order.
    pub fn probabilities(&self) -> &[(ChannelId, f64)] {
        &self.entries
    }

    /// Running sums of [`probabilities`](Self::probabilities); the last one is 1.
    pub fn cumulative(&self) -> &[f64] {
        &self.cumulative
    }

    /// Inverse CDF: channel of the first cumulative value above `u` (`u` in [0, 1)).
    pub fn sample(&self, u: f64) -> ChannelId {
        let idx = self
            .cumulative
            .iter()
            .position(|c| *c > u)
            .unwrap_or(self.entries.len() - 1);
        self.entries[idx].0
    }
}

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Assignment timer: update losses and weights, draw the next receive
    /// channel and schedule the switch if it changed. Skipped while a
    /// switch is already pending.
    pub(crate) fn run_assignment(&mut self, now: Timestamp) {
        let interval = self.config().assignment_interval;
        let timer = self.timers().assignment;
        self.scheduler_mut().schedule_after(timer, now, interval);

        if self.switch_pending() {
            log!(
                Level::Debug,
                "node {}: switch to {} pending, assignment skipped",
                self.node_id(),
                self.pending_channel()
            );
            return;
        }

        self.update_losses(now);
        let weights = self.update_weights();

        let Some(dist) = ChannelDistribution::from_weights(&weights) else {
            log!(Level::Warn, "node {}: no usable channel weights", self.node_id());
            return;
        };
        self.push_event(Event::ChannelProbabilities {
            entries: dist.probabilities().to_vec(),
        });

        let u = self.random_mut().gen_f64();
        let chosen = dist.sample(u);
        assert!(
            self.config().contains_channel(chosen),
            "selected channel {} outside configured range",
            chosen
        );
        self.set_pending_channel(chosen);
        let rx = self.rx_channel();
        log!(
            Level::Debug,
            "node {}: assignment picked channel {} (current {}, heaviest other {:?})",
            self.node_id(),
            chosen,
            rx,
            self.channels().max_weight_channel(rx)
        );
        if chosen != rx {
            self.schedule_switch(now);
        }
    }

    /// Recompute the stage loss of every channel.
    pub(crate) fn update_losses(&mut self, now: Timestamp) {
        let rx = self.rx_channel();
        let capacity = self.config().channel_capacity;
        let total = self.neighbors().len() as u32;
        let channels: Vec<ChannelId> = self.config().channels().collect();
        for ch in channels {
            let inputs = LossInputs {
                ext_bandwidth: self.channels_mut().external_bandwidth(ch, now),
                capacity,
                neighbors_on_channel: self.channels().neighbor_count(ch),
                total_neighbors: total,
                leaving: ch != rx,
            };
            let loss = channel_loss(self.config(), &inputs);
            self.losses_mut().insert(ch, loss);
        }
    }

    /// Apply the multiplicative step to every weight. Returns the new weights.
    pub(crate) fn update_weights(&mut self) -> Vec<(ChannelId, f64)> {
        let beta = self.config().beta;
        let channels: Vec<ChannelId> = self.config().channels().collect();
        let mut weights = Vec::with_capacity(channels.len());
        for ch in channels {
            let loss = self.losses().get(&ch).copied().unwrap_or(0.0);
            let w = update_weight(self.channels().weight(ch), beta, loss);
            weights.push((ch, w));
        }

        let max = weights.iter().map(|(_, w)| *w).fold(0.0, f64::max);
        if max > 0.0 && max < WEIGHT_FLOOR {
            for (_, w) in weights.iter_mut() {
                *w /= max;
            }
        }
        for &(ch, w) in &weights {
            self.channels_mut().set_weight(ch, w);
        }
        weights
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::node::test_support::*;
    use crate::routing::StaticRoutes;
    use crate::time::Duration;

    fn inputs(bx: u32, on: u32, total: u32, leaving: bool) -> LossInputs {
        LossInputs {
            ext_bandwidth: bx,
            capacity: 11,
            neighbors_on_channel: on,
            total_neighbors: total,
            leaving,
        }
    }

    #[test]
    fn test_loss_formula() {
        let config = SicaConfig::default();
        // current channel, idle, nobody else on it
        assert_eq!(channel_loss(&config, &inputs(0, 0, 4, false)), 0.0);

        let loss = channel_loss(&config, &inputs(11, 2, 4, false));
        assert!((loss - 0.8 * (0.5 + 0.5 * 0.5)).abs() < 1e-12);

        let switch_cost = 0.2 * (0.0003 / 100.0);
        let loss = channel_loss(&config, &inputs(0, 0, 4, true));
        assert!((loss - switch_cost).abs() < 1e-15);
    }

    #[test]
    fn test_loss_without_neighbors_keeps_load_term() {
        let config = SicaConfig::default();
        let loss = channel_loss(&config, &inputs(11, 0, 0, false));
        assert!((loss - 0.8 * 0.5).abs() < 1e-12);
        assert!(channel_loss(&config, &inputs(0, 0, 0, false)).is_finite());
    }

    #[test]
    fn test_weight_update_monotone_in_loss() {
        assert_eq!(update_weight(1.0, 0.7, 0.0), 1.0);
        let a = update_weight(1.0, 0.7, 0.2);
        let b = update_weight(1.0, 0.7, 0.6);
        assert!(a < 1.0 && b < a);
        assert!((update_weight(1.0, 0.7, 1.0) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_cumulative_is_monotone_and_ends_at_one() {
        let weights = [(1, 0.3), (2, 0.0), (3, 0.1), (4, 2.5), (5, 0.3)];
        let dist = ChannelDistribution::from_weights(&weights).unwrap();
        let c = dist.cumulative();
        assert_eq!(c.len(), 5);
        assert!(c.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*c.last().unwrap(), 1.0);
        assert!(ChannelDistribution::from_weights(&[]).is_none());
        assert!(ChannelDistribution::from_weights(&[(1, 0.0)]).is_none());
    }

    #[test]
    fn test_probabilities_stay_attached_to_their_channel() {
        // equal weights on non-adjacent ids must not swap channels
        let weights = [(6, 0.2), (2, 0.5), (4, 0.2), (1, 0.1)];
        let dist = ChannelDistribution::from_weights(&weights).unwrap();
        assert_eq!(
            dist.probabilities()
                .iter()
                .map(|(ch, _)| *ch)
                .collect::<Vec<_>>(),
            vec![1, 4, 6, 2]
        );
        for &(ch, p) in dist.probabilities() {
            let w = weights.iter().find(|(c, _)| *c == ch).unwrap().1;
            assert!((p - w).abs() < 1e-12);
        }
        // sampling just below each cumulative boundary lands on that channel
        let mut prev = 0.0;
        for (i, &c) in dist.cumulative().iter().enumerate() {
            let mid = (prev + c) / 2.0;
            assert_eq!(dist.sample(mid), dist.probabilities()[i].0);
            prev = c;
        }
    }

    #[test]
    fn test_tiny_weights_are_rescaled() {
        let mut node = test_node(1, StaticRoutes::new());
        node.initialize(Timestamp::ZERO);
        for ch in 1..=8 {
            node.channels_mut().set_weight(ch, 1e-200 * ch as f64);
            node.losses_mut().insert(ch, 0.0);
        }
        let weights = node.update_weights();
        assert!((weights[7].1 - 1.0).abs() < 1e-12);
        assert!((weights[0].1 - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_assignment_cycle_picks_and_schedules() {
        let mut node = test_node(1, StaticRoutes::new());
        node.initialize(Timestamp::ZERO);
        let now = Timestamp::from_secs(5);
        let hello = hello_from(2, 1, node.rx_channel(), now);
        deliver_hello(&mut node, &hello, now);
        drain_events(&node);

        node.run_assignment(now);
        let rx = node.rx_channel();
        // crowded current channel lost weight, the others only the switch cost
        assert!(node.losses()[&rx] > node.losses()[&(if rx == 1 { 2 } else { 1 })]);
        assert!(node.channels().weight(rx) < 1.0);

        let events = drain_events(&node);
        let probs = events
            .iter()
            .find_map(|e| match e {
                Event::ChannelProbabilities { entries } => Some(entries.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(probs.len(), 8);
        assert_eq!(probs[0].0, rx);

        let timers = node.timers();
        if node.switch_pending() {
            let left = node.scheduler().remaining(timers.switch, now);
            assert!(left >= Duration::from_secs(200) && left <= Duration::from_secs(300));
        } else {
            assert!(!node.scheduler().is_armed(timers.switch));
        }
        assert_eq!(
            node.scheduler().remaining(timers.assignment, now),
            node.config().assignment_interval
        );
    }

    #[test]
    fn test_assignment_skipped_while_switch_pending() {
        let mut node = test_node(1, StaticRoutes::new());
        node.initialize(Timestamp::ZERO);
        let rx = node.rx_channel();
        node.set_pending_channel(if rx == 8 { 1 } else { rx + 1 });
        node.run_assignment(Timestamp::from_secs(5));
        assert!((1..=8).all(|ch| node.channels().weight(ch) == 1.0));
        assert!(drain_events(&node).is_empty());
    }
}
