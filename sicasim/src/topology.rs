//! Network topology and link properties.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};
use sica::{Duration, NodeId, StaticRoutes};

/// Properties of a network link between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Frame loss rate (0.0 to 1.0).
    pub loss_rate: f64,
    /// Propagation delay.
    pub delay: Duration,
    /// Whether the link is currently active.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            delay: Duration::from_micros(5),
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Symmetric radio connectivity between nodes.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(NodeId, NodeId), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pair of nodes in range.
    pub fn fully_connected(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each node hears only its predecessor and successor.
    pub fn chain(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for pair in nodes.windows(2) {
            topo.add_link(pair[0], pair[1], Link::default());
        }
        topo
    }

    /// First node is the hub, all others hear only the hub.
    pub fn star(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    /// Row-major grid `width` nodes wide, 4-neighborhood. The last row may
    /// be short.
    pub fn grid(nodes: &[NodeId], width: usize) -> Self {
        let mut topo = Self::new();
        if width == 0 {
            return topo;
        }
        for (i, &node) in nodes.iter().enumerate() {
            if (i + 1) % width != 0 {
                if let Some(&right) = nodes.get(i + 1) {
                    topo.add_link(node, right, Link::default());
                }
            }
            if let Some(&below) = nodes.get(i + width) {
                topo.add_link(node, below, Link::default());
            }
        }
        topo
    }

    /// Add a bidirectional link between two nodes.
    pub fn add_link(&mut self, a: NodeId, b: NodeId, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: NodeId, b: NodeId) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Link exists and is active.
    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable over one active link, ascending.
    pub fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        result.sort_unstable();
        result
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Disable all links crossing between partition groups.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all links.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_delay(&mut self, delay: Duration) {
        for link in self.links.values_mut() {
            link.delay = delay;
        }
    }

    /// Minimum-hop routes between every pair of `nodes` over active links.
    ///
    /// Ties go to the lowest neighbor id, so the table is reproducible.
    pub fn shortest_path_routes(&self, nodes: &[NodeId]) -> StaticRoutes {
        let mut routes = StaticRoutes::new();
        for &src in nodes {
            let mut first_hop: HashMap<NodeId, (NodeId, u32)> = HashMap::new();
            let mut seen: HashSet<NodeId> = HashSet::new();
            let mut queue = VecDeque::new();
            seen.insert(src);
            queue.push_back(src);

            while let Some(node) = queue.pop_front() {
                let via = first_hop.get(&node).copied();
                for next in self.neighbors(node) {
                    if !seen.insert(next) {
                        continue;
                    }
                    let entry = match via {
                        Some((hop, dist)) => (hop, dist + 1),
                        None => (next, 1),
                    };
                    first_hop.insert(next, entry);
                    queue.push_back(next);
                }
            }

            for &dst in nodes {
                if let Some(&(hop, metric)) = first_hop.get(&dst) {
                    routes.add(src, dst, hop, metric);
                }
            }
        }
        routes
    }

    /// Canonical pair ordering for consistent link storage.
    fn canonical_pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
