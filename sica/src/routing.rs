//! Static next-hop routes.
//!
//! Routes are computed out of band and loaded as text, one route per
//! line: `src dst next_hop metric`, whitespace separated. Blank lines and
//! lines starting with `#` are skipped.
//!
//! ```
//! use sica::routing::StaticRoutes;
//! use sica::traits::RouteLookup;
//!
//! let routes = StaticRoutes::parse("1 3 2 2\n2 3 3 1\n").unwrap();
//! assert_eq!(routes.next_hop(1, 3), Some(2));
//! assert_eq!(routes.next_hop(1, 1), Some(1));
//! assert_eq!(routes.next_hop(3, 1), None);
//! ```

use alloc::collections::BTreeMap;
use core::fmt;
use core::str::FromStr;

use crate::traits::RouteLookup;
use crate::types::NodeId;

/// One route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub next_hop: NodeId,
    pub metric: u32,
}

/// Precomputed (src, dst) to next-hop table.
#[derive(Clone, Debug, Default)]
pub struct StaticRoutes {
    routes: BTreeMap<(NodeId, NodeId), Route>,
}

impl StaticRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the route from `src` to `dst`.
    pub fn add(&mut self, src: NodeId, dst: NodeId, next_hop: NodeId, metric: u32) {
        self.routes.insert((src, dst), Route { next_hop, metric });
    }

    pub fn get(&self, src: NodeId, dst: NodeId) -> Option<&Route> {
        self.routes.get(&(src, dst))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Parse a route listing. Later lines replace earlier ones for the same pair.
    pub fn parse(text: &str) -> Result<Self, RouteParseError> {
        let mut table = Self::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = idx + 1;
            let mut fields = line.split_whitespace();
            let src = field(&mut fields, line_no, "src")?;
            let dst = field(&mut fields, line_no, "dst")?;
            let next_hop = field(&mut fields, line_no, "next_hop")?;
            let metric = field(&mut fields, line_no, "metric")?;
            if fields.next().is_some() {
                return Err(RouteParseError {
                    line: line_no,
                    field: "trailing",
                });
            }
            table.add(src, dst, next_hop, metric);
        }
        Ok(table)
    }
}

fn field<'a, T: FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
    line: usize,
    name: &'static str,
) -> Result<T, RouteParseError> {
    fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(RouteParseError { line, field: name })
}

impl RouteLookup for StaticRoutes {
    fn next_hop(&self, src: NodeId, dst: NodeId) -> Option<NodeId> {
        if src == dst {
            return Some(src);
        }
        self.routes.get(&(src, dst)).map(|r| r.next_hop)
    }
}

/// Malformed line in a route listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteParseError {
    /// 1-based line number.
    pub line: usize,
    /// Field that was missing, malformed or unexpected.
    pub field: &'static str,
}

impl fmt::Display for RouteParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route line {}: bad {} field", self.line, self.field)
    }
}
