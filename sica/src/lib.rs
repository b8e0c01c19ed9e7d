#![forbid(unsafe_code)]
//! sica - distributed channel assignment for dual-radio mesh nodes
//!
//! Every node owns two half-duplex radios: a receive radio parked on a
//! channel the node picks for itself, and a transmit radio that hops to
//! whichever channel the next hop listens on. Nodes advertise their
//! receive channel, load estimates and sensing windows in periodic hellos
//! and move their receive radio with a multiplicative-weights game, so
//! that neighbors spread over the available channels without any central
//! coordination.
//!
//! This crate is `no_std` but **requires the `alloc` crate**.
//!
//! # Key Properties
//!
//! - Per-channel packet queues, hellos ahead of data
//! - Two-hop neighbor knowledge from hello summaries
//! - Channel switches are announced 2-3 hello intervals ahead
//! - Queued data follows a neighbor to its new channel
//! - Carrier sensing feeds an external load estimate into the channel loss
//! - Neighbor expiry runs on the local clock; only the reported data delay
//!   assumes synchronized clocks
//!
//! # Example (basic usage)
//!
//! ```
//! use sica::routing::StaticRoutes;
//! use sica::traits::test_impls::{MockClock, MockOracle, MockRandom, MockTransport};
//! use sica::{Node, Radio, SicaConfig, Timestamp, Transport};
//!
//! let mut node = Node::new(
//!     MockTransport::new(),
//!     MockRandom::with_seed(7),
//!     MockClock::new(),
//!     MockOracle::new(),
//!     StaticRoutes::new(),
//!     1,
//!     SicaConfig::default(),
//! )
//! .unwrap();
//!
//! node.initialize(Timestamp::ZERO);
//! let rx = node.rx_channel();
//! assert!((1..=8).contains(&rx));
//! assert_eq!(node.transport().channel(Radio::Receive), rx);
//!
//! // Without neighbors the first hello goes out on every channel, one
//! // round-robin dwell at a time.
//! let end = Timestamp::from_secs(1);
//! let mut now = Timestamp::ZERO;
//! while now < end {
//!     now = node.next_wakeup().unwrap().min(end);
//!     node.handle_timer(now);
//! }
//! assert_eq!(node.metrics().hellos_sent, 8);
//! ```
//!
//! # Example (integration pattern)
//!
//! ```text
//! use sica::{Node, Transport, Clock, Random, ChannelOracle, RouteLookup, OutgoingData};
//!
//! // Implement the collaborator traits for your platform...
//!
//! // let mut node = Node::new(transport, random, clock, oracle, routes, id, config)?;
//!
//! // spawn(async move {
//! //     node.run().await;
//! // });
//!
//! // node.outgoing().send(OutgoingData { target, payload }).await;
//! // let data = node.incoming().receive().await;
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Identifiers, events, errors and metrics
//! - [`wire`] - Hello and data header encoding
//! - [`traits`] - Transport, Clock, Random, ChannelOracle, RouteLookup
//! - [`node`] - Main Node struct and public API
//! - [`neighbor`] - One- and two-hop neighbor table
//! - [`channel`] - Per-channel load, weight and sensing state
//! - [`queue`] - Per-channel packet queues
//! - [`assignment`] - Channel loss, weight update and selection
//! - [`sensing`] - Carrier sense windows
//! - [`scheduler`] - Deadline-ordered timers
//! - [`routing`] - Static next-hop tables
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Protocol parameters

#![no_std]

// Mocks give a predictable RNG and fake radios; keep them out of release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It replaces the radios and the random source with deterministic mocks."
);

extern crate alloc;

pub mod assignment;
pub mod channel;
pub mod config;
mod forwarding;
mod hello;
mod interfaces;
pub mod neighbor;
pub mod node;
pub mod queue;
pub mod routing;
pub mod scheduler;
pub mod sensing;
mod switching;
pub mod time;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use config::{ConfigError, SicaConfig};
pub use node::{LossMap, Node};
pub use routing::{RouteParseError, StaticRoutes};
pub use time::{Duration, Timestamp};
pub use traits::{
    ChannelOracle, Clock, Frame, IncomingData, OutgoingData, Random, Received, RouteLookup,
    Transport, WyRandom,
};
pub use types::{
    ChannelId, DropReason, Error, Event, MacAddr, NodeId, NodeMetrics, PacketKind, Payload, Radio,
};
pub use wire::{DataHeader, DataPacket, Decode, DecodeError, Encode, Hello};

// Re-export constants
pub use types::{DATA_HEADER_SIZE, MAX_DATA_PACKET_SIZE, MAX_DATA_PAYLOAD, MAX_HELLO_NEIGHBORS};

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::traits::test_impls::{MockClock, MockOracle, MockRandom, MockTransport};

    type TestNode = Node<MockTransport, MockRandom, MockClock, MockOracle, StaticRoutes>;

    fn two_hop_routes() -> StaticRoutes {
        let mut routes = StaticRoutes::new();
        routes.add(1, 2, 2, 1);
        routes.add(1, 3, 2, 2);
        routes
    }

    fn node(id: NodeId, routes: StaticRoutes) -> TestNode {
        Node::new(
            MockTransport::with_addresses(
                MacAddr([2, 0, 0, 0, id as u8, 0]),
                MacAddr([2, 0, 0, 0, id as u8, 1]),
            ),
            MockRandom::with_seed(id as u64),
            MockClock::new(),
            MockOracle::new(),
            routes,
            id,
            SicaConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_node_creation() {
        let node = node(1, StaticRoutes::new());
        assert_eq!(node.node_id(), 1);
        assert!(!node.is_initialized());
        assert!(node.neighbors().is_empty());
        assert_eq!(node.metrics(), &NodeMetrics::default());
    }

    #[test]
    fn test_rejects_inverted_channel_range() {
        let config = SicaConfig {
            min_channel: 5,
            max_channel: 2,
            ..SicaConfig::default()
        };
        let result = Node::new(
            MockTransport::new(),
            MockRandom::new(),
            MockClock::new(),
            MockOracle::new(),
            StaticRoutes::new(),
            1,
            config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_hello_roundtrip_between_nodes() {
        let mut a = node(1, two_hop_routes());
        let mut b = node(2, StaticRoutes::new());
        a.initialize(Timestamp::ZERO);
        b.initialize(Timestamp::ZERO);

        // b's bootstrap hello reaches a on a's receive channel
        let now = Timestamp::from_secs(1);
        let mut t = Timestamp::ZERO;
        while t < now {
            t = b.next_wakeup().unwrap().min(now);
            b.handle_timer(t);
        }
        let hello = b
            .transport()
            .take_sent()
            .into_iter()
            .find(|f| f.channel == a.rx_channel() && f.port == b.config().hello_port)
            .unwrap();
        let received = Received {
            radio: Radio::Receive,
            port: hello.port,
            src: b.transport().address(Radio::Transmit),
            payload: hello.payload,
        };
        assert!(a.handle_transport_rx(received, now));

        let entry = a.neighbors().get(2).unwrap();
        assert_eq!(entry.channel, b.rx_channel());
        assert_eq!(entry.recv_addr, Some(b.transport().address(Radio::Receive)));

        // a can now reach 3 through 2
        a.send_data(3, vec![1, 2, 3], now).unwrap();
        assert_eq!(a.metrics().data_originated, 1);
    }
}
