//! Core types and constants for the channel assignment engine.

use alloc::vec::Vec;
use core::fmt;

use crate::time::Duration;

// Wire limits
pub const MAX_HELLO_NEIGHBORS: usize = 255;
pub const DATA_HEADER_SIZE: usize = 20;
pub const MAX_DATA_PACKET_SIZE: usize = 1054; // header + payload
pub const MAX_DATA_PAYLOAD: usize = MAX_DATA_PACKET_SIZE - DATA_HEADER_SIZE;

// Airtime estimates used by the drain loops
pub const HELLO_TX_ESTIMATE_BYTES: usize = 200;
pub const DATA_TX_ESTIMATE_BYTES: usize = MAX_DATA_PACKET_SIZE;

// Hellos never travel further than one hop
pub const HELLO_TTL: u32 = 1;

/// Node identifier (matches the 32-bit id carried in hellos).
pub type NodeId = u32;

/// Channel number within `[min_channel, max_channel]`.
pub type ChannelId = u8;

/// Opaque payload bytes.
pub type Payload = Vec<u8>;

/// 48-bit link-layer address of one radio.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const UNSET: MacAddr = MacAddr([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// The two radios of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Radio {
    /// Fixed-tuned radio that neighbors transmit to.
    Receive,
    /// Roaming radio that visits neighbor channels to deliver queued traffic.
    Transmit,
}

/// Kind of a queued packet; each channel queue keeps one FIFO per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Hello,
    Data,
}

/// Why a data packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Routing collaborator has no next hop.
    NoRoute,
    /// Next hop is not a neighbor with a known receive address.
    NoNeighborAddress,
    /// Data header could not be decoded.
    Malformed,
}

/// Events emitted by the node for application handling and tracing.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Data originated locally was queued for transmission.
    DataOriginated { dest: NodeId, seq: u32, size: usize },
    /// Data addressed to this node arrived.
    DataDelivered {
        origin: NodeId,
        seq: u32,
        delay: Duration,
        size: usize,
    },
    /// Data was abandoned before transmission.
    DataDropped { dest: NodeId, reason: DropReason },
    /// A hello left a radio.
    HelloSent { channel: ChannelId, seq: u32 },
    /// Selection probabilities of one assignment cycle, ascending by weight.
    ChannelProbabilities { entries: Vec<(ChannelId, f64)> },
    /// The receive radio was retuned.
    ChannelSwitched { from: ChannelId, to: ChannelId },
    /// A direct neighbor completed an announced switch.
    NeighborSwitched {
        neighbor: NodeId,
        from: ChannelId,
        to: ChannelId,
    },
    /// A sensing window finished with this external load estimate.
    BandwidthSensed { channel: ChannelId, bandwidth: u32 },
}

/// Per-node counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMetrics {
    pub hellos_sent: u64,
    pub hellos_received: u64,
    /// Hellos that failed decoding, validation or freshness checks.
    pub hellos_rejected: u64,
    pub data_originated: u64,
    pub data_forwarded: u64,
    pub data_delivered: u64,
    pub data_dropped: u64,
    /// Frames left queued because the outgoing transport channel was full.
    pub frames_blocked: u64,
    pub channel_switches: u64,
    pub neighbor_switches: u64,
    pub sensing_windows: u64,
    pub events_dropped: u64,
}

/// Error type for application-facing node operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// No next hop towards the destination.
    NoRoute,
    /// Next hop is known but its receive address is not.
    NoNeighborAddress,
    /// Payload exceeds the maximum data packet size.
    PayloadTooLarge,
    /// `initialize` has not been called yet.
    NotInitialized,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoRoute => write!(f, "no route to destination"),
            Error::NoNeighborAddress => write!(f, "next hop has no known receive address"),
            Error::PayloadTooLarge => write!(f, "payload too large"),
            Error::NotInitialized => write!(f, "node not initialized"),
        }
    }
}

impl From<Error> for DropReason {
    fn from(err: Error) -> Self {
        match err {
            Error::NoNeighborAddress => DropReason::NoNeighborAddress,
            _ => DropReason::NoRoute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_mac_addr_debug_and_flags() {
        let mac = MacAddr([0x02, 0, 0, 0, 0x2a, 1]);
        assert_eq!(format!("{:?}", mac), "02:00:00:00:2a:01");
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::default().is_unset());
    }

    #[test]
    fn test_size_constants() {
        assert_eq!(MAX_DATA_PAYLOAD, 1034);
        assert!(HELLO_TX_ESTIMATE_BYTES < DATA_TX_ESTIMATE_BYTES);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoRoute), "no route to destination");
        assert_eq!(
            DropReason::from(Error::NoNeighborAddress),
            DropReason::NoNeighborAddress
        );
    }
}
