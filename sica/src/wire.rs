//! Wire format serialization and deserialization.
//!
//! Fixed-width big-endian fields, cursor based. Times travel as 32-bit
//! millisecond counts, so sub-millisecond parts are truncated on encode.
//!
//! ## Hello Wire Format
//!
//! ```text
//! seq (4) || origin (4) || origin_time_ms (4) || radios (1) || channel (1)
//! || ext_bw (1) || new_channel (1) || recv_addr (6)
//! || switch_in_ms (4) || sense_in_ms (4) || count (1)
//! || clcpf_whole (4) || clcpf_thousandths (4) || ttl (4)
//! || count × (neighbor_id (4) || neighbor_channel (1))
//!
//! 43 + 5N bytes. Summaries are sorted by neighbor id, no duplicates.
//! ```
//!
//! ## Data Wire Format
//!
//! ```text
//! seq (4) || origin (4) || dest (4) || next_hop (4) || origin_time_ms (4)
//! || payload (rest of frame)
//! ```

use alloc::vec::Vec;
use core::fmt;

use crate::time::{Duration, Timestamp};
use crate::types::{
    ChannelId, MacAddr, NodeId, Payload, DATA_HEADER_SIZE, HELLO_TTL, MAX_DATA_PACKET_SIZE,
    MAX_HELLO_NEIGHBORS,
};

/// Fixed part of an encoded hello.
pub const HELLO_HEADER_SIZE: usize = 43;

/// Decoding error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of buffer.
    UnexpectedEof,
    /// Trailing bytes or a frame above the size limit.
    InvalidLength,
    /// Neighbor summaries not strictly ascending by id.
    InvalidValue,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of buffer"),
            DecodeError::InvalidLength => write!(f, "invalid length"),
            DecodeError::InvalidValue => write!(f, "invalid field value"),
        }
    }
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Read everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos.min(self.buf.len())..];
        self.pos = self.buf.len();
        slice
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_mac(&mut self) -> Result<MacAddr, DecodeError> {
        let bytes = self.read_bytes(6)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(bytes);
        Ok(MacAddr(mac))
    }

    /// Millisecond timestamp.
    pub fn read_time_ms(&mut self) -> Result<Timestamp, DecodeError> {
        Ok(Timestamp::from_millis(self.read_u32_be()? as u64))
    }

    /// Millisecond duration.
    pub fn read_duration_ms(&mut self) -> Result<Duration, DecodeError> {
        Ok(Duration::from_millis(self.read_u32_be()? as u64))
    }
}

/// Writer for encoding messages.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn write_u32_be(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_mac(&mut self, mac: &MacAddr) {
        self.write_bytes(&mac.0);
    }

    /// Millisecond timestamp, wrapping at 2^32 ms.
    pub fn write_time_ms(&mut self, t: Timestamp) {
        self.write_u32_be(t.as_millis() as u32);
    }

    /// Millisecond duration, saturating at `u32::MAX`.
    pub fn write_duration_ms(&mut self, d: Duration) {
        self.write_u32_be(d.as_millis().min(u32::MAX as u64) as u32);
    }

    /// Finish writing and return the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Trait for types that can be encoded to wire format.
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    /// Encode and return the bytes.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.finish()
    }
}

/// Trait for types that can be decoded from wire format.
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a byte slice (strict: rejects trailing bytes).
    fn decode_from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let result = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(result)
    }
}

/// Periodic beacon announcing a node's channel state.
#[derive(Clone, Debug, PartialEq)]
pub struct Hello {
    /// Sequence number; zero marks an invalid hello.
    pub seq: u32,
    pub origin: NodeId,
    /// Origin clock at creation.
    pub origin_time: Timestamp,
    /// Number of radios on the origin.
    pub radios: u8,
    /// Current receive channel of the origin.
    pub channel: ChannelId,
    /// Quantized external load the origin measured on `channel`.
    pub ext_bw: u8,
    /// Announced next receive channel (equal to `channel` when none is pending).
    pub new_channel: ChannelId,
    /// Address of the origin's receive radio.
    pub recv_addr: MacAddr,
    /// Time until the announced switch, zero when none is armed.
    pub switch_in: Duration,
    /// Time until the origin's next sensing window.
    pub sense_in: Duration,
    /// Lowest decision weight among the origin's other channels.
    pub clcpf: f64,
    pub ttl: u32,
    /// Direct neighbors of the origin as (id, receive channel), ascending by id.
    pub neighbors: Vec<(NodeId, ChannelId)>,
}

impl Hello {
    /// Hello with no neighbor summaries and `ttl` set to one hop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seq: u32,
        origin: NodeId,
        origin_time: Timestamp,
        radios: u8,
        channel: ChannelId,
        new_channel: ChannelId,
        recv_addr: MacAddr,
    ) -> Self {
        Self {
            seq,
            origin,
            origin_time,
            radios,
            channel,
            ext_bw: 0,
            new_channel,
            recv_addr,
            switch_in: Duration::ZERO,
            sense_in: Duration::ZERO,
            clcpf: 0.0,
            ttl: HELLO_TTL,
            neighbors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.seq > 0
    }

    /// Insert a neighbor summary keeping id order. Repeated ids are ignored.
    ///
    /// Panics when the hello already carries the maximum of 255 summaries.
    pub fn push_neighbor(&mut self, id: NodeId, channel: ChannelId) {
        match self.neighbors.binary_search_by_key(&id, |(n, _)| *n) {
            Ok(_) => {}
            Err(pos) => {
                assert!(
                    self.neighbors.len() < MAX_HELLO_NEIGHBORS,
                    "hello neighbor summary limit exceeded"
                );
                self.neighbors.insert(pos, (id, channel));
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        HELLO_HEADER_SIZE + 5 * self.neighbors.len()
    }
}

impl Encode for Hello {
    fn encode(&self, w: &mut Writer) {
        let whole = libm::floor(self.clcpf.max(0.0));
        let thousandths = libm::round((self.clcpf.max(0.0) - whole) * 1000.0);
        w.write_u32_be(self.seq);
        w.write_u32_be(self.origin);
        w.write_time_ms(self.origin_time);
        w.write_u8(self.radios);
        w.write_u8(self.channel);
        w.write_u8(self.ext_bw);
        w.write_u8(self.new_channel);
        w.write_mac(&self.recv_addr);
        w.write_duration_ms(self.switch_in);
        w.write_duration_ms(self.sense_in);
        w.write_u8(self.neighbors.len() as u8);
        w.write_u32_be(whole as u32);
        w.write_u32_be(thousandths as u32);
        w.write_u32_be(self.ttl);
        for (id, channel) in &self.neighbors {
            w.write_u32_be(*id);
            w.write_u8(*channel);
        }
    }
}

impl Decode for Hello {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let seq = r.read_u32_be()?;
        let origin = r.read_u32_be()?;
        let origin_time = r.read_time_ms()?;
        let radios = r.read_u8()?;
        let channel = r.read_u8()?;
        let ext_bw = r.read_u8()?;
        let new_channel = r.read_u8()?;
        let recv_addr = r.read_mac()?;
        let switch_in = r.read_duration_ms()?;
        let sense_in = r.read_duration_ms()?;
        let count = r.read_u8()? as usize;
        let whole = r.read_u32_be()?;
        let thousandths = r.read_u32_be()?;
        let ttl = r.read_u32_be()?;

        if r.remaining() < count * 5 {
            return Err(DecodeError::UnexpectedEof);
        }
        let mut neighbors = Vec::with_capacity(count);
        for _ in 0..count {
            let id = r.read_u32_be()?;
            let ch = r.read_u8()?;
            if neighbors.last().is_some_and(|(prev, _)| *prev >= id) {
                return Err(DecodeError::InvalidValue);
            }
            neighbors.push((id, ch));
        }

        Ok(Hello {
            seq,
            origin,
            origin_time,
            radios,
            channel,
            ext_bw,
            new_channel,
            recv_addr,
            switch_in,
            sense_in,
            clcpf: whole as f64 + thousandths as f64 / 1000.0,
            ttl,
            neighbors,
        })
    }
}

/// Header prepended to every data payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    /// Sequence number assigned by the node that last queued the packet.
    pub seq: u32,
    pub origin: NodeId,
    pub dest: NodeId,
    /// Neighbor the packet is queued for.
    pub next_hop: NodeId,
    /// Creation time at the origin, for delay accounting.
    pub origin_time: Timestamp,
}

impl Encode for DataHeader {
    fn encode(&self, w: &mut Writer) {
        w.write_u32_be(self.seq);
        w.write_u32_be(self.origin);
        w.write_u32_be(self.dest);
        w.write_u32_be(self.next_hop);
        w.write_time_ms(self.origin_time);
    }
}

impl Decode for DataHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(DataHeader {
            seq: r.read_u32_be()?,
            origin: r.read_u32_be()?,
            dest: r.read_u32_be()?,
            next_hop: r.read_u32_be()?,
            origin_time: r.read_time_ms()?,
        })
    }
}

/// Data header plus application payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPacket {
    pub header: DataHeader,
    pub payload: Payload,
}

impl Encode for DataPacket {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.write_bytes(&self.payload);
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(DATA_HEADER_SIZE + self.payload.len());
        self.encode(&mut w);
        w.finish()
    }
}

impl Decode for DataPacket {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.remaining() > MAX_DATA_PACKET_SIZE {
            return Err(DecodeError::InvalidLength);
        }
        let header = DataHeader::decode(r)?;
        let payload = r.read_rest().to_vec();
        Ok(DataPacket { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    fn sample_hello(neighbors: usize) -> Hello {
        let mut hello = Hello::new(
            7,
            42,
            Timestamp::from_millis(123_456),
            2,
            3,
            5,
            MacAddr([2, 0, 0, 0, 42, 0]),
        );
        hello.ext_bw = 4;
        hello.switch_in = Duration::from_millis(250_000);
        hello.sense_in = Duration::from_millis(1_500);
        hello.clcpf = 0.25;
        for i in 0..neighbors {
            hello.push_neighbor(1000 + i as u32, (i % 8) as u8 + 1);
        }
        hello
    }

    #[test]
    fn test_hello_roundtrip_with_summaries() {
        for count in [0usize, 1, 255] {
            let hello = sample_hello(count);
            let bytes = hello.encode_to_vec();
            assert_eq!(bytes.len(), 43 + 5 * count);
            assert_eq!(bytes.len(), hello.encoded_len());
            let decoded = Hello::decode_from_slice(&bytes).unwrap();
            assert_eq!(decoded, hello);
        }
    }

    #[test]
    fn test_hello_truncates_sub_millisecond_times() {
        let mut hello = sample_hello(0);
        hello.origin_time = Timestamp::from_micros(5_000_999);
        let decoded = Hello::decode_from_slice(&hello.encode_to_vec()).unwrap();
        assert_eq!(decoded.origin_time, Timestamp::from_millis(5_000));
    }

    #[test]
    fn test_push_neighbor_sorts_and_ignores_duplicates() {
        let mut hello = sample_hello(0);
        hello.push_neighbor(9, 1);
        hello.push_neighbor(3, 2);
        hello.push_neighbor(9, 4);
        assert_eq!(hello.neighbors, vec![(3, 2), (9, 1)]);
    }

    #[test]
    #[should_panic(expected = "summary limit")]
    fn test_push_neighbor_limit_is_fatal() {
        let mut hello = sample_hello(255);
        hello.push_neighbor(1, 1);
    }

    #[test]
    fn test_hello_rejects_truncated_and_unsorted() {
        let bytes = sample_hello(2).encode_to_vec();
        assert_eq!(
            Hello::decode_from_slice(&bytes[..bytes.len() - 1]),
            Err(DecodeError::UnexpectedEof)
        );

        let mut hello = sample_hello(0);
        hello.neighbors = vec![(5, 1), (4, 1)];
        assert_eq!(
            Hello::decode_from_slice(&hello.encode_to_vec()),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn test_validity_requires_positive_seq() {
        let mut hello = sample_hello(0);
        assert!(hello.is_valid());
        hello.seq = 0;
        assert!(!hello.is_valid());
    }

    #[test]
    fn test_data_packet_layout() {
        let packet = DataPacket {
            header: DataHeader {
                seq: 1,
                origin: 10,
                dest: 30,
                next_hop: 20,
                origin_time: Timestamp::from_millis(77),
            },
            payload: vec![0xAB; 16],
        };
        let bytes = packet.encode_to_vec();
        assert_eq!(bytes.len(), DATA_HEADER_SIZE + 16);
        assert_eq!(&bytes[8..12], &30u32.to_be_bytes());
        assert_eq!(DataPacket::decode_from_slice(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_data_packet_size_limit() {
        let oversized = vec![0u8; MAX_DATA_PACKET_SIZE + 1];
        assert_eq!(
            DataPacket::decode_from_slice(&oversized),
            Err(DecodeError::InvalidLength)
        );
        assert_eq!(
            DataPacket::decode_from_slice(&[0u8; 10]),
            Err(DecodeError::UnexpectedEof)
        );
    }
}
