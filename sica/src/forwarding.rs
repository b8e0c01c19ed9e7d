//! Data origination, forwarding and delivery.
//!
//! Data is channel-routed: the routing collaborator names the next hop and
//! the packet waits in the queue of the channel that neighbor listens on.

use log::{log, Level};

use crate::node::Node;
use crate::queue::QueueEntry;
use crate::time::Timestamp;
use crate::traits::{ChannelOracle, Clock, Random, RouteLookup, Transport};
use crate::types::{
    ChannelId, DropReason, Error, Event, NodeId, Payload, DATA_HEADER_SIZE, MAX_DATA_PACKET_SIZE,
    MAX_DATA_PAYLOAD,
};
use crate::wire::{DataHeader, DataPacket, Decode, Encode, Reader};

impl<T, R, Clk, O, Rt> Node<T, R, Clk, O, Rt>
where
    T: Transport,
    R: Random,
    Clk: Clock,
    O: ChannelOracle,
    Rt: RouteLookup,
{
    /// Originate a data packet towards `dest`.
    ///
    /// The packet is queued on the next hop's channel. Fails without
    /// retrying when there is no route or the next hop's receive address is
    /// unknown; the drop is also reported as an event.
    ///
    /// ```
    /// use sica::routing::StaticRoutes;
    /// use sica::traits::test_impls::{MockClock, MockOracle, MockRandom, MockTransport};
    /// use sica::{Error, Node, SicaConfig, Timestamp};
    ///
    /// let mut node = Node::new(
    ///     MockTransport::new(),
    ///     MockRandom::new(),
    ///     MockClock::new(),
    ///     MockOracle::new(),
    ///     StaticRoutes::new(),
    ///     1,
    ///     SicaConfig::default(),
    /// )
    /// .unwrap();
    /// node.initialize(Timestamp::ZERO);
    /// assert_eq!(node.send_data(2, vec![0; 16], Timestamp::ZERO), Err(Error::NoRoute));
    /// ```
    pub fn send_data(&mut self, dest: NodeId, payload: Payload, now: Timestamp) -> Result<(), Error> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if payload.len() > MAX_DATA_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }
        let size = payload.len();
        let origin = self.node_id();
        match self.queue_data(origin, dest, now, payload, now) {
            Ok((channel, seq)) => {
                self.metrics_mut().data_originated += 1;
                self.push_event(Event::DataOriginated { dest, seq, size });
                log!(
                    Level::Info,
                    "node {}: data of {} bytes for {} queued on channel {}",
                    origin,
                    size,
                    dest,
                    channel
                );
                Ok(())
            }
            Err(e) => {
                self.drop_data(dest, e.clone().into());
                Err(e)
            }
        }
    }

    /// Head a payload for its next hop and queue it on that hop's channel.
    /// Returns the channel and the sequence number used.
    pub(crate) fn queue_data(
        &mut self,
        origin: NodeId,
        dest: NodeId,
        origin_time: Timestamp,
        payload: Payload,
        now: Timestamp,
    ) -> Result<(ChannelId, u32), Error> {
        let own = self.node_id();
        let next_hop = self.routes().next_hop(own, dest).ok_or(Error::NoRoute)?;
        let channel = self
            .neighbors()
            .get(next_hop)
            .filter(|n| n.recv_addr.is_some())
            .map(|n| n.channel)
            .ok_or(Error::NoNeighborAddress)?;

        let header = DataHeader {
            seq: self.next_seq(),
            origin,
            dest,
            next_hop,
            origin_time,
        };
        let bytes = DataPacket { header, payload }.encode_to_vec();
        let expires_at = now + self.config().data_expire;
        self.queues_mut()
            .enqueue(channel, QueueEntry::data(&header, bytes, expires_at));
        Ok((channel, header.seq))
    }

    /// Handle a received data frame: deliver it locally or forward it.
    pub(crate) fn process_data(&mut self, frame: &[u8], now: Timestamp) -> bool {
        let mut r = Reader::new(frame);
        let header = match DataHeader::decode(&mut r) {
            Ok(h) => h,
            Err(e) => {
                log!(Level::Debug, "node {}: bad data header: {}", self.node_id(), e);
                self.metrics_mut().data_dropped += 1;
                return false;
            }
        };
        if frame.len() > MAX_DATA_PACKET_SIZE {
            self.drop_data(header.dest, DropReason::Malformed);
            return false;
        }
        let payload = r.read_rest().to_vec();
        debug_assert_eq!(payload.len() + DATA_HEADER_SIZE, frame.len());

        if header.dest == self.node_id() {
            let delay = now.saturating_sub(header.origin_time);
            log!(
                Level::Info,
                "node {}: data seq {} from {} delivered after {:?}",
                self.node_id(),
                header.seq,
                header.origin,
                delay
            );
            self.metrics_mut().data_delivered += 1;
            self.push_event(Event::DataDelivered {
                origin: header.origin,
                seq: header.seq,
                delay,
                size: payload.len(),
            });
            self.push_incoming_data(header.origin, payload);
            return true;
        }

        match self.queue_data(header.origin, header.dest, header.origin_time, payload, now) {
            Ok((channel, _)) => {
                self.metrics_mut().data_forwarded += 1;
                log!(
                    Level::Debug,
                    "node {}: forwarding data for {} on channel {}",
                    self.node_id(),
                    header.dest,
                    channel
                );
            }
            Err(e) => self.drop_data(header.dest, e.into()),
        }
        true
    }

    pub(crate) fn drop_data(&mut self, dest: NodeId, reason: DropReason) {
        log!(
            Level::Info,
            "node {}: data for {} dropped ({:?})",
            self.node_id(),
            dest,
            reason
        );
        self.metrics_mut().data_dropped += 1;
        self.push_event(Event::DataDropped { dest, reason });
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use crate::node::test_support::*;
    use crate::routing::StaticRoutes;
    use crate::time::{Duration, Timestamp};
    use crate::traits::Received;
    use crate::types::{DropReason, Error, Event, PacketKind, Radio, MAX_DATA_PAYLOAD};
    use crate::wire::{DataHeader, DataPacket, Decode, Encode};

    fn data_frame(node: &TestNode, header: DataHeader, payload: &[u8]) -> Received {
        Received {
            radio: Radio::Receive,
            port: node.config().data_port,
            src: mac(header.origin, 1),
            payload: DataPacket {
                header,
                payload: payload.to_vec(),
            }
            .encode_to_vec(),
        }
    }

    fn routed_node() -> TestNode {
        let mut routes = StaticRoutes::new();
        routes.add(1, 3, 2, 2);
        routes.add(1, 2, 2, 1);
        let mut node = test_node(1, routes);
        node.initialize(Timestamp::ZERO);
        node
    }

    #[test]
    fn test_send_queues_on_next_hop_channel() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);
        deliver_hello(&mut node, &hello_from(2, 1, 6, now), now);
        drain_events(&node);

        node.send_data(3, vec![7; 32], now).unwrap();
        let entry = node.queues_mut().peek(6, PacketKind::Data, now).unwrap();
        assert_eq!(entry.next_hop, Some(2));
        assert_eq!(entry.dest, Some(3));
        assert_eq!(entry.expires_at, now + node.config().data_expire);

        let packet = DataPacket::decode_from_slice(&entry.bytes).unwrap();
        assert_eq!(packet.header.origin, 1);
        assert_eq!(packet.header.origin_time, now);
        assert_eq!(packet.payload, vec![7; 32]);

        assert_eq!(node.metrics().data_originated, 1);
        assert!(matches!(
            drain_events(&node).as_slice(),
            [Event::DataOriginated { dest: 3, size: 32, .. }]
        ));
    }

    #[test]
    fn test_send_failures_drop_and_report() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(1);

        assert_eq!(node.send_data(9, vec![1], now), Err(Error::NoRoute));
        // route exists but the next hop has not been heard yet
        assert_eq!(node.send_data(3, vec![1], now), Err(Error::NoNeighborAddress));
        assert_eq!(
            node.send_data(3, vec![0; MAX_DATA_PAYLOAD + 1], now),
            Err(Error::PayloadTooLarge)
        );
        assert_eq!(node.metrics().data_dropped, 2);
        assert_eq!(
            drain_events(&node)
                .into_iter()
                .filter(|e| matches!(e, Event::DataDropped { .. }))
                .collect::<alloc::vec::Vec<_>>(),
            vec![
                Event::DataDropped {
                    dest: 9,
                    reason: DropReason::NoRoute
                },
                Event::DataDropped {
                    dest: 3,
                    reason: DropReason::NoNeighborAddress
                },
            ]
        );
    }

    #[test]
    fn test_send_before_initialize_fails() {
        let mut node = test_node(1, StaticRoutes::new());
        assert_eq!(
            node.send_data(2, vec![1], Timestamp::ZERO),
            Err(Error::NotInitialized)
        );
    }

    #[test]
    fn test_local_data_is_delivered_with_delay() {
        let mut node = routed_node();
        let header = DataHeader {
            seq: 4,
            origin: 5,
            dest: 1,
            next_hop: 1,
            origin_time: Timestamp::from_millis(1500),
        };
        let frame = data_frame(&node, header, b"hello");
        let now = Timestamp::from_millis(1750);
        assert!(node.handle_transport_rx(frame, now));

        let data = node.incoming().try_receive().unwrap();
        assert_eq!(data.from, 5);
        assert_eq!(data.payload, b"hello".to_vec());
        assert_eq!(node.metrics().data_delivered, 1);
        assert!(drain_events(&node).contains(&Event::DataDelivered {
            origin: 5,
            seq: 4,
            delay: Duration::from_millis(250),
            size: 5,
        }));
    }

    #[test]
    fn test_transit_data_is_reheaded_for_next_hop() {
        let mut node = routed_node();
        let now = Timestamp::from_secs(2);
        deliver_hello(&mut node, &hello_from(2, 1, 4, now), now);

        let header = DataHeader {
            seq: 77,
            origin: 8,
            dest: 3,
            next_hop: 1,
            origin_time: Timestamp::from_secs(1),
        };
        let frame = data_frame(&node, header, &[9, 9]);
        assert!(node.handle_transport_rx(frame, now));

        let entry = node.queues_mut().peek(4, PacketKind::Data, now).unwrap();
        let packet = DataPacket::decode_from_slice(&entry.bytes).unwrap();
        assert_eq!(packet.header.origin, 8);
        assert_eq!(packet.header.dest, 3);
        assert_eq!(packet.header.next_hop, 2);
        assert_eq!(packet.header.origin_time, Timestamp::from_secs(1));
        assert_ne!(packet.header.seq, 77);
        assert_eq!(node.metrics().data_forwarded, 1);
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let mut node = routed_node();
        let frame = Received {
            radio: Radio::Receive,
            port: node.config().data_port,
            src: mac(2, 1),
            payload: vec![0; 7],
        };
        assert!(!node.handle_transport_rx(frame, Timestamp::ZERO));
        assert_eq!(node.metrics().data_dropped, 1);
    }
}
