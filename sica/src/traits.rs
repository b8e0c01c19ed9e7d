//! Collaborator traits: transport, time, randomness, channel state and routing.
//!
//! The engine never touches hardware or global state directly. Everything
//! outside the protocol is injected through these traits, so the same
//! node runs on a dual-radio board or inside the simulator:
//! - [`Transport`] owns both radios and the frame queues
//! - [`Clock`] provides the time base
//! - [`Random`] drives channel selection and jitter
//! - [`ChannelOracle`] reports external interference (carrier sense)
//! - [`RouteLookup`] answers next-hop queries

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::time::{Duration, Timestamp};
use crate::types::{ChannelId, Event, MacAddr, NodeId, Payload, Radio};

/// Queue size for transport channels.
pub(crate) const TRANSPORT_QUEUE_SIZE: usize = 32;

/// Queue size for application-level channels.
pub(crate) const APP_QUEUE_SIZE: usize = 8;

/// Queue size for event channel.
pub(crate) const EVENT_QUEUE_SIZE: usize = 64;

/// Mutex type used for channels.
pub(crate) type ChannelMutex = CriticalSectionRawMutex;

/// Frame handed to a radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Radio that sends the frame.
    pub radio: Radio,
    /// Channel the radio is tuned to when sending.
    pub channel: ChannelId,
    /// Link-layer destination, [`MacAddr::BROADCAST`] for hellos.
    pub dest: MacAddr,
    /// Hello or data port.
    pub port: u16,
    pub payload: Vec<u8>,
}

/// Frame received by the receive radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub radio: Radio,
    pub port: u16,
    /// Address of the sending radio.
    pub src: MacAddr,
    pub payload: Vec<u8>,
}

/// Outgoing frame channel type.
pub type TransportOutChannel = Channel<ChannelMutex, Frame, TRANSPORT_QUEUE_SIZE>;

/// Incoming frame channel type.
pub type TransportInChannel = Channel<ChannelMutex, Received, TRANSPORT_QUEUE_SIZE>;

/// Data received from another node (application level).
#[derive(Debug, Clone)]
pub struct IncomingData {
    /// Node that originated this data.
    pub from: NodeId,
    pub payload: Payload,
}

/// Data to send to another node (application level).
#[derive(Debug, Clone)]
pub struct OutgoingData {
    pub target: NodeId,
    pub payload: Payload,
}

/// Application-level incoming data channel.
pub type AppInChannel = Channel<ChannelMutex, IncomingData, APP_QUEUE_SIZE>;

/// Application-level outgoing data channel.
pub type AppOutChannel = Channel<ChannelMutex, OutgoingData, APP_QUEUE_SIZE>;

/// Protocol event channel.
pub type EventChannel = Channel<ChannelMutex, Event, EVENT_QUEUE_SIZE>;

/// Dual-radio link layer.
///
/// The node pushes frames into `outgoing()` and a driver (or the
/// simulator) puts them on the air. Received frames come back through
/// `incoming()`. When `outgoing()` is full the node keeps the packet queued
/// and retries on the next drain.
///
/// ```
/// use sica::traits::test_impls::MockTransport;
/// use sica::traits::Transport;
/// use sica::{Radio, Timestamp};
///
/// let mut transport = MockTransport::new();
/// transport.set_channel(Radio::Transmit, 4, Timestamp::ZERO);
/// assert_eq!(transport.channel(Radio::Transmit), 4);
/// assert!(transport.take_sent().is_empty());
/// ```
pub trait Transport {
    /// Number of radios announced in hellos.
    fn radio_count(&self) -> u8 {
        2
    }

    /// Link-layer address of a radio.
    fn address(&self, radio: Radio) -> MacAddr;

    /// Channel a radio is tuned to.
    fn channel(&self, radio: Radio) -> ChannelId;

    /// Retune a radio. The radio is unusable while [`is_switching`](Self::is_switching).
    fn set_channel(&mut self, radio: Radio, channel: ChannelId, now: Timestamp);

    /// True while a retune is in progress.
    fn is_switching(&self, radio: Radio, now: Timestamp) -> bool;

    /// Estimated airtime of a frame of `bytes` bytes.
    fn tx_duration(&self, bytes: usize) -> Duration;

    fn outgoing(&self) -> &TransportOutChannel;

    fn incoming(&self) -> &TransportInChannel;
}

/// External interference as seen by carrier sense.
pub trait ChannelOracle {
    /// True while the channel is occupied by traffic outside the protocol.
    fn is_busy(&self, channel: ChannelId, now: Timestamp) -> bool;

    /// Predicted time until a busy channel turns idle.
    fn idle_in(&self, channel: ChannelId, now: Timestamp) -> Duration {
        let _ = (channel, now);
        Duration::ZERO
    }
}

impl<O: ChannelOracle + ?Sized> ChannelOracle for Rc<O> {
    fn is_busy(&self, channel: ChannelId, now: Timestamp) -> bool {
        (**self).is_busy(channel, now)
    }

    fn idle_in(&self, channel: ChannelId, now: Timestamp) -> Duration {
        (**self).idle_in(channel, now)
    }
}

/// Static next-hop lookup.
pub trait RouteLookup {
    /// Next hop from `src` towards `dst`; `src` itself when both are equal.
    fn next_hop(&self, src: NodeId, dst: NodeId) -> Option<NodeId>;
}

impl<R: RouteLookup + ?Sized> RouteLookup for Rc<R> {
    fn next_hop(&self, src: NodeId, dst: NodeId) -> Option<NodeId> {
        (**self).next_hop(src, dst)
    }
}

/// Time source trait for real or simulated time.
///
/// # Example (testing with MockClock)
///
/// ```
/// use sica::traits::test_impls::MockClock;
/// use sica::{Clock, Duration, Timestamp};
///
/// let clock = MockClock::new();
/// assert_eq!(clock.now(), Timestamp::ZERO);
///
/// clock.advance(Duration::from_micros(300));
/// assert_eq!(clock.now().as_micros(), 300);
///
/// clock.set(Timestamp::from_secs(5));
/// assert_eq!(clock.now().as_millis(), 5000);
/// ```
///
/// # Example (embedded with embassy)
///
/// ```text
/// struct EmbassyClock;
///
/// impl Clock for EmbassyClock {
///     type SleepFuture<'a> = embassy_time::Timer;
///
///     fn now(&self) -> Timestamp {
///         Timestamp::from_micros(embassy_time::Instant::now().as_micros())
///     }
///
///     fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_> {
///         embassy_time::Timer::at(embassy_time::Instant::from_micros(time.as_micros()))
///     }
/// }
/// ```
pub trait Clock {
    /// Future type returned by sleep_until.
    type SleepFuture<'a>: Future<Output = ()>
    where
        Self: 'a;

    fn now(&self) -> Timestamp;

    /// Sleep until the given timestamp.
    fn sleep_until(&self, time: Timestamp) -> Self::SleepFuture<'_>;
}

/// Random number generator trait.
///
/// Used for the initial channel, channel selection and switch jitter.
pub trait Random {
    /// Generate a random u64 in the range [min, max).
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn gen_u32(&mut self) -> u32 {
        self.gen_range(0, u32::MAX as u64 + 1) as u32
    }

    /// Uniform sample in [0, 1).
    fn gen_f64(&mut self) -> f64 {
        const SCALE: u64 = 1 << 53;
        self.gen_range(0, SCALE) as f64 / SCALE as f64
    }
}

/// [`Random`] backed by the WyRand generator.
pub struct WyRandom {
    rng: WyRand,
}

impl WyRandom {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: WyRand::seed_from_u64(seed),
        }
    }
}

impl Random for WyRandom {
    fn gen_range(&mut self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        min + self.rng.next_u64() % (max - min)
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock implementations of traits for unit testing and doc tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use core::cell::{Cell, RefCell};
    use core::future::{ready, Ready};

    use super::*;

    /// Mock transport: frames stay in the outgoing channel until taken.
    pub struct MockTransport {
        recv_addr: MacAddr,
        xmit_addr: MacAddr,
        rx_channel: ChannelId,
        tx_channel: ChannelId,
        switching_delay: Duration,
        rx_switch_done: Timestamp,
        tx_switch_done: Timestamp,
        outgoing: TransportOutChannel,
        incoming: TransportInChannel,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::with_addresses(MacAddr([2, 0, 0, 0, 0, 0]), MacAddr([2, 0, 0, 0, 0, 1]))
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_addresses(recv_addr: MacAddr, xmit_addr: MacAddr) -> Self {
            Self {
                recv_addr,
                xmit_addr,
                rx_channel: 0,
                tx_channel: 0,
                switching_delay: Duration::ZERO,
                rx_switch_done: Timestamp::ZERO,
                tx_switch_done: Timestamp::ZERO,
                outgoing: Channel::new(),
                incoming: Channel::new(),
            }
        }

        /// Make retunes take `delay`.
        pub fn with_switching_delay(mut self, delay: Duration) -> Self {
            self.switching_delay = delay;
            self
        }

        /// Inject a frame as if it was received.
        pub fn inject_rx(&self, port: u16, src: MacAddr, payload: Vec<u8>) {
            let _ = self.incoming.try_send(Received {
                radio: Radio::Receive,
                port,
                src,
                payload,
            });
        }

        /// Take all sent frames in send order.
        pub fn take_sent(&self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outgoing.try_receive() {
                frames.push(frame);
            }
            frames
        }
    }

    impl Transport for MockTransport {
        fn address(&self, radio: Radio) -> MacAddr {
            match radio {
                Radio::Receive => self.recv_addr,
                Radio::Transmit => self.xmit_addr,
            }
        }

        fn channel(&self, radio: Radio) -> ChannelId {
            match radio {
                Radio::Receive => self.rx_channel,
                Radio::Transmit => self.tx_channel,
            }
        }

        fn set_channel(&mut self, radio: Radio, channel: ChannelId, now: Timestamp) {
            let done = now + self.switching_delay;
            match radio {
                Radio::Receive => {
                    self.rx_channel = channel;
                    self.rx_switch_done = done;
                }
                Radio::Transmit => {
                    self.tx_channel = channel;
                    self.tx_switch_done = done;
                }
            }
        }

        fn is_switching(&self, radio: Radio, now: Timestamp) -> bool {
            match radio {
                Radio::Receive => now < self.rx_switch_done,
                Radio::Transmit => now < self.tx_switch_done,
            }
        }

        fn tx_duration(&self, bytes: usize) -> Duration {
            // 8 Mbit/s, one byte per microsecond
            Duration::from_micros(bytes as u64)
        }

        fn outgoing(&self) -> &TransportOutChannel {
            &self.outgoing
        }

        fn incoming(&self) -> &TransportInChannel {
            &self.incoming
        }
    }

    /// Mock clock for testing (synchronous, time advances manually).
    pub struct MockClock {
        current: Cell<Timestamp>,
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self {
                current: Cell::new(Timestamp::ZERO),
            }
        }
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn at(time: Timestamp) -> Self {
            Self {
                current: Cell::new(time),
            }
        }

        pub fn set(&self, time: Timestamp) {
            self.current.set(time);
        }

        pub fn advance(&self, duration: Duration) {
            self.current.set(self.current.get() + duration);
        }
    }

    impl Clock for MockClock {
        type SleepFuture<'a> = Ready<()>;

        fn now(&self) -> Timestamp {
            self.current.get()
        }

        fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
            // Tests advance time manually.
            ready(())
        }
    }

    /// Mock random for testing (deterministic).
    pub struct MockRandom {
        pub state: u64,
    }

    impl Default for MockRandom {
        fn default() -> Self {
            Self { state: 12345 }
        }
    }

    impl MockRandom {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_seed(seed: u64) -> Self {
            Self { state: seed }
        }
    }

    impl Random for MockRandom {
        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            // Simple LCG
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let range = max.saturating_sub(min);
            if range == 0 {
                return min;
            }
            min + (self.state >> 11) % range
        }
    }

    /// Interference oracle with manually toggled busy channels.
    #[derive(Default)]
    pub struct MockOracle {
        busy: RefCell<Vec<ChannelId>>,
        idle_in: Cell<Duration>,
    }

    impl MockOracle {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_busy(&self, channel: ChannelId, busy: bool) {
            let mut list = self.busy.borrow_mut();
            list.retain(|c| *c != channel);
            if busy {
                list.push(channel);
            }
        }

        /// Value reported by `idle_in` for busy channels.
        pub fn set_idle_in(&self, delay: Duration) {
            self.idle_in.set(delay);
        }
    }

    impl ChannelOracle for MockOracle {
        fn is_busy(&self, channel: ChannelId, _now: Timestamp) -> bool {
            self.busy.borrow().contains(&channel)
        }

        fn idle_in(&self, channel: ChannelId, now: Timestamp) -> Duration {
            if self.is_busy(channel, now) {
                self.idle_in.get()
            } else {
                Duration::ZERO
            }
        }
    }
}
