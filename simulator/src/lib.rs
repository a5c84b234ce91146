//! Deliver timers and messages between simulated peers in deterministic virtual time.
//!
//! A [Simulator] owns a virtual clock (starting at [UNIX_EPOCH]) and a min-heap of
//! pending alarms. Timers ([Simulator::schedule]) and messages ([Simulator::send]) are
//! both alarms: a message is delivered after a delay sampled from the [Link] between its
//! origin and recipient on the given [Channel]. [Simulator::run] pops alarms in time order
//! and hands each one to a [Handler], one at a time. Alarms due at the same instant are
//! delivered in the order they were created.
//!
//! Given the same seed and the same sequence of calls, a run is fully reproducible.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use qunet_simulator::{Config, Envelope, Handler, Link, Simulator};
//! use std::{convert::Infallible, time::Duration};
//!
//! struct Counter(usize);
//!
//! impl Handler<u32, &'static str> for Counter {
//!     type Error = Infallible;
//!
//!     fn handle(
//!         &mut self,
//!         _: &mut Simulator<u32, &'static str>,
//!         _: Envelope<u32, &'static str>,
//!     ) -> Result<(), Infallible> {
//!         self.0 += 1;
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = Registry::default();
//! let mut simulator = Simulator::new(&mut registry, Config { seed: 0 });
//! let link = Link { latency: Duration::from_millis(10), jitter: Duration::ZERO };
//! simulator.link(0, 1, 0, link).unwrap();
//! simulator.send(0, 0, 1, "hello").unwrap();
//! simulator.schedule_after(Duration::from_secs(1), 0, "tick");
//!
//! let mut counter = Counter(0);
//! simulator.run(&mut counter, None).unwrap();
//! assert_eq!(counter.0, 2);
//! ```

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt::Debug,
    hash::Hash,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::trace;

/// Identifier of a logical channel between two peers (e.g. quantum or classical).
pub type Channel = u32;

/// Errors that can occur when configuring or using a [Simulator].
#[derive(Debug, Error)]
pub enum Error {
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("invalid jitter: {0:?}")]
    InvalidJitter(Duration),
    #[error("no link from {origin} to {recipient} on channel {channel}")]
    MissingLink {
        origin: String,
        recipient: String,
        channel: Channel,
    },
}

/// Configuration for a [Simulator].
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Seed for the random number generator used to sample link latency.
    pub seed: u64,
}

/// Describes a connection between two peers on one channel.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Copy, Debug)]
pub struct Link {
    /// Mean latency for the delivery of a message.
    pub latency: Duration,

    /// Standard deviation of the latency for the delivery of a message.
    pub jitter: Duration,
}

impl Link {
    /// A link that delivers every message after exactly `latency`.
    pub const fn fixed(latency: Duration) -> Self {
        Self {
            latency,
            jitter: Duration::ZERO,
        }
    }
}

/// A timer or message handed to a [Handler].
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<A, P> {
    /// Peer that sent the message (`None` for timers).
    pub origin: Option<A>,
    /// Peer the event is addressed to.
    pub recipient: A,
    /// Channel the message travelled on (`None` for timers).
    pub channel: Option<Channel>,
    pub payload: P,
}

/// Consumer of the events delivered by a [Simulator].
pub trait Handler<A, P> {
    type Error;

    /// Process one event.
    ///
    /// The handler may schedule new timers and send new messages through `simulator`. Returning
    /// an error stops [Simulator::run].
    fn handle(
        &mut self,
        simulator: &mut Simulator<A, P>,
        envelope: Envelope<A, P>,
    ) -> Result<(), Self::Error>;
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Message {
    channel: Channel,
}

#[derive(Debug)]
struct Metrics {
    events: Counter,
    messages_sent: Family<Message, Counter>,
}

impl Metrics {
    fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            events: Counter::default(),
            messages_sent: Family::default(),
        };
        registry.register(
            "events",
            "Total number of events delivered",
            metrics.events.clone(),
        );
        registry.register(
            "messages_sent",
            "Total number of messages sent",
            metrics.messages_sent.clone(),
        );
        metrics
    }
}

struct Alarm<A, P> {
    time: SystemTime,
    sequence: u64,
    envelope: Envelope<A, P>,
}

impl<A, P> PartialEq for Alarm<A, P> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl<A, P> Eq for Alarm<A, P> {}

impl<A, P> PartialOrd for Alarm<A, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A, P> Ord for Alarm<A, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Deterministic discrete-event scheduler.
pub struct Simulator<A, P> {
    rng: StdRng,
    time: SystemTime,
    sequence: u64,
    alarms: BinaryHeap<Alarm<A, P>>,
    links: HashMap<(A, A, Channel), Normal<f64>>,

    metrics: Metrics,
}

impl<A: Copy + Eq + Hash + Debug, P> Simulator<A, P> {
    /// Create a new simulator with its metrics registered in `registry`.
    pub fn new(registry: &mut Registry, cfg: Config) -> Self {
        Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            time: UNIX_EPOCH,
            sequence: 0,
            alarms: BinaryHeap::new(),
            links: HashMap::new(),
            metrics: Metrics::init(registry),
        }
    }

    /// Current virtual time.
    pub fn current(&self) -> SystemTime {
        self.time
    }

    /// Virtual time elapsed since the simulation started.
    pub fn elapsed(&self) -> Duration {
        self.time.duration_since(UNIX_EPOCH).unwrap_or_default()
    }

    /// Number of alarms that have not been delivered yet.
    pub fn pending(&self) -> usize {
        self.alarms.len()
    }

    /// Create a unidirectional link between two peers on `channel`.
    ///
    /// Link can be called multiple times for the same sender/receiver. The latest
    /// setting will be used.
    pub fn link(
        &mut self,
        origin: A,
        recipient: A,
        channel: Channel,
        link: Link,
    ) -> Result<(), Error> {
        if origin == recipient {
            return Err(Error::LinkingSelf);
        }
        let distribution = Normal::new(link.latency.as_secs_f64(), link.jitter.as_secs_f64())
            .map_err(|_| Error::InvalidJitter(link.jitter))?;
        self.links.insert((origin, recipient, channel), distribution);
        Ok(())
    }

    /// Deliver `payload` to `recipient` at `at` (or now, if `at` is in the past).
    pub fn schedule(&mut self, at: SystemTime, recipient: A, payload: P) {
        let at = at.max(self.time);
        self.push(at, None, recipient, None, payload);
    }

    /// Deliver `payload` to `recipient` once `delay` has elapsed.
    pub fn schedule_after(&mut self, delay: Duration, recipient: A, payload: P) {
        let at = self.time + delay;
        self.push(at, None, recipient, None, payload);
    }

    /// Send `payload` from `origin` to `recipient` over the link registered on `channel`.
    ///
    /// Returns the sampled delivery delay.
    pub fn send(
        &mut self,
        channel: Channel,
        origin: A,
        recipient: A,
        payload: P,
    ) -> Result<Duration, Error> {
        let Some(distribution) = self.links.get(&(origin, recipient, channel)) else {
            return Err(Error::MissingLink {
                origin: format!("{origin:?}"),
                recipient: format!("{recipient:?}"),
                channel,
            });
        };
        let delay = Duration::from_secs_f64(distribution.sample(&mut self.rng).max(0.0));
        self.metrics
            .messages_sent
            .get_or_create(&Message { channel })
            .inc();
        trace!(?origin, ?recipient, channel, ?delay, "sending message");
        let at = self.time + delay;
        self.push(at, Some(origin), recipient, Some(channel), payload);
        Ok(delay)
    }

    /// Deliver alarms to `handler` in time order until none remain or the next one is due
    /// after `deadline`.
    ///
    /// When stopping at `deadline`, the clock is advanced to it. Returns the number of events
    /// delivered.
    pub fn run<H: Handler<A, P>>(
        &mut self,
        handler: &mut H,
        deadline: Option<SystemTime>,
    ) -> Result<usize, H::Error> {
        let mut delivered = 0;
        loop {
            let Some(due) = self.alarms.peek().map(|alarm| alarm.time) else {
                break;
            };
            if let Some(deadline) = deadline {
                if due > deadline {
                    self.time = self.time.max(deadline);
                    break;
                }
            }
            let Some(alarm) = self.alarms.pop() else {
                break;
            };
            self.time = alarm.time;
            self.metrics.events.inc();
            trace!(
                sequence = alarm.sequence,
                recipient = ?alarm.envelope.recipient,
                "delivering event"
            );
            handler.handle(self, alarm.envelope)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn push(
        &mut self,
        time: SystemTime,
        origin: Option<A>,
        recipient: A,
        channel: Option<Channel>,
        payload: P,
    ) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.alarms.push(Alarm {
            time,
            sequence,
            envelope: Envelope {
                origin,
                recipient,
                channel,
                payload,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;

    /// Records every event along with the time it was delivered.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(Duration, u32, &'static str)>,
    }

    impl Handler<u32, &'static str> for Recorder {
        type Error = Error;

        fn handle(
            &mut self,
            simulator: &mut Simulator<u32, &'static str>,
            envelope: Envelope<u32, &'static str>,
        ) -> Result<(), Error> {
            self.seen
                .push((simulator.elapsed(), envelope.recipient, envelope.payload));
            if envelope.payload == "ping" {
                simulator.send(0, envelope.recipient, 0, "pong")?;
            }
            Ok(())
        }
    }

    fn simulator(seed: u64) -> Simulator<u32, &'static str> {
        let mut registry = Registry::default();
        Simulator::new(&mut registry, Config { seed })
    }

    #[test]
    fn test_timers_fire_in_time_order() {
        let mut simulator = simulator(0);
        simulator.schedule_after(Duration::from_secs(3), 1, "c");
        simulator.schedule_after(Duration::from_secs(1), 1, "a");
        simulator.schedule_after(Duration::from_secs(2), 1, "b");

        let mut recorder = Recorder::default();
        assert_eq!(simulator.run(&mut recorder, None).unwrap(), 3);
        let order: Vec<_> = recorder.seen.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(simulator.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_ties_preserve_insertion_order() {
        let mut simulator = simulator(0);
        for payload in ["first", "second", "third"] {
            simulator.schedule_after(Duration::from_secs(1), 1, payload);
        }

        let mut recorder = Recorder::default();
        simulator.run(&mut recorder, None).unwrap();
        let order: Vec<_> = recorder.seen.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[test_traced]
    fn test_messages_follow_link_latency() {
        let mut simulator = simulator(0);
        let link = Link::fixed(Duration::from_millis(5));
        simulator.link(0, 1, 0, link).unwrap();
        simulator.link(1, 0, 0, link).unwrap();
        simulator.send(0, 0, 1, "ping").unwrap();

        let mut recorder = Recorder::default();
        simulator.run(&mut recorder, None).unwrap();
        assert_eq!(
            recorder.seen,
            vec![
                (Duration::from_millis(5), 1, "ping"),
                (Duration::from_millis(10), 0, "pong"),
            ]
        );
    }

    #[test]
    fn test_missing_link() {
        let mut simulator = simulator(0);
        let result = simulator.send(1, 0, 1, "ping");
        assert!(matches!(result, Err(Error::MissingLink { channel: 1, .. })));
        assert_eq!(simulator.pending(), 0);
    }

    #[test]
    fn test_linking_self() {
        let mut simulator = simulator(0);
        let link = Link::fixed(Duration::from_millis(5));
        assert!(matches!(
            simulator.link(3, 3, 0, link),
            Err(Error::LinkingSelf)
        ));
    }

    #[test]
    fn test_deadline_stops_run() {
        let mut simulator = simulator(0);
        simulator.schedule_after(Duration::from_secs(1), 1, "early");
        simulator.schedule_after(Duration::from_secs(10), 1, "late");

        let mut recorder = Recorder::default();
        let deadline = UNIX_EPOCH + Duration::from_secs(5);
        assert_eq!(simulator.run(&mut recorder, Some(deadline)).unwrap(), 1);
        assert_eq!(simulator.current(), deadline);
        assert_eq!(simulator.pending(), 1);

        // Scheduling in the past delivers immediately
        simulator.schedule(UNIX_EPOCH, 1, "now");
        simulator.run(&mut recorder, Some(deadline)).unwrap();
        assert_eq!(recorder.seen.last(), Some(&(Duration::from_secs(5), 1, "now")));
    }

    #[test]
    fn test_same_seed_same_delays() {
        let run = |seed| {
            let mut simulator = simulator(seed);
            let link = Link {
                latency: Duration::from_millis(10),
                jitter: Duration::from_millis(3),
            };
            simulator.link(0, 1, 0, link).unwrap();
            (0..100)
                .map(|_| simulator.send(0, 0, 1, "x").unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }
}
