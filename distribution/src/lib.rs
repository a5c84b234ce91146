//! Distribute entangled pairs across repeater networks with shared virtual links.
//!
//! Every node of a [Topology] runs two instances of the same distribution protocol,
//! distinguished by [Role]:
//!
//! * [Role::Distro] carries user sessions from a source to a destination, hop by hop.
//!   Each hop stores a fresh pair, and every intermediate node swaps the pair it
//!   received with the one it forwards so that, when the pair reaches the destination,
//!   the source and destination share one end-to-end pair.
//! * [Role::Maint] runs the same protocol over physical hops only to establish virtual
//!   links: long-lived pairs between non-adjacent nodes that distro sessions can
//!   consume as a shortcut, skipping every physical hop the link spans.
//!
//! Established virtual links sit in a [pool::Pool] shared by both endpoints. A
//! distribution whose next hop is a virtual link waits at the endpoint until a link
//! instance is available, then claims it. Claiming removes the instance from both
//! endpoints in one step, so no instance can ever be consumed twice.
//!
//! The protocol is event driven: the [engine::Network] implements
//! [qunet_simulator::Handler] and reacts to timers, pair arrivals and control messages
//! delivered by a [qunet_simulator::Simulator].
//!
//! # Status
//!
//! `qunet-distribution` is **ALPHA** software. Developers should expect breaking changes
//! and occasional instability.

use prometheus_client::encoding::EncodeLabelValue;
use std::fmt;
use thiserror::Error;

pub mod engine;
pub mod ledger;
pub mod memory;
pub mod pair;
pub mod pool;
pub mod routing;
pub mod topology;

pub use engine::{Completion, Config, Network, Request, Stats};
pub use pair::{Bell, Combiner, EprAccount, Werner};
pub use topology::Topology;

/// Errors that can occur when setting up or running a [Network].
#[derive(Debug, Error)]
pub enum Error {
    #[error("memory of {node} is full")]
    StorageFull { node: NodeId },
    #[error("no route from {src} to {dst}")]
    RouteUnavailable { src: NodeId, dst: NodeId },
    #[error("virtual link {link} claimed twice")]
    VlinkRaceViolation { link: TransmitId },
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("simulator error: {0}")]
    Simulator(#[from] qunet_simulator::Error),
}

/// Identifier of a repeater node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

identifier!(
    /// Identifier of one entangled pair.
    PairId,
    "p"
);
identifier!(
    /// Identifier of one in-flight distribution (shared by every node it touches).
    TransmitId,
    "t"
);
identifier!(
    /// Identifier of a session (a user request or a virtual link to maintain).
    SessionId,
    "s"
);

/// Which of the two protocol instances running on every node an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum Role {
    /// End-to-end distribution for user sessions (may use virtual links).
    Distro,
    /// Establishment of virtual links (physical hops only).
    Maint,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Distro => write!(f, "distro"),
            Role::Maint => write!(f, "maint"),
        }
    }
}
