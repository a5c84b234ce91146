use crate::{EprAccount, NodeId, Role, SessionId, TransmitId};
use qunet_simulator::Channel;

/// Channel carrying pair halves between physically adjacent nodes.
pub const QUANTUM: Channel = 0;

/// Channel carrying control messages between any two nodes.
pub const CLASSICAL: Channel = 1;

/// Everything a node can be handed by the simulator.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Periodic timer of a session, delivered to its source.
    Tick { session: SessionId },
    /// Far half of a pair, sent over a quantum channel.
    Qubit { role: Role, pair: EprAccount },
    /// Far half of a pair produced by consuming a virtual link at `from`.
    ///
    /// Delivered without delay: the half was already at the receiver.
    Teleported { from: NodeId, pair: EprAccount },
    /// Control message, sent over the classical channel.
    Control(Control),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control {
    pub command: Command,
    pub transmit: TransmitId,
    pub role: Role,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Receiver of a half asks its backward neighbor to swap.
    Swap,
    /// Backward neighbor finished its swap: continue forwarding.
    Next,
    /// Destination tells the source the distribution completed.
    Success,
    /// A hop failed: release everything held for the distribution.
    Revoke,
    /// A virtual link was established: retry waiting distributions.
    Vlink,
}

impl Event {
    pub fn control(command: Command, transmit: TransmitId, role: Role) -> Self {
        Self::Control(Control {
            command,
            transmit,
            role,
        })
    }
}
