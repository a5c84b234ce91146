//! Established virtual links and the distributions waiting to consume them.
//!
//! Each established link instance is stored once, under a [LinkHandle] that is never
//! reused, and referenced from the availability queue of both endpoints. [Pool::claim] pairs a
//! waiting distribution with a link connecting it to its next hop and removes the handle
//! from both endpoints before handing the link out. A link can therefore be handed out at
//! most once, whichever endpoint claims it first.

use crate::{EprAccount, NodeId, SessionId, TransmitId};
use std::collections::{BTreeMap, VecDeque};

/// Reference to a link instance stored in a [Pool].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkHandle(u64);

/// One established virtual link: a pair whose halves sit at two non-adjacent nodes.
#[derive(Clone, Debug, PartialEq)]
pub struct VirtualLink {
    /// Maintenance distribution that established the link.
    pub transmit: TransmitId,
    pub pair: EprAccount,
    pub a: NodeId,
    pub b: NodeId,
}

impl VirtualLink {
    /// The opposite endpoint, if `node` is one of the endpoints.
    pub fn peer(&self, node: NodeId) -> Option<NodeId> {
        if node == self.a {
            Some(self.b)
        } else if node == self.b {
            Some(self.a)
        } else {
            None
        }
    }

    fn connects(&self, x: NodeId, y: NodeId) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

/// A distribution parked at a link endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Waiter {
    pub transmit: TransmitId,
    pub session: SessionId,
    /// Opposite endpoint of the link the distribution needs.
    pub next_hop: NodeId,
    /// Global enqueue order (lower waited longer).
    pub ticket: u64,
}

#[derive(Debug, Default)]
struct Endpoint {
    available: VecDeque<LinkHandle>,
    waiting: VecDeque<Waiter>,
}

/// Result of [Pool::claim].
#[derive(Debug)]
pub enum Claim {
    /// The waiter now exclusively owns the link.
    Ready { waiter: Waiter, link: VirtualLink },
    /// The endpoints disagreed about the link. The link (if it still existed) has been
    /// removed from the pool and the waiter is left in place.
    Violation {
        handle: LinkHandle,
        link: Option<VirtualLink>,
    },
}

/// Shared store of established links and waiting distributions.
#[derive(Debug, Default)]
pub struct Pool {
    links: BTreeMap<LinkHandle, VirtualLink>,
    endpoints: BTreeMap<NodeId, Endpoint>,
    handles: u64,
    tickets: u64,
}

impl Pool {
    /// Make a link available at both of its endpoints.
    pub fn publish(&mut self, link: VirtualLink) -> LinkHandle {
        let handle = LinkHandle(self.handles);
        self.handles += 1;
        let (a, b) = (link.a, link.b);
        self.links.insert(handle, link);
        self.endpoints
            .entry(a)
            .or_default()
            .available
            .push_back(handle);
        self.endpoints
            .entry(b)
            .or_default()
            .available
            .push_back(handle);
        handle
    }

    /// Park a distribution at `node` until a link to `next_hop` is available.
    pub fn wait(
        &mut self,
        node: NodeId,
        transmit: TransmitId,
        session: SessionId,
        next_hop: NodeId,
    ) -> Waiter {
        let waiter = Waiter {
            transmit,
            session,
            next_hop,
            ticket: self.tickets,
        };
        self.tickets += 1;
        self.endpoints
            .entry(node)
            .or_default()
            .waiting
            .push_back(waiter);
        waiter
    }

    /// Remove a parked distribution, if present.
    pub fn withdraw(&mut self, node: NodeId, transmit: TransmitId) -> Option<Waiter> {
        let endpoint = self.endpoints.get_mut(&node)?;
        let index = endpoint
            .waiting
            .iter()
            .position(|w| w.transmit == transmit)?;
        endpoint.waiting.remove(index)
    }

    /// Number of links available at `node` (to any peer).
    pub fn available(&self, node: NodeId) -> usize {
        self.endpoints.get(&node).map_or(0, |e| e.available.len())
    }

    /// Number of distributions waiting at `node`.
    pub fn waiting(&self, node: NodeId) -> usize {
        self.endpoints.get(&node).map_or(0, |e| e.waiting.len())
    }

    /// Whether any distribution of `session` is waiting anywhere.
    pub fn is_session_waiting(&self, session: SessionId) -> bool {
        self.endpoints
            .values()
            .any(|e| e.waiting.iter().any(|w| w.session == session))
    }

    /// Earliest waiter at `node` that needs a link to `peer`.
    pub fn first_waiter(&self, node: NodeId, peer: NodeId) -> Option<&Waiter> {
        self.endpoints
            .get(&node)?
            .waiting
            .iter()
            .find(|w| w.next_hop == peer)
    }

    /// Iterate over the links that are still available.
    pub fn links(&self) -> impl Iterator<Item = &VirtualLink> {
        self.links.values()
    }

    /// Hand the earliest satisfiable waiter at `node` a link to its next hop.
    ///
    /// Returns `None` if no waiter at `node` has a matching link available.
    pub fn claim(&mut self, node: NodeId) -> Option<Claim> {
        let endpoint = self.endpoints.get(&node)?;
        let (waiter_index, available_index, handle) =
            endpoint
                .waiting
                .iter()
                .enumerate()
                .find_map(|(waiter_index, waiter)| {
                    endpoint
                        .available
                        .iter()
                        .enumerate()
                        .find(|(_, handle)| {
                            self.links
                                .get(*handle)
                                .map_or(true, |link| link.connects(node, waiter.next_hop))
                        })
                        .map(|(available_index, &handle)| (waiter_index, available_index, handle))
                })?;

        // Detach from this endpoint
        let endpoint = self.endpoints.get_mut(&node)?;
        endpoint.available.remove(available_index);
        let Some(link) = self.links.remove(&handle) else {
            return Some(Claim::Violation { handle, link: None });
        };

        // Detach from the opposite endpoint
        let detached = link.peer(node).and_then(|peer| {
            let queue = &mut self.endpoints.get_mut(&peer)?.available;
            let index = queue.iter().position(|h| *h == handle)?;
            queue.remove(index)
        });
        if detached.is_none() {
            return Some(Claim::Violation {
                handle,
                link: Some(link),
            });
        }

        let endpoint = self.endpoints.get_mut(&node)?;
        let waiter = endpoint.waiting.remove(waiter_index)?;
        Some(Claim::Ready { waiter, link })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PairId;

    fn link(transmit: u64, a: u32, b: u32) -> VirtualLink {
        VirtualLink {
            transmit: TransmitId(transmit),
            pair: EprAccount {
                id: PairId(transmit),
                transmit: TransmitId(transmit),
                session: SessionId(0),
                src: NodeId(a),
                dst: NodeId(b),
                loc_a: NodeId(a),
                loc_b: NodeId(b),
                fidelity: 1.0,
            },
            a: NodeId(a),
            b: NodeId(b),
        }
    }

    #[test]
    fn test_claim_removes_from_both_endpoints() {
        let mut pool = Pool::default();
        pool.publish(link(1, 2, 4));
        assert_eq!(pool.available(NodeId(2)), 1);
        assert_eq!(pool.available(NodeId(4)), 1);

        // Nothing waiting yet
        assert!(pool.claim(NodeId(2)).is_none());

        pool.wait(NodeId(2), TransmitId(10), SessionId(1), NodeId(4));
        let Some(Claim::Ready { waiter, link }) = pool.claim(NodeId(2)) else {
            panic!("expected a claim");
        };
        assert_eq!(waiter.transmit, TransmitId(10));
        assert_eq!(link.peer(NodeId(2)), Some(NodeId(4)));
        assert_eq!(pool.available(NodeId(2)), 0);
        assert_eq!(pool.available(NodeId(4)), 0);
        assert_eq!(pool.waiting(NodeId(2)), 0);
        assert_eq!(pool.links().count(), 0);
    }

    #[test]
    fn test_competing_endpoints_claim_once() {
        let mut pool = Pool::default();
        pool.wait(NodeId(4), TransmitId(20), SessionId(2), NodeId(2));
        pool.wait(NodeId(2), TransmitId(10), SessionId(1), NodeId(4));
        pool.publish(link(1, 2, 4));

        // The earliest waiter is at node 4
        let here = pool.first_waiter(NodeId(2), NodeId(4)).unwrap().ticket;
        let there = pool.first_waiter(NodeId(4), NodeId(2)).unwrap().ticket;
        assert!(there < here);

        assert!(matches!(pool.claim(NodeId(4)), Some(Claim::Ready { .. })));
        assert!(pool.claim(NodeId(2)).is_none());
        assert_eq!(pool.waiting(NodeId(2)), 1);
        assert!(pool.is_session_waiting(SessionId(1)));
        assert!(!pool.is_session_waiting(SessionId(2)));
    }

    #[test]
    fn test_waiter_matches_peer() {
        let mut pool = Pool::default();
        pool.publish(link(1, 2, 6));
        pool.wait(NodeId(2), TransmitId(10), SessionId(1), NodeId(4));
        assert!(pool.claim(NodeId(2)).is_none());

        // A later waiter for the other peer is served first
        pool.wait(NodeId(2), TransmitId(11), SessionId(1), NodeId(6));
        let Some(Claim::Ready { waiter, .. }) = pool.claim(NodeId(2)) else {
            panic!("expected a claim");
        };
        assert_eq!(waiter.transmit, TransmitId(11));
        assert_eq!(pool.waiting(NodeId(2)), 1);
    }

    #[test]
    fn test_inconsistent_endpoints_abort() {
        let mut pool = Pool::default();
        let handle = pool.publish(link(1, 2, 4));
        pool.endpoints
            .get_mut(&NodeId(4))
            .unwrap()
            .available
            .clear();
        pool.wait(NodeId(2), TransmitId(10), SessionId(1), NodeId(4));

        let Some(Claim::Violation { handle: h, link }) = pool.claim(NodeId(2)) else {
            panic!("expected a violation");
        };
        assert_eq!(h, handle);
        assert!(link.is_some());

        // Waiter stays parked and the link is gone
        assert_eq!(pool.waiting(NodeId(2)), 1);
        assert_eq!(pool.available(NodeId(2)), 0);
        assert_eq!(pool.links().count(), 0);
    }

    #[test]
    fn test_claimed_links_are_dropped() {
        let mut pool = Pool::default();
        let mut handles = Vec::new();
        for i in 0..1000 {
            handles.push(pool.publish(link(i, 2, 4)));
            pool.wait(NodeId(2), TransmitId(10_000 + i), SessionId(1), NodeId(4));
            assert!(matches!(pool.claim(NodeId(2)), Some(Claim::Ready { .. })));
        }
        assert!(pool.links.is_empty());
        assert_eq!(pool.available(NodeId(4)), 0);

        // Handles are never reused
        handles.dedup();
        assert_eq!(handles.len(), 1000);
    }

    #[test]
    fn test_withdraw() {
        let mut pool = Pool::default();
        pool.wait(NodeId(2), TransmitId(10), SessionId(1), NodeId(4));
        assert!(pool.withdraw(NodeId(2), TransmitId(11)).is_none());
        assert!(pool.withdraw(NodeId(2), TransmitId(10)).is_some());
        assert_eq!(pool.waiting(NodeId(2)), 0);
    }
}
