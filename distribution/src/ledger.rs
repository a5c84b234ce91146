//! Per-node bookkeeping of in-flight distributions.

use crate::{EprAccount, NodeId, Role, SessionId, TransmitId};
use std::{
    collections::{BTreeMap, VecDeque},
    time::SystemTime,
};

/// Number of revoked distributions a node remembers.
const MAX_TOMBSTONES: usize = 1024;

/// A node's view of one distribution.
///
/// `alice` is the half received from the backward neighbor (or, after a swap, the half
/// shared with the source). `charlie` is the half this node forwards (at the source, the
/// half it keeps until the distribution completes).
#[derive(Clone, Debug)]
pub struct Transmit {
    pub id: TransmitId,
    pub session: SessionId,
    pub role: Role,
    pub src: NodeId,
    pub dst: NodeId,
    pub alice: Option<EprAccount>,
    pub charlie: Option<EprAccount>,
    pub start: SystemTime,
    pub revoked: bool,
}

impl Transmit {
    pub fn new(
        id: TransmitId,
        session: SessionId,
        role: Role,
        src: NodeId,
        dst: NodeId,
        start: SystemTime,
    ) -> Self {
        Self {
            id,
            session,
            role,
            src,
            dst,
            alice: None,
            charlie: None,
            start,
            revoked: false,
        }
    }

    /// Drop both halves, returning the ones that were held.
    pub fn release(&mut self) -> Vec<EprAccount> {
        self.alice.take().into_iter().chain(self.charlie.take()).collect()
    }
}

/// Distributions known to one node.
///
/// Revoked distributions stay behind as tombstones so late messages for them are ignored
/// rather than mistaken for new work. Only the most recent tombstones are kept.
#[derive(Debug, Default)]
pub struct Ledger {
    transmits: BTreeMap<TransmitId, Transmit>,
    tombstones: VecDeque<TransmitId>,
}

impl Ledger {
    pub fn insert(&mut self, transmit: Transmit) {
        let (id, revoked) = (transmit.id, transmit.revoked);
        self.transmits.insert(id, transmit);
        if revoked {
            self.bury(id);
        }
    }

    /// Get a distribution that has not been revoked.
    pub fn live(&self, id: TransmitId) -> Option<&Transmit> {
        self.transmits.get(&id).filter(|t| !t.revoked)
    }

    pub fn live_mut(&mut self, id: TransmitId) -> Option<&mut Transmit> {
        self.transmits.get_mut(&id).filter(|t| !t.revoked)
    }

    /// Get a distribution, including a revoked one.
    pub fn get(&self, id: TransmitId) -> Option<&Transmit> {
        self.transmits.get(&id)
    }

    /// Forget a live distribution.
    pub fn remove(&mut self, id: TransmitId) -> Option<Transmit> {
        if self.live(id).is_none() {
            return None;
        }
        self.transmits.remove(&id)
    }

    /// Mark a live distribution revoked, returning the halves it held.
    ///
    /// Returns `None` if the distribution is unknown or already revoked.
    pub fn revoke(&mut self, id: TransmitId) -> Option<Vec<EprAccount>> {
        let transmit = self.live_mut(id)?;
        transmit.revoked = true;
        let released = transmit.release();
        self.bury(id);
        Some(released)
    }

    /// Number of distributions that have not been revoked.
    pub fn live_count(&self) -> usize {
        self.transmits.values().filter(|t| !t.revoked).count()
    }

    fn bury(&mut self, id: TransmitId) {
        self.tombstones.push_back(id);
        while self.tombstones.len() > MAX_TOMBSTONES {
            let Some(oldest) = self.tombstones.pop_front() else {
                break;
            };
            if self.transmits.get(&oldest).is_some_and(|t| t.revoked) {
                self.transmits.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PairId;

    fn transmit(id: u64) -> Transmit {
        Transmit::new(
            TransmitId(id),
            SessionId(0),
            Role::Distro,
            NodeId(1),
            NodeId(3),
            SystemTime::UNIX_EPOCH,
        )
    }

    fn account(id: u64) -> EprAccount {
        EprAccount {
            id: PairId(id),
            transmit: TransmitId(1),
            session: SessionId(0),
            src: NodeId(1),
            dst: NodeId(3),
            loc_a: NodeId(1),
            loc_b: NodeId(2),
            fidelity: 1.0,
        }
    }

    #[test]
    fn test_revoke_leaves_tombstone() {
        let mut ledger = Ledger::default();
        let mut record = transmit(1);
        record.alice = Some(account(10));
        record.charlie = Some(account(11));
        ledger.insert(record);
        assert_eq!(ledger.live_count(), 1);

        let released = ledger.revoke(TransmitId(1)).unwrap();
        let ids: Vec<_> = released.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![PairId(10), PairId(11)]);

        // Tombstone is visible but not live
        assert!(ledger.live(TransmitId(1)).is_none());
        assert!(ledger.get(TransmitId(1)).unwrap().revoked);
        assert_eq!(ledger.live_count(), 0);

        // Revoking twice and removing a tombstone are no-ops
        assert!(ledger.revoke(TransmitId(1)).is_none());
        assert!(ledger.remove(TransmitId(1)).is_none());
    }

    #[test]
    fn test_oldest_tombstones_dropped() {
        let mut ledger = Ledger::default();
        let total = MAX_TOMBSTONES as u64 + 10;
        for id in 0..total {
            ledger.insert(transmit(id));
            ledger.revoke(TransmitId(id)).unwrap();
        }

        // A live distribution is never dropped
        ledger.insert(transmit(total));
        assert_eq!(ledger.transmits.len(), MAX_TOMBSTONES + 1);
        assert!(ledger.get(TransmitId(0)).is_none());
        assert!(ledger.get(TransmitId(9)).is_none());
        assert!(ledger.get(TransmitId(10)).unwrap().revoked);
        assert!(ledger.live(TransmitId(total)).is_some());

        // Tombstones inserted directly count as well
        let mut late = transmit(total + 1);
        late.revoked = true;
        ledger.insert(late);
        assert!(ledger.get(TransmitId(10)).is_none());
        assert!(ledger.get(TransmitId(total + 1)).unwrap().revoked);
    }

    #[test]
    fn test_one_record_per_id() {
        let mut ledger = Ledger::default();
        ledger.insert(transmit(1));
        let mut replacement = transmit(1);
        replacement.alice = Some(account(10));
        ledger.insert(replacement);
        assert_eq!(ledger.live_count(), 1);
        assert!(ledger.live(TransmitId(1)).unwrap().alice.is_some());
        assert!(ledger.remove(TransmitId(1)).is_some());
        assert_eq!(ledger.live_count(), 0);
    }
}
