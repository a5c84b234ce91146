//! Bounded per-node storage for pair halves.

use crate::{EprAccount, Error, NodeId, PairId};
use std::collections::BTreeMap;

/// Capacity-limited store of pair halves, keyed by [PairId].
///
/// A full memory rejects writes without evicting anything.
#[derive(Debug)]
pub struct Memory {
    node: NodeId,
    capacity: usize,
    slots: BTreeMap<PairId, EprAccount>,
}

impl Memory {
    pub fn new(node: NodeId, capacity: usize) -> Self {
        Self {
            node,
            capacity,
            slots: BTreeMap::new(),
        }
    }

    /// Store a half.
    ///
    /// Writing a pair that is already stored replaces it without using more capacity.
    pub fn write(&mut self, account: EprAccount) -> Result<(), Error> {
        if !self.slots.contains_key(&account.id) && self.slots.len() >= self.capacity {
            return Err(Error::StorageFull { node: self.node });
        }
        self.slots.insert(account.id, account);
        Ok(())
    }

    /// Remove and return a half, if stored.
    pub fn read(&mut self, id: PairId) -> Option<EprAccount> {
        self.slots.remove(&id)
    }

    pub fn usage(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SessionId, TransmitId};

    fn account(id: u64) -> EprAccount {
        EprAccount {
            id: PairId(id),
            transmit: TransmitId(0),
            session: SessionId(0),
            src: NodeId(0),
            dst: NodeId(1),
            loc_a: NodeId(0),
            loc_b: NodeId(0),
            fidelity: 1.0,
        }
    }

    #[test]
    fn test_write_until_full() {
        let mut memory = Memory::new(NodeId(0), 2);
        memory.write(account(1)).unwrap();
        memory.write(account(2)).unwrap();
        assert!(matches!(
            memory.write(account(3)),
            Err(Error::StorageFull { node: NodeId(0) })
        ));

        // Failed write does not mutate
        assert_eq!(memory.usage(), 2);
        assert!(memory.read(PairId(3)).is_none());

        // Rewriting a stored pair does not need room
        memory.write(account(2).delivered_to(NodeId(1))).unwrap();
        assert_eq!(memory.usage(), 2);
        assert_eq!(memory.read(PairId(2)).unwrap().loc_b, NodeId(1));
    }

    #[test]
    fn test_read_removes() {
        let mut memory = Memory::new(NodeId(0), 1);
        memory.write(account(1)).unwrap();
        assert_eq!(memory.read(PairId(1)).map(|a| a.id), Some(PairId(1)));
        assert!(memory.read(PairId(1)).is_none());
        assert_eq!(memory.usage(), 0);
        memory.write(account(2)).unwrap();
    }

    #[test]
    fn test_zero_capacity() {
        let mut memory = Memory::new(NodeId(4), 0);
        assert!(memory.write(account(1)).is_err());
        assert_eq!(memory.usage(), 0);
    }
}
