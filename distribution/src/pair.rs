//! Entangled pair accounts and the swap primitive.
//!
//! An [EprAccount] describes one pair: which distribution it belongs to and which two
//! nodes currently hold its halves. Accounts are never mutated in place. Swapping two
//! pairs retires both and produces a new account (with a new [PairId]) whose fidelity is
//! computed by a [Combiner].

use crate::{NodeId, PairId, SessionId, TransmitId};

/// One entangled pair, as tracked by the nodes holding its halves.
#[derive(Clone, Debug, PartialEq)]
pub struct EprAccount {
    pub id: PairId,
    pub transmit: TransmitId,
    pub session: SessionId,

    /// Source of the distribution this pair belongs to.
    pub src: NodeId,
    /// Destination of the distribution this pair belongs to.
    pub dst: NodeId,

    /// Holder of the half nearer to `src`.
    pub loc_a: NodeId,
    /// Holder of the half nearer to `dst`.
    pub loc_b: NodeId,

    pub fidelity: f64,
}

impl EprAccount {
    /// Account for the same pair once its far half has been transmitted to `holder`.
    pub fn delivered_to(&self, holder: NodeId) -> Self {
        Self {
            loc_b: holder,
            ..self.clone()
        }
    }

    /// Account for the pair obtained by swapping `first` (ending at the swapping node) with
    /// `second` (starting at the swapping node).
    ///
    /// The new pair belongs to the distribution of `first` and spans from `first.loc_a` to
    /// `far`.
    pub fn swapped(
        id: PairId,
        first: &EprAccount,
        second: &EprAccount,
        far: NodeId,
        combiner: &impl Combiner,
    ) -> Self {
        Self {
            id,
            transmit: first.transmit,
            session: first.session,
            src: first.src,
            dst: first.dst,
            loc_a: first.loc_a,
            loc_b: far,
            fidelity: combiner.combine(first.fidelity, second.fidelity),
        }
    }
}

/// Entanglement model used when generating and swapping pairs.
pub trait Combiner {
    /// Fidelity of a freshly generated pair.
    fn initial(&self) -> f64;

    /// Fidelity of the pair produced by swapping two pairs.
    fn combine(&self, first: f64, second: f64) -> f64;
}

/// Ideal Bell pairs: generation and swapping are noiseless.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bell;

impl Combiner for Bell {
    fn initial(&self) -> f64 {
        1.0
    }

    fn combine(&self, _: f64, _: f64) -> f64 {
        1.0
    }
}

/// Werner states generated at a fixed fidelity.
#[derive(Clone, Copy, Debug)]
pub struct Werner {
    pub fidelity: f64,
}

impl Default for Werner {
    fn default() -> Self {
        Self { fidelity: 0.99 }
    }
}

impl Werner {
    fn parameter(fidelity: f64) -> f64 {
        (4.0 * fidelity - 1.0) / 3.0
    }
}

impl Combiner for Werner {
    fn initial(&self) -> f64 {
        self.fidelity
    }

    fn combine(&self, first: f64, second: f64) -> f64 {
        let w = Self::parameter(first) * Self::parameter(second);
        (3.0 * w + 1.0) / 4.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: u64, loc_a: u32, loc_b: u32, fidelity: f64) -> EprAccount {
        EprAccount {
            id: PairId(id),
            transmit: TransmitId(7),
            session: SessionId(1),
            src: NodeId(1),
            dst: NodeId(5),
            loc_a: NodeId(loc_a),
            loc_b: NodeId(loc_b),
            fidelity,
        }
    }

    #[test]
    fn test_swap_spans_outer_nodes() {
        let first = account(1, 1, 2, 1.0);
        let second = account(2, 2, 3, 1.0);
        let swapped = EprAccount::swapped(PairId(3), &first, &second, NodeId(3), &Bell);
        assert_eq!(swapped.id, PairId(3));
        assert_eq!(swapped.transmit, TransmitId(7));
        assert_eq!((swapped.loc_a, swapped.loc_b), (NodeId(1), NodeId(3)));
        assert_eq!(swapped.fidelity, 1.0);
    }

    #[test]
    fn test_delivered_keeps_identity() {
        let generated = account(1, 2, 2, 0.9);
        let delivered = generated.delivered_to(NodeId(3));
        assert_eq!(delivered.id, generated.id);
        assert_eq!((delivered.loc_a, delivered.loc_b), (NodeId(2), NodeId(3)));
    }

    #[test]
    fn test_werner_swap_degrades() {
        let werner = Werner { fidelity: 0.97 };
        let once = werner.combine(werner.initial(), werner.initial());
        assert!(once < werner.initial());

        // Werner parameters multiply: w = w1 * w2
        let w = Werner::parameter(0.97);
        assert!((Werner::parameter(once) - w * w).abs() < 1e-12);

        // Perfect pairs stay perfect
        assert!((werner.combine(1.0, 1.0) - 1.0).abs() < 1e-12);
    }
}
