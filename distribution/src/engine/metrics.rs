use super::Stats;
use crate::{NodeId, Role};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{sync::atomic::AtomicU64, time::Duration};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Instance {
    pub role: Role,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Holder {
    pub node: u32,
}

impl From<NodeId> for Holder {
    fn from(node: NodeId) -> Self {
        Self { node: node.0 }
    }
}

#[derive(Default)]
pub struct Metrics {
    pub sent: Family<Instance, Counter>,
    pub succeeded: Family<Instance, Counter>,
    pub revoked: Family<Instance, Counter>,
    pub generated: Family<Instance, Counter>,
    pub swaps: Family<Instance, Counter>,
    pub latency: Family<Instance, Counter<f64, AtomicU64>>,
    pub vlinks_established: Counter,
    pub vlinks_consumed: Counter,
    pub race_violations: Counter,
    pub occupancy: Family<Holder, Gauge>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "sent",
            "Distributions started by their source",
            metrics.sent.clone(),
        );
        registry.register(
            "succeeded",
            "Distributions completed end to end",
            metrics.succeeded.clone(),
        );
        registry.register(
            "revoked",
            "Distributions revoked before completing",
            metrics.revoked.clone(),
        );
        registry.register(
            "generated",
            "Pairs generated for physical hops",
            metrics.generated.clone(),
        );
        registry.register(
            "swaps",
            "Entanglement swaps performed",
            metrics.swaps.clone(),
        );
        registry.register(
            "latency",
            "Total seconds between start and completion of distributions",
            metrics.latency.clone(),
        );
        registry.register(
            "vlinks_established",
            "Virtual links established",
            metrics.vlinks_established.clone(),
        );
        registry.register(
            "vlinks_consumed",
            "Virtual links consumed by distributions",
            metrics.vlinks_consumed.clone(),
        );
        registry.register(
            "race_violations",
            "Virtual link claims aborted because endpoints disagreed",
            metrics.race_violations.clone(),
        );
        registry.register(
            "occupancy",
            "Pair halves stored per node",
            metrics.occupancy.clone(),
        );
        metrics
    }

    /// Snapshot of the counters of `role`.
    pub fn stats(&self, role: Role) -> Stats {
        let instance = Instance { role };
        Stats {
            sent: count(&self.sent, &instance),
            succeeded: count(&self.succeeded, &instance),
            revoked: count(&self.revoked, &instance),
            generated: count(&self.generated, &instance),
            swaps: count(&self.swaps, &instance),
            latency: Duration::from_secs_f64(self.latency.get_or_create(&instance).get()),
        }
    }
}

fn count(family: &Family<Instance, Counter>, instance: &Instance) -> u64 {
    family.get_or_create(instance).get()
}
