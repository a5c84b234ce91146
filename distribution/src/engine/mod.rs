//! Protocol handlers for every node of a network.
//!
//! A [Network] owns the state of all nodes and is driven by a [Simulator]: every timer,
//! pair arrival and control message is one call to [Handler::handle]. Each call runs to
//! completion before the next event is delivered, so state shared between nodes (the
//! virtual link pool) is never observed mid-update.
//!
//! # Hop-by-hop distribution
//!
//! Starting at the source, every hop of a distribution follows the same exchange:
//!
//! 1. The sender transmits the far half of its forward pair ("charlie") to the next hop.
//! 2. The receiver stores it as "alice", generates its own forward pair (unless it is the
//!    destination), and asks the sender to `swap`.
//! 3. The sender (unless it is the source) swaps alice with charlie, producing a pair
//!    shared by the source and the receiver, and tells the receiver to continue (`next`).
//! 4. The receiver repeats from step 1, or, at the destination, reports `success` to the
//!    source.
//!
//! If a node cannot store a pair, it revokes the distribution: every node still holding
//! a half for it releases the half and the source records the failure.
//!
//! # Virtual links
//!
//! Maintenance sessions run the same exchange between two non-adjacent nodes (over
//! physical hops only). On success the pair is published to the [Pool] as a virtual link
//! instead of being released. A distro distribution whose next hop is a virtual link waits
//! at the link endpoint, claims an instance once one is available, swaps its pair with the
//! link and hands the result to the far endpoint without any transmission delay.

mod metrics;
pub mod wire;

use crate::{
    ledger::{Ledger, Transmit},
    memory::Memory,
    pool::{Claim, Pool, VirtualLink, Waiter},
    routing::{Route, Router},
    Combiner, EprAccount, Error, NodeId, PairId, Role, SessionId, Topology, TransmitId,
};
use metrics::{Holder, Instance, Metrics};
use prometheus_client::registry::Registry;
use qunet_simulator::{Envelope, Handler, Link, Simulator};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wire::{Command, Control, Event, CLASSICAL, QUANTUM};

/// Configuration for a [Network].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of pair halves each node can store.
    pub memory_capacity: usize,

    /// Per-node overrides of `memory_capacity`.
    pub capacities: BTreeMap<NodeId, usize>,

    /// Link used in both directions of every quantum channel.
    pub quantum: Link,

    /// Link used between every two nodes for control messages.
    pub classical: Link,
}

impl Default for Config {
    fn default() -> Self {
        let link = Link {
            latency: Duration::from_millis(1),
            jitter: Duration::from_micros(100),
        };
        Self {
            memory_capacity: 500,
            capacities: BTreeMap::new(),
            quantum: link,
            classical: link,
        }
    }
}

/// A request to distribute pairs between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub src: NodeId,
    pub dst: NodeId,

    /// Time between two distributions started by the session.
    pub interval: Duration,

    /// Number of distributions to start (`None` to run until the simulation stops).
    pub rounds: Option<u32>,
}

impl Request {
    /// Start a single distribution.
    pub fn once(src: NodeId, dst: NodeId) -> Self {
        Self {
            src,
            dst,
            interval: Duration::ZERO,
            rounds: Some(1),
        }
    }

    /// Start a distribution every `interval`.
    pub fn periodic(src: NodeId, dst: NodeId, interval: Duration) -> Self {
        Self {
            src,
            dst,
            interval,
            rounds: None,
        }
    }

    /// Stop after `rounds` distributions.
    pub fn rounds(mut self, rounds: u32) -> Self {
        self.rounds = Some(rounds);
        self
    }
}

/// A distribution that reached its destination.
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    pub transmit: TransmitId,
    pub session: SessionId,
    pub src: NodeId,
    pub dst: NodeId,

    /// Pair held by the source when the distribution completed.
    pub pair: EprAccount,

    /// Pair the destination held when it reported success.
    pub delivered: Option<EprAccount>,

    /// Time between the start and the completion of the distribution.
    pub latency: Duration,
}

/// Counters of one [Role], as exported to metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    pub sent: u64,
    pub succeeded: u64,
    pub revoked: u64,
    pub generated: u64,
    pub swaps: u64,

    /// Sum of the latencies of succeeded distributions.
    pub latency: Duration,
}

impl Stats {
    pub fn mean_latency(&self) -> Option<Duration> {
        let succeeded = u32::try_from(self.succeeded).ok().filter(|s| *s > 0)?;
        Some(self.latency / succeeded)
    }
}

struct Session {
    role: Role,
    request: Request,
    started: u32,

    /// Ticks are suspended until the waiting distribution is served.
    parked: bool,
}

struct Node {
    memory: Memory,
    ledger: Ledger,
    vlinks: BTreeSet<NodeId>,
}

enum Slot {
    Alice,
    Charlie,
}

/// State of every node in a network of repeaters.
pub struct Network<C: Combiner> {
    combiner: C,
    nodes: BTreeMap<NodeId, Node>,
    router: Router,
    pool: Pool,
    sessions: BTreeMap<SessionId, Session>,

    delivered: BTreeMap<TransmitId, EprAccount>,
    completions: Vec<Completion>,

    next_pair: u64,
    next_transmit: u64,
    next_session: u64,

    metrics: Metrics,
}

impl<C: Combiner> Network<C> {
    /// Create a network over `topology` and register its links with `simulator`.
    ///
    /// Quantum links are registered for every channel of the topology, classical links
    /// between every two nodes.
    pub fn new(
        registry: &mut Registry,
        simulator: &mut Simulator<NodeId, Event>,
        cfg: Config,
        topology: &Topology,
        combiner: C,
    ) -> Result<Self, Error> {
        if let Some(node) = cfg.capacities.keys().find(|n| !topology.contains(**n)) {
            return Err(Error::UnknownNode(*node));
        }
        let mut nodes = BTreeMap::new();
        for &node in topology.nodes() {
            let capacity = cfg
                .capacities
                .get(&node)
                .copied()
                .unwrap_or(cfg.memory_capacity);
            nodes.insert(
                node,
                Node {
                    memory: Memory::new(node, capacity),
                    ledger: Ledger::default(),
                    vlinks: BTreeSet::new(),
                },
            );
        }

        // Register links
        for &(a, b) in topology.channels() {
            for node in [a, b] {
                if !topology.contains(node) {
                    return Err(Error::UnknownNode(node));
                }
            }
            simulator.link(a, b, QUANTUM, cfg.quantum)?;
            simulator.link(b, a, QUANTUM, cfg.quantum)?;
        }
        for &a in topology.nodes() {
            for &b in topology.nodes() {
                if a != b {
                    simulator.link(a, b, CLASSICAL, cfg.classical)?;
                }
            }
        }

        let metrics = Metrics::init(registry.sub_registry_with_prefix("distribution"));
        Ok(Self {
            combiner,
            nodes,
            router: Router::new(topology.nodes(), topology.channels()),
            pool: Pool::default(),
            sessions: BTreeMap::new(),
            delivered: BTreeMap::new(),
            completions: Vec::new(),
            next_pair: 0,
            next_transmit: 0,
            next_session: 0,
            metrics,
        })
    }

    /// Start a user session.
    ///
    /// The first distribution starts at the current simulated time.
    pub fn add_session(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        request: Request,
    ) -> Result<SessionId, Error> {
        self.validate(&request)?;
        self.route(request.src, request.dst)?;
        let session = self.start(simulator, Role::Distro, request);
        info!(
            %session,
            src = %request.src,
            dst = %request.dst,
            "added session"
        );
        Ok(session)
    }

    /// Maintain a virtual link between two non-adjacent nodes.
    ///
    /// Routes use the link as soon as it is added, so distributions may wait at its
    /// endpoints before the first instance is established.
    pub fn add_vlink(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        request: Request,
    ) -> Result<SessionId, Error> {
        self.validate(&request)?;
        if self.router.is_adjacent(request.src, request.dst) {
            return Err(Error::InvalidRequest("virtual link between adjacent nodes"));
        }
        if self.router.physical(request.src, request.dst).is_none() {
            return Err(Error::RouteUnavailable {
                src: request.src,
                dst: request.dst,
            });
        }
        self.node_mut(request.src)?.vlinks.insert(request.dst);
        self.node_mut(request.dst)?.vlinks.insert(request.src);
        let vlinks: Vec<_> = self
            .nodes
            .iter()
            .flat_map(|(&a, node)| node.vlinks.iter().map(move |&b| (a, b)))
            .filter(|(a, b)| a < b)
            .collect();
        self.router.rebuild(vlinks);

        let session = self.start(simulator, Role::Maint, request);
        info!(
            %session,
            a = %request.src,
            b = %request.dst,
            "added virtual link"
        );
        Ok(session)
    }

    /// Counters for distributions of `role`.
    pub fn stats(&self, role: Role) -> Stats {
        self.metrics.stats(role)
    }

    /// Distributions completed so far, in completion order.
    pub fn completions(&self) -> &[Completion] {
        &self.completions
    }

    pub fn vlinks_established(&self) -> u64 {
        self.metrics.vlinks_established.get()
    }

    pub fn vlinks_consumed(&self) -> u64 {
        self.metrics.vlinks_consumed.get()
    }

    pub fn race_violations(&self) -> u64 {
        self.metrics.race_violations.get()
    }

    /// Pair halves currently stored at `node`.
    pub fn occupancy(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(&node).map(|n| n.memory.usage())
    }

    /// Distributions at `node` that have not completed or been revoked.
    pub fn live_transmits(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(&node).map(|n| n.ledger.live_count())
    }

    /// A node's record of a distribution (including a revoked one).
    pub fn transmit(&self, node: NodeId, id: TransmitId) -> Option<&Transmit> {
        self.nodes.get(&node)?.ledger.get(id)
    }

    /// Virtual links terminating at `node`.
    pub fn vlinks(&self, node: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.nodes.get(&node).map(|n| &n.vlinks)
    }

    /// Established virtual links available at `node`.
    pub fn available(&self, node: NodeId) -> usize {
        self.pool.available(node)
    }

    /// Distributions waiting for a virtual link at `node`.
    pub fn waiting(&self, node: NodeId) -> usize {
        self.pool.waiting(node)
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    fn validate(&self, request: &Request) -> Result<(), Error> {
        for node in [request.src, request.dst] {
            if !self.nodes.contains_key(&node) {
                return Err(Error::UnknownNode(node));
            }
        }
        if request.src == request.dst {
            return Err(Error::InvalidRequest("source equals destination"));
        }
        if request.rounds == Some(0) {
            return Err(Error::InvalidRequest("no rounds"));
        }
        if request.interval.is_zero() && request.rounds != Some(1) {
            return Err(Error::InvalidRequest("repeated sessions need an interval"));
        }
        Ok(())
    }

    fn start(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        role: Role,
        request: Request,
    ) -> SessionId {
        let session = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            session,
            Session {
                role,
                request,
                started: 0,
                parked: false,
            },
        );
        simulator.schedule(simulator.current(), request.src, Event::Tick { session });
        session
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut Node, Error> {
        self.nodes.get_mut(&node).ok_or(Error::UnknownNode(node))
    }

    fn route(&self, src: NodeId, dst: NodeId) -> Result<Route, Error> {
        self.router
            .query(src, dst)
            .ok_or(Error::RouteUnavailable { src, dst })
    }

    /// The live record of the distribution a control message refers to.
    fn live(&self, node: NodeId, control: &Control) -> Result<Option<Transmit>, Error> {
        let transmit = self
            .nodes
            .get(&node)
            .ok_or(Error::UnknownNode(node))?
            .ledger
            .live(control.transmit)
            .filter(|t| t.role == control.role)
            .cloned();
        if transmit.is_none() {
            debug!(
                %node,
                transmit = %control.transmit,
                role = %control.role,
                command = ?control.command,
                "ignoring control for unknown distribution"
            );
        }
        Ok(transmit)
    }

    /// A fresh pair held entirely by `holder`.
    ///
    /// Only counted as generated once it is stored (see [Self::generated]).
    fn generate(&mut self, holder: NodeId, transmit: &Transmit) -> EprAccount {
        let id = PairId(self.next_pair);
        self.next_pair += 1;
        EprAccount {
            id,
            transmit: transmit.id,
            session: transmit.session,
            src: transmit.src,
            dst: transmit.dst,
            loc_a: holder,
            loc_b: holder,
            fidelity: self.combiner.initial(),
        }
    }

    fn generated(&self, role: Role) {
        self.metrics.generated.get_or_create(&Instance { role }).inc();
    }

    fn swapped(&mut self, first: &EprAccount, second: &EprAccount, far: NodeId) -> EprAccount {
        let id = PairId(self.next_pair);
        self.next_pair += 1;
        EprAccount::swapped(id, first, second, far, &self.combiner)
    }

    /// Replace the half `retired` held by `node` with its half of `pair`.
    fn install(&mut self, node: NodeId, slot: Slot, retired: PairId, pair: EprAccount) {
        let Some(state) = self.nodes.get_mut(&node) else {
            return;
        };
        let Some(transmit) = state.ledger.live_mut(pair.transmit) else {
            debug!(%node, transmit = %pair.transmit, "no distribution to install swapped pair");
            return;
        };
        state.memory.read(retired);
        let target = match slot {
            Slot::Alice => &mut transmit.alice,
            Slot::Charlie => &mut transmit.charlie,
        };
        match state.memory.write(pair.clone()) {
            Ok(()) => *target = Some(pair),
            Err(err) => {
                warn!(%node, transmit = %pair.transmit, ?err, "failed to install swapped pair");
                *target = None;
            }
        }
    }

    /// Release the halves `node` holds for a distribution and mark it revoked.
    ///
    /// Returns the revoked record, if the distribution was live.
    fn release(&mut self, node: NodeId, id: TransmitId) -> Result<Option<Transmit>, Error> {
        let state = self.node_mut(node)?;
        let Some(record) = state.ledger.live(id).cloned() else {
            return Ok(None);
        };
        for account in state.ledger.revoke(id).unwrap_or_default() {
            state.memory.read(account.id);
        }
        self.pool.withdraw(node, id);
        Ok(Some(record))
    }

    fn refresh_occupancy(&self) {
        for (&node, state) in &self.nodes {
            self.metrics
                .occupancy
                .get_or_create(&Holder::from(node))
                .set(state.memory.usage() as i64);
        }
    }

    fn tick(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        session: SessionId,
    ) -> Result<(), Error> {
        let Some(state) = self.sessions.get(&session) else {
            warn!(%node, %session, "tick for unknown session");
            return Ok(());
        };
        let (role, request) = (state.role, state.request);

        // Only one distribution of a session waits for a virtual link at a time
        let waiting = role == Role::Distro && self.pool.is_session_waiting(session);
        let Some(state) = self.sessions.get_mut(&session) else {
            return Ok(());
        };
        if waiting {
            debug!(%node, %session, "previous distribution still waiting");
            state.parked = true;
            return Ok(());
        }
        state.started += 1;
        if request.rounds.map_or(true, |rounds| state.started < rounds) {
            simulator.schedule_after(request.interval, node, Event::Tick { session });
        }

        let id = TransmitId(self.next_transmit);
        self.next_transmit += 1;
        let mut transmit = Transmit::new(
            id,
            session,
            role,
            request.src,
            request.dst,
            simulator.current(),
        );
        let pair = self.generate(node, &transmit);
        let state = self.node_mut(node)?;
        if let Err(err) = state.memory.write(pair.clone()) {
            debug!(%node, %session, %role, ?err, "failed to start distribution");
            return Ok(());
        }
        transmit.charlie = Some(pair);
        state.ledger.insert(transmit);
        self.generated(role);
        self.metrics.sent.get_or_create(&Instance { role }).inc();
        debug!(%node, %session, transmit = %id, %role, "started distribution");
        self.forward(simulator, node, id)
    }

    /// Move a distribution one hop closer to its destination.
    fn forward(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        id: TransmitId,
    ) -> Result<(), Error> {
        let Some(transmit) = self.node_mut(node)?.ledger.live(id).cloned() else {
            debug!(%node, transmit = %id, "nothing to forward");
            return Ok(());
        };
        let route = self.route(node, transmit.dst)?;
        if transmit.role == Role::Distro && route.uses_vlink {
            let peer = route.next_virtual;
            let waiter = self.pool.wait(node, id, transmit.session, peer);
            debug!(
                %node,
                %peer,
                transmit = %id,
                ticket = waiter.ticket,
                "waiting for virtual link"
            );
            return self.consume(simulator, node);
        }

        let next = route.next_hop(transmit.role);
        let charlie = match transmit.charlie.clone() {
            Some(charlie) => charlie,
            None => {
                // The route changed since the half arrived
                let pair = self.generate(node, &transmit);
                if let Err(err) = self.node_mut(node)?.memory.write(pair.clone()) {
                    warn!(%node, transmit = %id, ?err, "failed to store forward pair");
                    return self.abandon(simulator, node, id);
                }
                self.generated(transmit.role);
                pair
            }
        };
        let sent = charlie.delivered_to(next);
        let state = self.node_mut(node)?;
        state.memory.write(sent.clone())?;
        if let Some(record) = state.ledger.live_mut(id) {
            record.charlie = Some(sent.clone());
        }
        simulator.send(
            QUANTUM,
            node,
            next,
            Event::Qubit {
                role: transmit.role,
                pair: sent,
            },
        )?;
        Ok(())
    }

    /// Store the far half of a pair sent by `from`.
    fn arrival(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        from: NodeId,
        role: Role,
        pair: EprAccount,
    ) -> Result<(), Error> {
        let id = pair.transmit;
        let mut transmit = Transmit::new(
            id,
            pair.session,
            role,
            pair.src,
            pair.dst,
            simulator.current(),
        );
        let forward = if node == pair.dst {
            None
        } else {
            let route = self.route(node, pair.dst)?;
            if role == Role::Distro && route.uses_vlink {
                None
            } else {
                Some(self.generate(node, &transmit))
            }
        };

        let state = self.node_mut(node)?;
        let mut stored = state.memory.write(pair.clone());
        if let (true, Some(forward)) = (stored.is_ok(), forward.as_ref()) {
            stored = state.memory.write(forward.clone());
            if stored.is_err() {
                state.memory.read(pair.id);
            }
        }
        if let Err(err) = stored {
            warn!(%node, transmit = %id, %role, ?err, "failed to store arriving pair");
            transmit.revoked = true;
            state.ledger.insert(transmit);
            simulator.send(
                CLASSICAL,
                node,
                from,
                Event::control(Command::Revoke, id, role),
            )?;
            return Ok(());
        }
        let generated = forward.is_some();
        transmit.alice = Some(pair);
        transmit.charlie = forward;
        state.ledger.insert(transmit);
        if generated {
            self.generated(role);
        }
        debug!(%node, %from, transmit = %id, %role, "stored arriving pair");
        simulator.send(
            CLASSICAL,
            node,
            from,
            Event::control(Command::Swap, id, role),
        )?;
        Ok(())
    }

    fn swap(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        from: NodeId,
        control: Control,
    ) -> Result<(), Error> {
        let Some(transmit) = self.live(node, &control)? else {
            return Ok(());
        };
        if node != transmit.src {
            let (Some(alice), Some(charlie)) = (transmit.alice, transmit.charlie) else {
                warn!(%node, transmit = %transmit.id, "missing halves for swap");
                return Ok(());
            };
            let pair = self.swapped(&alice, &charlie, charlie.loc_b);
            let state = self.node_mut(node)?;
            state.memory.read(alice.id);
            state.memory.read(charlie.id);
            state.ledger.remove(transmit.id);
            self.metrics
                .swaps
                .get_or_create(&Instance { role: control.role })
                .inc();
            debug!(
                %node,
                transmit = %transmit.id,
                a = %pair.loc_a,
                b = %pair.loc_b,
                fidelity = pair.fidelity,
                "swapped"
            );
            self.install(pair.loc_a, Slot::Charlie, alice.id, pair.clone());
            self.install(pair.loc_b, Slot::Alice, charlie.id, pair);
        }
        simulator.send(
            CLASSICAL,
            node,
            from,
            Event::control(Command::Next, control.transmit, control.role),
        )?;
        Ok(())
    }

    fn next(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        control: Control,
    ) -> Result<(), Error> {
        let Some(transmit) = self.live(node, &control)? else {
            return Ok(());
        };
        if node != transmit.dst {
            return self.forward(simulator, node, transmit.id);
        }

        // Maintenance keeps its half: it becomes one end of the virtual link
        if transmit.role == Role::Distro {
            let state = self.node_mut(node)?;
            state.ledger.remove(transmit.id);
            if let Some(alice) = transmit.alice {
                state.memory.read(alice.id);
                self.delivered.insert(transmit.id, alice);
            }
        }
        debug!(%node, transmit = %transmit.id, role = %transmit.role, "reached destination");
        simulator.send(
            CLASSICAL,
            node,
            transmit.src,
            Event::control(Command::Success, transmit.id, transmit.role),
        )?;
        Ok(())
    }

    fn success(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        control: Control,
    ) -> Result<(), Error> {
        let Some(transmit) = self.live(node, &control)? else {
            return Ok(());
        };
        if node != transmit.src {
            warn!(%node, transmit = %transmit.id, "success delivered away from source");
            return Ok(());
        }
        let latency = simulator
            .current()
            .duration_since(transmit.start)
            .unwrap_or_default();
        let instance = Instance {
            role: transmit.role,
        };
        self.metrics.succeeded.get_or_create(&instance).inc();
        self.metrics
            .latency
            .get_or_create(&instance)
            .inc_by(latency.as_secs_f64());

        match instance.role {
            Role::Distro => {
                let state = self.node_mut(node)?;
                state.ledger.remove(transmit.id);
                let Some(pair) = transmit.charlie else {
                    warn!(%node, transmit = %transmit.id, "completed without a pair");
                    return Ok(());
                };
                state.memory.read(pair.id);
                info!(
                    src = %transmit.src,
                    dst = %transmit.dst,
                    transmit = %transmit.id,
                    fidelity = pair.fidelity,
                    ?latency,
                    "distribution completed"
                );
                self.completions.push(Completion {
                    transmit: transmit.id,
                    session: transmit.session,
                    src: transmit.src,
                    dst: transmit.dst,
                    delivered: self.delivered.remove(&transmit.id),
                    pair,
                    latency,
                });
                Ok(())
            }
            Role::Maint => self.publish(simulator, transmit),
        }
    }

    /// Hand the pair of a completed maintenance distribution to the pool.
    fn publish(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        transmit: Transmit,
    ) -> Result<(), Error> {
        let (a, b) = (transmit.src, transmit.dst);
        self.node_mut(a)?.ledger.remove(transmit.id);
        self.node_mut(b)?.ledger.remove(transmit.id);
        let Some(pair) = transmit.charlie else {
            warn!(%a, %b, transmit = %transmit.id, "established virtual link without a pair");
            return Ok(());
        };
        self.pool.publish(VirtualLink {
            transmit: transmit.id,
            pair,
            a,
            b,
        });
        self.metrics.vlinks_established.inc();
        info!(%a, %b, transmit = %transmit.id, "established virtual link");

        // Notify the endpoint that has waited the longest
        let here = self.pool.first_waiter(a, b).map(|w| w.ticket);
        let there = self.pool.first_waiter(b, a).map(|w| w.ticket);
        match (here, there) {
            (None, None) => Ok(()),
            (Some(here), Some(there)) if here < there => self.consume(simulator, a),
            (Some(_), None) => self.consume(simulator, a),
            _ => {
                simulator.send(
                    CLASSICAL,
                    a,
                    b,
                    Event::control(Command::Vlink, transmit.id, Role::Maint),
                )?;
                Ok(())
            }
        }
    }

    /// Hand available virtual links at `node` to the distributions waiting there.
    fn consume(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
    ) -> Result<(), Error> {
        while let Some(claim) = self.pool.claim(node) {
            match claim {
                Claim::Ready { waiter, link } => {
                    self.traverse(simulator, node, waiter, link)?;
                    self.resume(simulator, waiter.session);
                }
                Claim::Violation { handle, link } => {
                    self.metrics.race_violations.inc();
                    let Some(link) = link else {
                        error!(%node, ?handle, "aborted claim of consumed virtual link");
                        continue;
                    };
                    let err = Error::VlinkRaceViolation {
                        link: link.transmit,
                    };
                    error!(%node, %err, "aborted virtual link claim");
                    for end in [link.a, link.b] {
                        if let Some(state) = self.nodes.get_mut(&end) {
                            state.memory.read(link.pair.id);
                        }
                    }
                }
            }
        }

        // Offer leftover links to waiters at the opposite endpoint
        let mut peers = BTreeMap::new();
        for link in self.pool.links() {
            let Some(peer) = link.peer(node) else {
                continue;
            };
            if self.pool.first_waiter(peer, node).is_some() {
                peers.entry(peer).or_insert(link.transmit);
            }
        }
        for (peer, link) in peers {
            simulator.send(
                CLASSICAL,
                node,
                peer,
                Event::control(Command::Vlink, link, Role::Maint),
            )?;
        }
        Ok(())
    }

    /// Extend a waiting distribution over a claimed virtual link.
    fn traverse(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        waiter: Waiter,
        link: VirtualLink,
    ) -> Result<(), Error> {
        let transmit = self.node_mut(node)?.ledger.live(waiter.transmit).cloned();
        let first = transmit
            .as_ref()
            .and_then(|t| t.alice.clone().or_else(|| t.charlie.clone()));
        let (Some(transmit), Some(first), Some(peer)) = (transmit, first, link.peer(node)) else {
            debug!(%node, transmit = %waiter.transmit, "waiter vanished, returning virtual link");
            self.pool.publish(link);
            return Ok(());
        };

        let pair = self.swapped(&first, &link.pair, peer);
        let state = self.node_mut(node)?;
        for held in [&transmit.alice, &transmit.charlie].into_iter().flatten() {
            state.memory.read(held.id);
        }
        state.memory.read(link.pair.id);
        if node != transmit.src {
            state.ledger.remove(transmit.id);
        }
        self.node_mut(peer)?.memory.read(link.pair.id);
        self.metrics.vlinks_consumed.inc();
        self.metrics
            .swaps
            .get_or_create(&Instance { role: Role::Distro })
            .inc();
        info!(
            %node,
            %peer,
            transmit = %transmit.id,
            link = %link.transmit,
            "consumed virtual link"
        );

        let backward = first.loc_a;
        self.install(backward, Slot::Charlie, first.id, pair.clone());
        simulator.schedule(
            simulator.current(),
            peer,
            Event::Teleported {
                from: backward,
                pair,
            },
        );
        Ok(())
    }

    /// Restart the ticks of a parked session once none of its distributions waits.
    fn resume(&mut self, simulator: &mut Simulator<NodeId, Event>, session: SessionId) {
        if self.pool.is_session_waiting(session) {
            return;
        }
        let Some(state) = self.sessions.get_mut(&session) else {
            return;
        };
        if !std::mem::take(&mut state.parked) {
            return;
        }
        let src = state.request.src;
        debug!(%session, "resuming session");
        simulator.schedule(simulator.current(), src, Event::Tick { session });
    }

    fn revoke(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        control: Control,
    ) -> Result<(), Error> {
        if self.live(node, &control)?.is_none() {
            return Ok(());
        }
        self.abandon(simulator, node, control.transmit)
    }

    /// Release what `node` holds for a distribution and pass the revocation on to the
    /// source (or, at the source, record it).
    fn abandon(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        node: NodeId,
        id: TransmitId,
    ) -> Result<(), Error> {
        let Some(transmit) = self.release(node, id)? else {
            return Ok(());
        };
        self.resume(simulator, transmit.session);
        if node == transmit.src {
            self.metrics
                .revoked
                .get_or_create(&Instance {
                    role: transmit.role,
                })
                .inc();
            info!(
                src = %transmit.src,
                dst = %transmit.dst,
                transmit = %transmit.id,
                role = %transmit.role,
                "distribution revoked"
            );
            return Ok(());
        }
        debug!(%node, transmit = %transmit.id, "released revoked distribution");
        simulator.send(
            CLASSICAL,
            node,
            transmit.src,
            Event::control(Command::Revoke, transmit.id, transmit.role),
        )?;
        Ok(())
    }
}

impl<C: Combiner> Handler<NodeId, Event> for Network<C> {
    type Error = Error;

    fn handle(
        &mut self,
        simulator: &mut Simulator<NodeId, Event>,
        envelope: Envelope<NodeId, Event>,
    ) -> Result<(), Error> {
        let node = envelope.recipient;
        let result = match (envelope.origin, envelope.payload) {
            (_, Event::Tick { session }) => self.tick(simulator, node, session),
            (Some(from), Event::Qubit { role, pair }) => {
                self.arrival(simulator, node, from, role, pair)
            }
            (_, Event::Teleported { from, pair }) => {
                self.arrival(simulator, node, from, Role::Distro, pair)
            }
            (Some(from), Event::Control(control)) => match control.command {
                Command::Swap => self.swap(simulator, node, from, control),
                Command::Next => self.next(simulator, node, control),
                Command::Success => self.success(simulator, node, control),
                Command::Revoke => self.revoke(simulator, node, control),
                Command::Vlink => self.consume(simulator, node),
            },
            (None, event) => {
                warn!(%node, ?event, "dropping message without origin");
                Ok(())
            }
        };
        self.refresh_occupancy();
        result
    }
}
