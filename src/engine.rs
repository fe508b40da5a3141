//! The DICe engine: one struct owning every protocol component, driven by
//! the event loop through timer and packet entry points.
//!
//! Data flow: attribute refresh pushes readings into the view
//! store, changes reset the trickle timer, the trickle fire broadcasts the
//! view, receptions merge back into the store, and every admitted reading or
//! tombstone replays through the history buffer into the evaluator. The
//! group monitor runs on its own channel and feeds liveness and evictions.
//!
//! The engine is synchronous and single-threaded; all methods take the
//! current node-clock tick count from the caller, which keeps every
//! operation deterministic under test.

use crate::attributes::{Attributes, Sensor};
use crate::eval;
use crate::group::{GroupError, GroupMonitor};
use crate::history::{History, HistoryRecord};
use crate::invariant::InvariantSet;
use crate::trickle::{FireOutcome, Trickle, rebase_packet};
use crate::types::{LV_CONJS, NodeAddr, Timestamp, View, ViewConj, ViewT1};
use crate::view::Liveness;
use crate::view::ViewStore;
use crate::wire::{DissemPacket, DissemPayload, VectorClockPacket};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

/// Which view form this node disseminates. Both forms are always accepted
/// on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DissemMode {
    /// Gossip the T1 (disjunctive) view: only violated-quantifier masks.
    Disjunctions,
    /// Gossip the plain sliced view of readings.
    Readings,
}

/// Startup configuration, validated by [`Engine::new`].
pub struct EngineConfig {
    pub self_addr: NodeAddr,
    pub signature: crate::types::ViewSignature,
    pub invariants: InvariantSet,
    pub attribute_hashes: Vec<u16>,
    pub new_neighbour_latency_secs: u32,
    pub missing_latency_secs: u32,
    pub mode: DissemMode,
    pub rng_seed: u64,
}

pub struct Engine {
    self_addr: NodeAddr,
    group: GroupMonitor,
    views: ViewStore,
    history: History,
    trickle: Trickle,
    attrs: Attributes,
    invariants: InvariantSet,
    mode: DissemMode,
    new_neighbour_latency_secs: u32,
    missing_latency_secs: u32,
    rng: ChaCha8Rng,
}

impl Engine {
    pub fn new(cfg: EngineConfig, sensor: Sensor) -> Result<Self, crate::types::ConfigError> {
        let attrs = Attributes::new(cfg.self_addr, &cfg.attribute_hashes, sensor)?;
        let disjunction_count = cfg.invariants.disjunction_count();
        Ok(Self {
            self_addr: cfg.self_addr,
            group: GroupMonitor::new(cfg.self_addr),
            views: ViewStore::new(cfg.self_addr, cfg.signature, disjunction_count),
            history: History::new(),
            trickle: Trickle::new(),
            attrs,
            invariants: cfg.invariants,
            mode: cfg.mode,
            new_neighbour_latency_secs: cfg.new_neighbour_latency_secs,
            missing_latency_secs: cfg.missing_latency_secs,
            rng: ChaCha8Rng::seed_from_u64(cfg.rng_seed),
        })
    }

    /// Start the group monitor and arm the first trickle interval.
    pub fn start(&mut self, now_ticks: u64) -> Result<(), GroupError> {
        self.group.start(self.new_neighbour_latency_secs, self.missing_latency_secs)?;
        self.trickle.init(now_ticks, &mut self.rng);
        info!(addr = %self.self_addr, "engine started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.group.stop();
    }

    /// Admit view-store records into history; every admission reconstructs
    /// the view at the record's timestamp and re-evaluates the invariant.
    fn admit_history(&mut self, records: Vec<HistoryRecord>, now: Timestamp) {
        for record in records {
            let Some(entries) = self.history.admit(record, now, self.views.signature()) else {
                continue;
            };
            match eval::evaluate(&self.invariants.invariant, &self.invariants.mapping, &entries)
            {
                Ok(true) => info!(at = %record.ts(), "invariant complied with"),
                Ok(false) => warn!(at = %record.ts(), "invariant violated"),
                Err(err) => debug!(%err, "no eval"),
            }
        }
    }

    fn log_t1_verdict(&self) {
        let complied = eval::evaluate_disjunctions(
            &self.views.t1().conjs,
            self.invariants.disjunction_count(),
        );
        if complied {
            info!("t1 complied");
        } else {
            warn!("t1 violated");
        }
    }

    /// Re-evaluate the disjuncts locally and fold transitions into the T1
    /// view. Returns whether anything changed.
    fn refresh_disjunctions(&mut self, now: Timestamp) -> bool {
        if self.invariants.disjunction_count() == 0 {
            return false;
        }
        let mut fresh = [ViewConj::default(); LV_CONJS];
        eval::evaluate_local_disjunctions(
            &self.invariants.disjunctions,
            &self.attrs,
            self.self_addr,
            now,
            &mut fresh,
        );
        let updated = self.views.apply_local_disjunctions(&fresh, now);
        if updated {
            self.log_t1_verdict();
        }
        updated
    }

    /// Attribute refresh cadence: resample the node's own readings, fold
    /// the fresh values through the local disjunct evaluation, push them
    /// into the view, and reset the trickle timer on any change.
    pub fn refresh_attributes(&mut self, now_ticks: u64) {
        let now = Timestamp::from_ticks(now_ticks);
        let entries = self.attrs.refresh(now);
        let mut updated = self.refresh_disjunctions(now);

        for entry in entries {
            let out = self.views.push_entry(&entry, &self.group);
            if out.changed {
                debug!(view = %self.views.view(), "after refresh");
                updated = true;
            }
            self.admit_history(out.records, now);
        }

        if updated {
            self.trickle.reset(now_ticks, &mut self.rng);
        }
    }

    fn process_evictions(&mut self, evicted: Vec<NodeAddr>, now_ticks: u64) {
        let now = Timestamp::from_ticks(now_ticks);
        for addr in evicted {
            info!(member = %addr, "group eviction");
            let out = self.views.on_eviction(addr, now);
            self.admit_history(out.records, now);
            if out.changed {
                self.trickle.reset(now_ticks, &mut self.rng);
            }
        }
    }

    /// Group monitor cadence (1 s). Returns the vector-clock packet to
    /// broadcast when the gossip interval is due.
    pub fn group_tick(&mut self, now_ticks: u64) -> Option<VectorClockPacket> {
        let out = self.group.tick();
        self.process_evictions(out.evicted, now_ticks);
        out.broadcast
    }

    /// A vector-clock packet arrived on the group channel.
    pub fn on_group_packet(&mut self, src: NodeAddr, pkt: &VectorClockPacket, now_ticks: u64) {
        let evicted = self.group.on_packet(src, pkt);
        self.process_evictions(evicted, now_ticks);
    }

    /// Trickle deadline reached. Returns the packet to broadcast, or `None`
    /// when this interval suppresses (or a wrap forced a reset).
    pub fn trickle_fire(&mut self, now_ticks: u64) -> Option<DissemPacket> {
        let now = Timestamp::from_ticks(now_ticks);
        if self.trickle.wrapped(now) && self.views.prune_view(now) {
            self.trickle.force_reset(now_ticks, &mut self.rng);
            return None;
        }
        match self.trickle.advance(now_ticks, &mut self.rng) {
            FireOutcome::Suppress => None,
            FireOutcome::Transmit => Some(self.build_packet(now)),
        }
    }

    fn build_packet(&self, now: Timestamp) -> DissemPacket {
        let payload = match self.mode {
            DissemMode::Disjunctions => DissemPayload::Disjunctions(*self.views.t1()),
            DissemMode::Readings => DissemPayload::Readings(*self.views.view()),
        };
        debug!(kind = payload.kind(), "send view");
        DissemPacket { src: self.self_addr, timestamp: now, payload }
    }

    /// A dissemination packet arrived. Unknown senders are fast-registered
    /// with the group monitor, timestamps are rebased onto our clock, and
    /// the payload merges into the matching view. A merge that brought new
    /// information resets the trickle timer; a redundant one counts toward
    /// suppression.
    pub fn on_dissemination(&mut self, mut pkt: DissemPacket, now_ticks: u64) {
        if pkt.src == self.self_addr {
            return;
        }
        let now = Timestamp::from_ticks(now_ticks);
        debug!(from = %pkt.src, kind = pkt.payload.kind(), "received view");

        if !self.group.is_alive(pkt.src) {
            self.group.force_update(pkt.src);
        }
        rebase_packet(&mut pkt, now);

        let updated = match pkt.payload {
            DissemPayload::Readings(view) => self.merge_readings(&view, now),
            DissemPayload::Disjunctions(t1) => self.merge_t1(&t1, now),
        };

        if updated {
            self.trickle.reset(now_ticks, &mut self.rng);
        } else {
            self.trickle.note_redundant();
        }
    }

    fn merge_readings(&mut self, view: &View, now: Timestamp) -> bool {
        let self_readings = self.attrs.current_entries(now);
        let out = self.views.merge_view(view, now, &self.group, &self_readings);
        self.admit_history(out.records, now);
        out.changed
    }

    fn merge_t1(&mut self, t1: &ViewT1, now: Timestamp) -> bool {
        let updated = self.views.merge_disjunctions(t1, now);
        if updated {
            eval::evaluate_local_disjunctions(
                &self.invariants.disjunctions,
                &self.attrs,
                self.self_addr,
                now,
                self.views.t1_conjs_mut(),
            );
            self.log_t1_verdict();
        }
        updated
    }

    /// Next trickle deadline in absolute ticks, for the runtime to arm.
    pub fn next_trickle_fire(&self) -> Option<u64> {
        self.trickle.next_fire()
    }

    pub fn self_addr(&self) -> NodeAddr {
        self.self_addr
    }

    pub fn view(&self) -> &View {
        self.views.view()
    }

    pub fn t1(&self) -> &ViewT1 {
        self.views.t1()
    }

    pub fn trickle(&self) -> &Trickle {
        &self.trickle
    }

    pub fn group(&self) -> &GroupMonitor {
        &self.group
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
