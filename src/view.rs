//! The local view store: slice placement, drop tombstones, merging.
//!
//! A view is a bounded projection of the group's best recent readings. Each
//! signature slice ranks entries by its objective; admission is monotone, one
//! entry per source per slice, and a reading whose source is dead or shadowed
//! by a tombstone never enters. The store never allocates past its fixed
//! tables; every operation reports whether it actually changed state.

use crate::history::HistoryRecord;
use crate::types::{
    LV_CONJS, LV_DROPS, LV_ENTRIES, MAX_QUANTIFIERS, NodeAddr, SignatureEntry, Timestamp, View,
    ViewConj, ViewDrop, ViewEntry, ViewSignature, ViewT1,
};
use tracing::{debug, trace};

/// Liveness oracle, answered by the group monitor in production.
pub trait Liveness {
    fn is_alive(&self, addr: NodeAddr) -> bool;
}

/// Result of pushing one reading into the slices of an entry table.
#[derive(Debug, Default)]
pub struct SlicePush {
    pub changed: bool,
    /// Supersede tombstones: a prior better value from the same source was
    /// replaced by a worse one, so remote nodes must discard the stale entry.
    pub drops: Vec<ViewDrop>,
}

/// Outcome of a view-store operation, carrying the records the history
/// buffer should admit.
#[derive(Debug, Default)]
pub struct StoreOutcome {
    pub changed: bool,
    pub records: Vec<HistoryRecord>,
}

fn shift_left(entries: &mut [ViewEntry; LV_ENTRIES], idx: usize, end: usize) {
    for i in idx..end - 1 {
        entries[i] = entries[i + 1];
    }
    entries[end - 1] = ViewEntry::default();
}

fn shift_right(entries: &mut [ViewEntry; LV_ENTRIES], idx: usize, end: usize) {
    for i in (idx + 1..end).rev() {
        entries[i] = entries[i - 1];
    }
}

/// The occupant keeps its slot only against a strictly worse candidate.
fn keeps_slot(candidate: &ViewEntry, occupant: &ViewEntry, sig: &SignatureEntry) -> bool {
    !occupant.is_empty() && sig.objective.worse(candidate.val, occupant.val)
}

/// Same-source replacement inside one slice.
///
/// A meaningfully newer reading displaces the old one and re-ranks. When the
/// temporal order and the value order disagree, the slot's history is
/// ambiguous to third parties, so a supersede tombstone is emitted for the
/// timestamp that lost.
fn push_existing(
    entries: &mut [ViewEntry; LV_ENTRIES],
    entry: &ViewEntry,
    idx: usize,
    start: usize,
    end: usize,
    sig: &SignatureEntry,
    drops: &mut Vec<ViewDrop>,
) -> bool {
    let old = entries[idx];
    if old.val == entry.val {
        return false;
    }

    let cond_ts = entry.ts.after_synch(old.ts);
    let cond_val = old.val < entry.val;
    let mut changed = false;

    if cond_ts {
        shift_left(entries, idx, end);
        push_to_slice(entries, entry, start, end, sig, drops);
        changed = true;
    }

    if cond_ts != cond_val {
        let ts = if cond_ts { old.ts } else { entry.ts };
        drops.push(ViewDrop { ts, src: entry.src });
        changed = true;
    }
    changed
}

/// Push one reading into a single slice, keeping the slice ranked.
fn push_to_slice(
    entries: &mut [ViewEntry; LV_ENTRIES],
    entry: &ViewEntry,
    start: usize,
    end: usize,
    sig: &SignatureEntry,
    drops: &mut Vec<ViewDrop>,
) -> bool {
    for i in start..end {
        if !entries[i].is_empty() && entries[i].src == entry.src {
            return push_existing(entries, entry, i, start, end, sig, drops);
        }
    }

    for i in start..end {
        if keeps_slot(entry, &entries[i], sig) {
            continue;
        }
        shift_right(entries, i, end);
        entries[i] = *entry;
        trace!(val = entry.val, slot = i, "slice insert");
        return true;
    }
    false
}

/// Push one reading into every slice whose signature attribute matches.
pub fn push_to_slices(
    signature: &ViewSignature,
    entries: &mut [ViewEntry; LV_ENTRIES],
    entry: &ViewEntry,
) -> SlicePush {
    let mut out = SlicePush::default();
    let slices: Vec<(usize, usize, SignatureEntry)> =
        signature.slices().map(|(s, e, sig)| (s, e, *sig)).collect();
    for (start, end, sig) in slices {
        if sig.attr != entry.attr {
            continue;
        }
        if push_to_slice(entries, entry, start, end, &sig, &mut out.drops) {
            out.changed = true;
        }
    }
    out
}

/// Admit a tombstone into a drop table: at most one per source, later
/// timestamp wins; with no free slot the oldest tombstone is overwritten.
pub(crate) fn admit_drop(drops: &mut [ViewDrop; LV_DROPS], drop: &ViewDrop) -> bool {
    for d in drops.iter_mut() {
        if d.is_empty() || d.src != drop.src {
            continue;
        }
        if !drop.ts.after_synch(d.ts) {
            return false;
        }
        d.ts = drop.ts;
        return true;
    }

    let mut slot = None;
    let mut oldest: Option<(usize, Timestamp)> = None;
    for (i, d) in drops.iter().enumerate() {
        if d.is_empty() {
            slot = Some(i);
            break;
        }
        // No synch-accuracy adjustment here: only the oldest slot matters.
        match oldest {
            Some((_, ts)) if !ts.after(d.ts) => {}
            _ => oldest = Some((i, d.ts)),
        }
    }

    let Some(slot) = slot.or(oldest.map(|(i, _)| i)) else {
        debug!(src = %drop.src, "drop table error");
        return false;
    };
    trace!(slot, ts = %drop.ts, "inserted drop");
    drops[slot] = *drop;
    true
}

/// Slot-wise view comparison used by the merge preamble: two entry tables are
/// equivalent iff each slot is either empty in both, or occupied in both with
/// the same value and the same source. Timestamps are ignored.
pub fn entries_equivalent(a: &[ViewEntry; LV_ENTRIES], b: &[ViewEntry; LV_ENTRIES]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| {
        (x.is_empty() && y.is_empty())
            || (!x.is_empty() && !y.is_empty() && x.val == y.val && x.src == y.src)
    })
}

/// The per-node local view state: the plain sliced view and the T1
/// (disjunctive) view, created at startup and never destroyed.
pub struct ViewStore {
    self_addr: NodeAddr,
    signature: ViewSignature,
    view: View,
    t1: ViewT1,
    disjunction_count: usize,
}

impl ViewStore {
    pub fn new(self_addr: NodeAddr, signature: ViewSignature, disjunction_count: usize) -> Self {
        Self {
            self_addr,
            signature,
            view: View::default(),
            t1: ViewT1::default(),
            disjunction_count,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn t1(&self) -> &ViewT1 {
        &self.t1
    }

    pub fn t1_conjs_mut(&mut self) -> &mut [ViewConj; LV_CONJS] {
        &mut self.t1.conjs
    }

    pub fn signature(&self) -> &ViewSignature {
        &self.signature
    }

    fn is_shadowed(&self, entry: &ViewEntry) -> bool {
        self.view.drops.iter().any(|d| !d.is_empty() && d.shadows(entry))
    }

    /// Admit one reading. Preconditions (non-empty timestamp, live source,
    /// not shadowed) are enforced here; a rejected reading changes nothing.
    pub fn push_entry(&mut self, entry: &ViewEntry, alive: &dyn Liveness) -> StoreOutcome {
        let mut out = StoreOutcome::default();
        if entry.is_empty() {
            return out;
        }
        if self.is_shadowed(entry) || !alive.is_alive(entry.src) {
            trace!(entry = %entry, "push rejected (dead or shadowed source)");
            return out;
        }

        let push = push_to_slices(&self.signature, &mut self.view.entries, entry);
        for d in &push.drops {
            if admit_drop(&mut self.view.drops, d) {
                out.records.push(HistoryRecord::Drop(*d));
            }
        }
        if push.changed {
            out.records.push(HistoryRecord::Reading(*entry));
        }
        out.changed = push.changed;
        out
    }

    /// Admit a tombstone into the local drop table.
    pub fn push_drop(&mut self, drop: &ViewDrop) -> bool {
        admit_drop(&mut self.view.drops, drop)
    }

    /// Remove every entry of the tombstone's source that the tombstone
    /// shadows (i.e. every entry not strictly newer than it).
    pub fn prune_obsolete(&mut self, drop: &ViewDrop) -> bool {
        let slices: Vec<(usize, usize)> =
            self.signature.slices().map(|(s, e, _)| (s, e)).collect();
        let mut pruned = false;
        for (start, end) in slices {
            let mut i = start;
            while i < end {
                let e = self.view.entries[i];
                if e.is_empty() {
                    break;
                }
                if e.src != drop.src || e.ts.after(drop.ts) {
                    i += 1;
                    continue;
                }
                shift_left(&mut self.view.entries, i, end);
                pruned = true;
            }
        }
        pruned
    }

    /// Merge a peer's view.
    ///
    /// The update decision is taken against the peer's entry table before
    /// anything is applied; drops are applied regardless. Self-sourced and
    /// future-dated items from the peer are ignored. When an update is
    /// needed the node re-pushes its own current readings afterwards so its
    /// self-representation stays current.
    pub fn merge_view(
        &mut self,
        other: &View,
        now: Timestamp,
        alive: &dyn Liveness,
        self_readings: &[ViewEntry],
    ) -> StoreOutcome {
        trace!(local = %self.view, remote = %other, "merge");
        let need_update = !entries_equivalent(&self.view.entries, &other.entries);
        let mut records = Vec::new();

        for d in other.drops.iter().filter(|d| !d.is_empty()) {
            if d.src == self.self_addr || d.ts.0 > now.0 {
                continue;
            }
            if admit_drop(&mut self.view.drops, d) {
                records.push(HistoryRecord::Drop(*d));
            }
            self.prune_obsolete(d);
        }

        if need_update {
            for e in other.entries.iter().filter(|e| !e.is_empty()) {
                if e.src == self.self_addr || e.ts.0 > now.0 {
                    continue;
                }
                records.append(&mut self.push_entry(e, alive).records);
            }
            for e in self_readings {
                records.append(&mut self.push_entry(e, alive).records);
            }
        }

        debug!(updated = need_update, view = %self.view, "after merge");
        StoreOutcome { changed: need_update, records }
    }

    /// Drop entries dated after `ts` and clear tombstones dated after `ts`.
    /// Plain comparisons on purpose: this runs when the clock wrapped and
    /// anything "in the future" is an anomaly to flush.
    pub fn prune_view(&mut self, ts: Timestamp) -> bool {
        let slices: Vec<(usize, usize)> =
            self.signature.slices().map(|(s, e, _)| (s, e)).collect();
        let mut changed = false;
        for (start, end) in slices {
            let mut i = start;
            while i < end {
                if self.view.entries[i].ts.0 <= ts.0 {
                    i += 1;
                    continue;
                }
                shift_left(&mut self.view.entries, i, end);
                changed = true;
            }
        }
        for d in self.view.drops.iter_mut() {
            if d.ts.0 > ts.0 {
                d.ts = Timestamp::EMPTY;
                changed = true;
            }
        }
        if changed {
            debug!(view = %self.view, "after prune");
        }
        changed
    }

    /// A peer was declared dead: tombstone it at `now` and flush its
    /// entries. The tombstone goes to history only; the local drop table
    /// keeps tracking live sources.
    pub fn on_eviction(&mut self, addr: NodeAddr, now: Timestamp) -> StoreOutcome {
        let drop = ViewDrop { ts: now, src: addr };
        let pruned = self.prune_obsolete(&drop);
        StoreOutcome { changed: pruned, records: vec![HistoryRecord::Drop(drop)] }
    }

    // =========================================================================
    // T1 (DISJUNCTIVE) VIEW
    // =========================================================================

    /// Fold a freshly evaluated violation mask into the stored conjunctions.
    /// Transitions stamp `now`; a self-owned flag returning to compliance
    /// emits a self tombstone so peers retract it too.
    pub fn apply_local_disjunctions(
        &mut self,
        fresh: &[ViewConj; LV_CONJS],
        now: Timestamp,
    ) -> bool {
        let mut updated = false;
        for i in 0..self.disjunction_count {
            if self.fold_conj_update(i, &fresh[i], now) {
                updated = true;
            }
        }
        if updated {
            trace!(t1 = %self.t1, "after local refresh");
        }
        updated
    }

    fn fold_conj_update(&mut self, idx: usize, fresh: &ViewConj, now: Timestamp) -> bool {
        let mut changed = false;
        for q in 0..MAX_QUANTIFIERS {
            let conj = &self.t1.conjs[idx];
            if fresh.flagged[q] == conj.flagged[q] {
                continue;
            }

            let mut relevant = false;
            let mut stamp = now;

            if !fresh.flagged[q] && conj.src[q] == self.self_addr {
                // Back to compliance: the tombstone must postdate the flag
                // even if the flag timestamp ran ahead of our clock.
                let mut drop_ts = now;
                if conj.ts[q].0 > now.0 {
                    drop_ts = Timestamp::from_ticks(u64::from(conj.ts[q].0) + 1);
                }
                admit_drop(&mut self.t1.drops, &ViewDrop { ts: drop_ts, src: self.self_addr });
                relevant = true;
                stamp = Timestamp::EMPTY;
            }

            if fresh.flagged[q] {
                relevant = true;
            }
            if !relevant {
                continue;
            }

            let conj = &mut self.t1.conjs[idx];
            conj.flagged[q] = fresh.flagged[q];
            conj.src[q] = self.self_addr;
            conj.ts[q] = stamp;
            changed = true;
        }
        changed
    }

    fn conjs_equivalent(&self, other: &ViewT1) -> bool {
        (0..self.disjunction_count).all(|i| {
            (0..MAX_QUANTIFIERS)
                .all(|q| self.t1.conjs[i].flagged[q] == other.conjs[i].flagged[q])
        })
    }

    fn prune_obsolete_conj(&mut self, drop: &ViewDrop) -> bool {
        let mut updated = false;
        for i in 0..self.disjunction_count {
            for q in 0..MAX_QUANTIFIERS {
                let conj = &mut self.t1.conjs[i];
                if conj.ts[q].is_empty() || conj.src[q] != drop.src {
                    continue;
                }
                if conj.ts[q].after(drop.ts) {
                    continue;
                }
                conj.flagged[q] = false;
                conj.ts[q] = Timestamp::EMPTY;
                updated = true;
            }
        }
        updated
    }

    fn prune_all_obsolete_conjs(&mut self, other: &ViewT1, now: Timestamp) -> bool {
        let mut updated = false;
        for d in other.drops.iter().filter(|d| !d.is_empty()) {
            if d.src == self.self_addr || d.ts.0 > now.0 {
                continue;
            }
            if self.prune_obsolete_conj(d) {
                updated = true;
            }
            admit_drop(&mut self.t1.drops, d);
        }
        updated
    }

    fn push_other_disjunctions(&mut self, other: &ViewT1, now: Timestamp) {
        for i in 0..self.disjunction_count {
            for q in 0..MAX_QUANTIFIERS {
                let remote = &other.conjs[i];
                if remote.ts[q].is_empty() || !remote.flagged[q] {
                    continue;
                }
                // A peer claims a violation on our behalf that we no longer
                // hold: answer with a fresh self tombstone instead.
                if remote.src[q] == self.self_addr && self.t1.conjs[i].src[q] != self.self_addr
                {
                    admit_drop(&mut self.t1.drops, &ViewDrop { ts: now, src: self.self_addr });
                    continue;
                }
                let conj = &mut self.t1.conjs[i];
                conj.flagged[q] = true;
                conj.src[q] = remote.src[q];
                conj.ts[q] = remote.ts[q];
            }
        }
    }

    /// Merge a peer's T1 view; mirrors [`ViewStore::merge_view`] over the
    /// conjunction array. The caller re-evaluates the disjunctions when this
    /// reports an update.
    pub fn merge_disjunctions(&mut self, other: &ViewT1, now: Timestamp) -> bool {
        trace!(local = %self.t1, remote = %other, "t1 merge");
        let mut need_update = !self.conjs_equivalent(other);
        if self.prune_all_obsolete_conjs(other, now) {
            need_update = true;
        }
        if need_update {
            self.push_other_disjunctions(other, now);
        }
        debug!(updated = need_update, t1 = %self.t1, "after t1 merge");
        need_update
    }
}
