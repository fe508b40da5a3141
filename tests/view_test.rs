//! Unit tests for the view store: slice admission, tombstones, merging.

use dice::history::HistoryRecord;
use dice::types::{
    NodeAddr, Objective, SignatureEntry, Timestamp, View, ViewDrop, ViewEntry, ViewSignature,
};
use dice::view::{Liveness, ViewStore, entries_equivalent};

const SELF: NodeAddr = NodeAddr(1);
const A: NodeAddr = NodeAddr(2);
const B: NodeAddr = NodeAddr(3);
const C: NodeAddr = NodeAddr(4);

struct AllAlive;

impl Liveness for AllAlive {
    fn is_alive(&self, _: NodeAddr) -> bool {
        true
    }
}

struct Dead(NodeAddr);

impl Liveness for Dead {
    fn is_alive(&self, addr: NodeAddr) -> bool {
        addr != self.0
    }
}

fn signature() -> ViewSignature {
    ViewSignature::new(vec![
        SignatureEntry { attr: 1, objective: Objective::Maximize, slice_size: 2 },
        SignatureEntry { attr: 1, objective: Objective::Minimize, slice_size: 2 },
    ])
    .unwrap()
}

fn store() -> ViewStore {
    ViewStore::new(SELF, signature(), 0)
}

fn entry(val: u16, ts: u16, src: NodeAddr) -> ViewEntry {
    ViewEntry { val, attr: 1, ts: Timestamp(ts), src }
}

fn values(view: &View) -> Vec<Option<(u16, NodeAddr)>> {
    view.entries
        .iter()
        .map(|e| if e.is_empty() { None } else { Some((e.val, e.src)) })
        .collect()
}

/// Check the slice-ordering and per-source-uniqueness invariants.
fn assert_slices_sound(view: &View) {
    for (start, end, objective) in
        [(0usize, 2usize, Objective::Maximize), (2, 4, Objective::Minimize)]
    {
        let slice = &view.entries[start..end];
        // Empty slots contiguous at the high-index end.
        let occupied: Vec<_> = slice.iter().take_while(|e| !e.is_empty()).collect();
        assert!(slice[occupied.len()..].iter().all(|e| e.is_empty()));
        // Ranked by the slice objective.
        for pair in occupied.windows(2) {
            match objective {
                Objective::Maximize => assert!(pair[0].val >= pair[1].val),
                Objective::Minimize => assert!(pair[0].val <= pair[1].val),
            }
        }
        // At most one entry per source.
        for (i, e) in occupied.iter().enumerate() {
            assert!(!occupied[i + 1..].iter().any(|o| o.src == e.src));
        }
    }
}

#[test]
fn test_first_reading_lands_in_both_slices() {
    let mut store = store();
    let out = store.push_entry(&entry(50, 10, A), &AllAlive);
    assert!(out.changed);
    assert_eq!(
        values(store.view()),
        vec![Some((50, A)), None, Some((50, A)), None]
    );
    assert_slices_sound(store.view());
}

#[test]
fn test_second_source_ranks_by_objective() {
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 20, B), &AllAlive);
    assert_eq!(
        values(store.view()),
        vec![Some((80, B)), Some((50, A)), Some((50, A)), Some((80, B))]
    );
    assert_slices_sound(store.view());
}

#[test]
fn test_newer_worse_reading_replaces_and_tombstones() {
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 20, B), &AllAlive);
    let out = store.push_entry(&entry(30, 30, A), &AllAlive);
    assert!(out.changed);
    // A's newer, worse reading replaced its old one in both slices.
    assert_eq!(
        values(store.view()),
        vec![Some((80, B)), Some((30, A)), Some((30, A)), Some((80, B))]
    );
    // The stale optimistic value is tombstoned at its old timestamp.
    let expected = ViewDrop { ts: Timestamp(10), src: A };
    assert!(store.view().drops.contains(&expected));
    assert!(out.records.contains(&HistoryRecord::Drop(expected)));
    assert_slices_sound(store.view());
}

#[test]
fn test_eviction_prunes_all_slices() {
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 20, B), &AllAlive);

    let out = store.on_eviction(B, Timestamp(40));
    assert!(out.changed);
    assert_eq!(out.records, vec![HistoryRecord::Drop(ViewDrop { ts: Timestamp(40), src: B })]);
    assert!(!store.view().entries.iter().any(|e| e.src == B && !e.is_empty()));
    assert_slices_sound(store.view());
}

#[test]
fn test_dead_source_rejected() {
    let mut store = store();
    let out = store.push_entry(&entry(50, 10, A), &Dead(A));
    assert!(!out.changed);
    assert!(out.records.is_empty());
    assert!(store.view().entries[0].is_empty());
}

#[test]
fn test_tombstone_shadows_admission() {
    let mut store = store();
    assert!(store.push_drop(&ViewDrop { ts: Timestamp(50), src: C }));
    // At or before the tombstone: rejected.
    assert!(!store.push_entry(&entry(10, 45, C), &AllAlive).changed);
    assert!(!store.push_entry(&entry(10, 50, C), &AllAlive).changed);
    assert!(store.view().entries[0].is_empty());
    // Strictly newer than the tombstone: admitted.
    assert!(store.push_entry(&entry(10, 60, C), &AllAlive).changed);
}

#[test]
fn test_merge_is_idempotent() {
    let mut store = store();
    let self_reading = entry(50, 5, SELF);
    store.push_entry(&self_reading, &AllAlive);

    // A peer view that already includes our reading.
    let mut other = View::default();
    other.entries[0] = entry(80, 20, B);
    other.entries[1] = entry(50, 5, SELF);
    other.entries[2] = entry(50, 5, SELF);
    other.entries[3] = entry(80, 20, B);

    let now = Timestamp(30);
    let first = store.merge_view(&other, now, &AllAlive, &[entry(50, 30, SELF)]);
    assert!(first.changed);
    assert!(entries_equivalent(&store.view().entries, &other.entries));

    let second = store.merge_view(&other, now, &AllAlive, &[entry(50, 30, SELF)]);
    assert!(!second.changed);
    assert!(entries_equivalent(&store.view().entries, &other.entries));
}

#[test]
fn test_merge_outcome_is_symmetric() {
    let mut node_a = ViewStore::new(A, signature(), 0);
    let mut node_b = ViewStore::new(B, signature(), 0);
    node_a.push_entry(&entry(50, 10, A), &AllAlive);
    node_b.push_entry(&entry(80, 12, B), &AllAlive);

    let view_a = *node_a.view();
    let view_b = *node_b.view();
    let now = Timestamp(20);
    node_a.merge_view(&view_b, now, &AllAlive, &[entry(50, 20, A)]);
    node_b.merge_view(&view_a, now, &AllAlive, &[entry(80, 20, B)]);

    let mut set_a: Vec<_> = values(node_a.view()).into_iter().flatten().collect();
    let mut set_b: Vec<_> = values(node_b.view()).into_iter().flatten().collect();
    set_a.sort();
    set_b.sort();
    assert_eq!(set_a, set_b);
    assert_slices_sound(node_a.view());
    assert_slices_sound(node_b.view());
}

#[test]
fn test_full_views_with_source_swap_still_reconcile() {
    // Both views fully packed with the same values, but the 80 comes from a
    // different source on each side. A source mismatch at equal value must
    // still count as a difference, or the entry-adoption loop never runs and
    // the nodes never agree on the (src, value) set.
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 20, B), &AllAlive);
    assert!(store.view().entries.iter().all(|e| !e.is_empty()));

    let mut other = View::default();
    other.entries[0] = entry(80, 22, C);
    other.entries[1] = entry(50, 10, A);
    other.entries[2] = entry(50, 10, A);
    other.entries[3] = entry(80, 22, C);

    let out = store.merge_view(&other, Timestamp(30), &AllAlive, &[]);
    assert!(out.changed);
    assert!(values(store.view()).contains(&Some((80, C))));
    assert_slices_sound(store.view());
}

#[test]
fn test_merge_skips_self_and_future_items() {
    let mut store = store();
    store.push_entry(&entry(50, 10, SELF), &AllAlive);

    let mut other = View::default();
    // A stale echo of ourselves and a future-dated reading.
    other.entries[0] = entry(99, 5, SELF);
    other.entries[1] = entry(70, 90, B);
    other.drops[0] = ViewDrop { ts: Timestamp(4), src: SELF };
    other.drops[1] = ViewDrop { ts: Timestamp(95), src: B };

    let out = store.merge_view(&other, Timestamp(20), &AllAlive, &[entry(50, 20, SELF)]);
    // The peer table differs, so an update is reported, but neither the
    // self echo nor the future reading was adopted.
    assert!(out.changed);
    assert!(!store.view().entries.iter().any(|e| !e.is_empty() && e.val == 99));
    assert!(!store.view().entries.iter().any(|e| e.src == B && !e.is_empty()));
    assert!(store.view().drops.iter().all(|d| d.is_empty()));
}

#[test]
fn test_merge_applies_drops_and_prunes() {
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 20, B), &AllAlive);

    let mut other = View::default();
    other.entries[0] = entry(50, 10, A);
    other.entries[1] = entry(80, 20, B);
    other.entries[2] = entry(50, 10, A);
    other.entries[3] = entry(80, 20, B);
    other.drops[0] = ViewDrop { ts: Timestamp(25), src: B };

    let out = store.merge_view(&other, Timestamp(30), &AllAlive, &[]);
    assert!(!store.view().entries.iter().any(|e| e.src == B && !e.is_empty()));
    assert!(store.view().drops.contains(&ViewDrop { ts: Timestamp(25), src: B }));
    assert!(out.records.contains(&HistoryRecord::Drop(ViewDrop { ts: Timestamp(25), src: B })));
}

#[test]
fn test_prune_view_flushes_futures() {
    let mut store = store();
    store.push_entry(&entry(50, 10, A), &AllAlive);
    store.push_entry(&entry(80, 60, B), &AllAlive);
    store.push_drop(&ViewDrop { ts: Timestamp(70), src: C });

    assert!(store.prune_view(Timestamp(40)));
    assert!(!store.view().entries.iter().any(|e| e.src == B && !e.is_empty()));
    assert!(store.view().entries.iter().any(|e| e.src == A && !e.is_empty()));
    assert!(store.view().drops.iter().all(|d| d.is_empty()));
    // Nothing left to flush: reports unchanged.
    assert!(!store.prune_view(Timestamp(40)));
}
