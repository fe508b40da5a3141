//! Time-indexed history of admitted readings and tombstones.
//!
//! The buffer exists to re-evaluate the invariant *at the time a reading was
//! taken*, not at the time it arrived: every admission reconstructs the view
//! as of the admitted timestamp and hands it back for evaluation. Entries
//! expire when their timestamp falls outside the overflow window of "now".

use crate::types::{
    HISTORY_SIZE, LV_ENTRIES, NodeAddr, SYNCH_OVERFLOW, TS_MAX, Timestamp, ViewDrop, ViewEntry,
    ViewSignature,
};
use crate::view::push_to_slices;
use tracing::debug;

/// What the history stores: a reading or a drop tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRecord {
    Reading(ViewEntry),
    Drop(ViewDrop),
}

impl HistoryRecord {
    pub fn ts(&self) -> Timestamp {
        match self {
            HistoryRecord::Reading(e) => e.ts,
            HistoryRecord::Drop(d) => d.ts,
        }
    }
}

/// Bounded ring of past records, indexed by timestamp.
pub struct History {
    records: Vec<HistoryRecord>,
    last_seen: Timestamp,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self { records: Vec::with_capacity(HISTORY_SIZE), last_seen: Timestamp::EMPTY }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Garbage-collect on clock wrap: when "now" moved backwards, every
    /// record outside the overflow window of the new "now" is expired.
    fn flush_overflow(&mut self, now: Timestamp) {
        if now.0 >= self.last_seen.0 {
            self.last_seen = now;
            return;
        }
        self.last_seen = now;
        let before = self.records.len();
        self.records.retain(|r| now.after_eq(r.ts()));
        if self.records.len() < before {
            debug!(expired = before - self.records.len(), "history flush on wrap");
        }
    }

    /// Admit a record and reconstruct the view at its timestamp.
    ///
    /// Rejections return `None`: a timestamp ahead of "now" that cannot be
    /// explained by a wrap is out of window, and a full buffer holding only
    /// newer records has no slot for an older arrival.
    pub fn admit(
        &mut self,
        record: HistoryRecord,
        now: Timestamp,
        signature: &ViewSignature,
    ) -> Option<[ViewEntry; LV_ENTRIES]> {
        let ts = record.ts();
        self.flush_overflow(now);

        if ts.0 > now.0 && ts.0 - now.0 < TS_MAX - SYNCH_OVERFLOW {
            debug!(%ts, %now, "history too old");
            return None;
        }

        if self.records.len() < HISTORY_SIZE {
            self.records.push(record);
        } else {
            // Overwrite the oldest record not newer than the arrival. No
            // synch-accuracy adjustment: adjusting would overfill the buffer.
            let mut oldest: Option<(usize, Timestamp)> = None;
            for (i, r) in self.records.iter().enumerate() {
                let tts = r.ts();
                if !ts.after_eq(tts) {
                    continue;
                }
                match oldest {
                    Some((_, ots)) if !ots.after(tts) => {}
                    _ => oldest = Some((i, tts)),
                }
            }
            let (idx, _) = oldest?;
            self.records[idx] = record;
        }

        Some(self.build_view(ts, signature))
    }

    /// A tombstone for `addr` strictly inside `(from, to)`.
    fn drop_exists(&self, addr: NodeAddr, from: Timestamp, to: Timestamp) -> bool {
        self.records.iter().any(|r| match r {
            HistoryRecord::Drop(d) => {
                d.src == addr && d.ts.after(from) && to.after(d.ts)
            }
            _ => false,
        })
    }

    /// Reconstruct the view as of `ts`: place every reading taken at or
    /// before `ts` whose source is not shadowed by a later tombstone.
    fn build_view(&self, ts: Timestamp, signature: &ViewSignature) -> [ViewEntry; LV_ENTRIES] {
        let mut entries = [ViewEntry::default(); LV_ENTRIES];
        for r in &self.records {
            let HistoryRecord::Reading(entry) = r else {
                continue;
            };
            if entry.ts.after(ts) || self.drop_exists(entry.src, entry.ts, ts) {
                continue;
            }
            push_to_slices(signature, &mut entries, entry);
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Objective, SignatureEntry};

    fn signature() -> ViewSignature {
        ViewSignature::new(vec![SignatureEntry {
            attr: 1,
            objective: Objective::Maximize,
            slice_size: 2,
        }])
        .unwrap()
    }

    fn reading(val: u16, ts: u16, src: u16) -> HistoryRecord {
        HistoryRecord::Reading(ViewEntry {
            val,
            attr: 1,
            ts: Timestamp(ts),
            src: NodeAddr(src),
        })
    }

    #[test]
    fn reconstruction_excludes_newer_readings() {
        let sig = signature();
        let mut history = History::new();
        history.admit(reading(10, 5, 1), Timestamp(5), &sig);
        history.admit(reading(99, 20, 2), Timestamp(20), &sig);
        // Rebuilding at ts=7 must not see the ts=20 reading.
        let entries = history.admit(reading(30, 7, 3), Timestamp(21), &sig).unwrap();
        assert_eq!(entries[0].val, 30);
        assert_eq!(entries[1].val, 10);
    }

    #[test]
    fn drop_between_reading_and_target_shadows() {
        let sig = signature();
        let mut history = History::new();
        history.admit(reading(10, 5, 1), Timestamp(5), &sig);
        history.admit(
            HistoryRecord::Drop(ViewDrop { ts: Timestamp(8), src: NodeAddr(1) }),
            Timestamp(8),
            &sig,
        );
        let entries = history.admit(reading(30, 12, 3), Timestamp(12), &sig).unwrap();
        // Source 1 is shadowed by the tombstone inside (5, 12).
        assert!(!entries.iter().any(|e| e.src == NodeAddr(1)));
        assert_eq!(entries[0].val, 30);
    }

    #[test]
    fn genuine_future_is_rejected() {
        let sig = signature();
        let mut history = History::new();
        assert!(history.admit(reading(1, 500, 1), Timestamp(100), &sig).is_none());
        assert!(history.is_empty());
    }

    #[test]
    fn pre_wrap_timestamp_is_accepted() {
        let sig = signature();
        let mut history = History::new();
        // 65530 is "ahead" of 5 numerically but is an old pre-wrap stamp.
        assert!(history.admit(reading(1, 65530, 1), Timestamp(5), &sig).is_some());
    }

    #[test]
    fn full_buffer_overwrites_oldest() {
        let sig = signature();
        let mut history = History::new();
        for i in 0..HISTORY_SIZE as u16 {
            history.admit(reading(i, 10 + i, 1), Timestamp(10 + i), &sig);
        }
        assert_eq!(history.len(), HISTORY_SIZE);
        let now = Timestamp(10 + HISTORY_SIZE as u16);
        assert!(history.admit(reading(99, now.0, 2), now, &sig).is_some());
        assert_eq!(history.len(), HISTORY_SIZE);
        // The ts=10 record was the oldest and must be gone.
        assert!(!history.records.iter().any(|r| r.ts() == Timestamp(10)));
    }

    #[test]
    fn full_buffer_of_newer_records_rejects_older_arrival() {
        let sig = signature();
        let mut history = History::new();
        for i in 0..HISTORY_SIZE as u16 {
            history.admit(reading(i, 100 + i, 1), Timestamp(100 + i), &sig);
        }
        assert!(history.admit(reading(5, 50, 2), Timestamp(200), &sig).is_none());
    }

    #[test]
    fn wrap_flushes_expired_records() {
        let sig = signature();
        let mut history = History::new();
        history.admit(reading(1, 40000, 1), Timestamp(40000), &sig);
        history.admit(reading(2, 40010, 1), Timestamp(40010), &sig);
        // The clock wrapped to a small value: the old stamps are now outside
        // the overflow window and must be expired before admission.
        history.admit(reading(3, 10, 2), Timestamp(10), &sig);
        assert_eq!(history.len(), 1);
    }
}
