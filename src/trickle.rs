//! Trickle-style controlled-redundancy dissemination.
//!
//! ```text
//! Per-interval state machine:
//!
//! ┌───────────┐   fire, r < REDUNDANCY    ┌─────────────┐
//! │ scheduled │ ─────────────────────────►│ transmitted │
//! └─────┬─────┘                           └──────┬──────┘
//!       │ fire, r >= REDUNDANCY                  │
//!       ▼                                        │ interval end,
//! ┌────────────┐                                 │ tau doubled
//! │ suppressed │ ────────────────────────────────┤
//! └────────────┘                                 ▼
//!                                          ┌───────────┐
//!                                          │ scheduled │
//!                                          └───────────┘
//! ```
//!
//! Consistent receptions increment the redundancy counter; new information
//! resets the interval to its minimum. The state machine owns no timer:
//! it exposes the next deadline in absolute ticks and the runtime arms it.

use crate::types::{TICKS_PER_SEC, Timestamp};
use crate::wire::{DissemPacket, DissemPayload};
use rand::Rng;
use tracing::debug;

/// Minimum dissemination interval, in clock ticks.
pub const TRICKLE_LOW: u64 = TICKS_PER_SEC / 5;

/// Maximum dissemination interval, in clock ticks.
pub const TRICKLE_HIGH: u64 = TICKS_PER_SEC * 4;

/// Consistent receptions per interval that suppress our own transmission.
pub const TRICKLE_REDUNDANCY: u32 = 5;

/// What a timer fire decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Broadcast the local view now.
    Transmit,
    /// Enough peers already said the same thing; stay quiet.
    Suppress,
}

/// Trickle timer state. All deadlines are absolute node-clock ticks.
pub struct Trickle {
    tau: u64,
    redundant_cnt: u32,
    last_bcast: Timestamp,
    next_fire: Option<u64>,
    initialized: bool,
}

impl Default for Trickle {
    fn default() -> Self {
        Self::new()
    }
}

impl Trickle {
    pub fn new() -> Self {
        Self {
            tau: TRICKLE_LOW,
            redundant_cnt: 0,
            last_bcast: Timestamp::EMPTY,
            next_fire: None,
            initialized: false,
        }
    }

    /// Arm the first interval.
    pub fn init(&mut self, now_ticks: u64, rng: &mut impl Rng) {
        self.reset(now_ticks, rng);
        self.initialized = true;
    }

    /// New information: shrink the interval to its minimum and reschedule.
    /// Idempotent against an already-pending earlier deadline, so a burst of
    /// resets does not push the broadcast further out.
    pub fn reset(&mut self, now_ticks: u64, rng: &mut impl Rng) {
        self.redundant_cnt = 0;
        self.tau = TRICKLE_LOW;
        let t = self.tau / 2 + rng.gen_range(0..self.tau / 2);
        if self.initialized {
            if let Some(fire) = self.next_fire {
                if fire < now_ticks + t {
                    return;
                }
            }
        }
        self.next_fire = Some(now_ticks + t);
    }

    /// The node clock wrapped since our last broadcast.
    pub fn wrapped(&self, now: Timestamp) -> bool {
        now.0 < self.last_bcast.0
    }

    /// Wrap recovery at fire time: restart from the minimum interval.
    pub fn force_reset(&mut self, now_ticks: u64, rng: &mut impl Rng) {
        debug!("prune force reset");
        self.redundant_cnt = 0;
        self.tau = TRICKLE_LOW;
        let t = self.tau / 2 + rng.gen_range(0..self.tau / 2);
        self.next_fire = Some(now_ticks + t);
    }

    /// Regular fire: double the interval (capped), schedule the next fire,
    /// and decide between transmitting and suppressing.
    pub fn advance(&mut self, now_ticks: u64, rng: &mut impl Rng) -> FireOutcome {
        self.last_bcast = Timestamp::from_ticks(now_ticks);
        self.tau = (self.tau * 2).min(TRICKLE_HIGH);
        let t = self.tau / 2 + rng.gen_range(0..self.tau / 2);
        self.next_fire = Some(now_ticks + t);

        if self.redundant_cnt >= TRICKLE_REDUNDANCY {
            debug!("skip redundancy");
            self.redundant_cnt = 0;
            return FireOutcome::Suppress;
        }
        FireOutcome::Transmit
    }

    /// A reception merged without new information.
    pub fn note_redundant(&mut self) {
        self.redundant_cnt += 1;
    }

    /// Next deadline in absolute ticks, if armed.
    pub fn next_fire(&self) -> Option<u64> {
        self.next_fire
    }

    pub fn tau(&self) -> u64 {
        self.tau
    }

    pub fn redundant_cnt(&self) -> u32 {
        self.redundant_cnt
    }
}

/// Rebase every timestamp inside a received packet onto the local clock.
///
/// The shift is the overflow-aware distance between our clock and the
/// sender's stamp. Shifting forward clamps to "now" so rebasing never
/// fabricates futures; shifting backward saturates above the empty sentinel.
pub fn rebase_packet(pkt: &mut DissemPacket, now: Timestamp) {
    let forward = now.0 > pkt.timestamp.0;
    let delta =
        if forward { now.0 - pkt.timestamp.0 } else { pkt.timestamp.0 - now.0 };

    let mut shift = |ts: &mut Timestamp| {
        if ts.is_empty() {
            return;
        }
        *ts = if forward { ts.shift_forward(delta, now) } else { ts.shift_back(delta) };
    };

    match &mut pkt.payload {
        DissemPayload::Readings(view) => {
            for e in view.entries.iter_mut() {
                shift(&mut e.ts);
            }
            for d in view.drops.iter_mut() {
                shift(&mut d.ts);
            }
        }
        DissemPayload::Disjunctions(t1) => {
            for conj in t1.conjs.iter_mut() {
                for ts in conj.ts.iter_mut() {
                    shift(ts);
                }
            }
            for d in t1.drops.iter_mut() {
                shift(&mut d.ts);
            }
        }
    }
}
