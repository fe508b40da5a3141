//! Core data model: node addresses, wrap-aware timestamps, views and slices.
//!
//! # Design Goals
//!
//! 1. **Static bounds everywhere.** Every structure that crosses the radio or
//!    lives for the process lifetime has a compile-time capacity. A peer
//!    cannot grow our memory by sending packets.
//!
//! 2. **One timestamp arithmetic.** The 16-bit node clock wraps every 512 s.
//!    All ordering decisions go through [`Timestamp`]; no caller compares raw
//!    tick values (the plain `>` comparisons in pruning are the documented
//!    exception, used precisely to catch wrap anomalies).
//!
//! 3. **Loggable state.** Views, entries and drops render in the compact
//!    `<v@a.b(ts),..>[D@a.b(ts),..]` form so protocol traces stay greppable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// =============================================================================
// CAPACITY BOUNDS
// =============================================================================

/// Entry slots in a local view (K). The view is a concatenation of signature
/// slices; the sum of slice sizes must not exceed this.
pub const LV_ENTRIES: usize = 4;

/// Drop (tombstone) slots in a local view (D).
pub const LV_DROPS: usize = 5;

/// Conjunction descriptors in a T1 view. One per installed disjunct.
pub const LV_CONJS: usize = 3;

/// Maximum slices a view signature may describe.
pub const SIGNATURE_ENTRIES: usize = 5;

/// Quantifier positions per conjunction (Q).
pub const MAX_QUANTIFIERS: usize = 5;

/// Distinct attributes an invariant may reference.
pub const MAX_ATTRIBUTES: usize = 5;

/// Postfix nodes per invariant expression.
pub const MAX_INV_NODES: usize = 15;

/// Evaluation stack depth. A well-formed invariant of MAX_INV_NODES nodes
/// can never stack more than MAX_INV_NODES operands; 20 leaves headroom.
pub const MAX_STACK_SIZE: usize = 20;

/// Peers tracked by the group monitor. A full table drops new peers (logged).
pub const MAX_NODES: usize = 25;

/// Records in the history ring: a few rounds of K readings plus D drops.
pub const HISTORY_SIZE: usize = 16;

// =============================================================================
// CLOCK PARAMETERS
// =============================================================================

/// Node clock resolution: one timestamp tick is 1/128 s, so the 16-bit
/// timestamp wraps every 512 s.
pub const TICKS_PER_SEC: u64 = 128;

/// Inter-node clock skew tolerance, in ticks (about 23 ms).
/// Timestamps closer than this are indistinguishable.
pub const SYNCH_ACCURACY: u16 = 3;

/// Half-window for wrap disambiguation: a difference below this is a genuine
/// "later", a difference above `TS_MAX - SYNCH_OVERFLOW` is a wrap.
pub const SYNCH_OVERFLOW: u16 = 20000;

/// Largest raw timestamp value.
pub const TS_MAX: u16 = 0xffff;

// =============================================================================
// NODE ADDRESS
// =============================================================================

/// Opaque two-byte node identifier with value equality.
///
/// Rendered `hi.lo` in logs, matching the on-air byte order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeAddr(pub u16);

impl NodeAddr {
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(raw: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(raw))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 >> 8, self.0 & 0xff)
    }
}

// =============================================================================
// TIMESTAMP
// =============================================================================

/// Bounded monotonic timestamp with overflow-aware ordering.
///
/// The raw value 0 is the *empty slot* sentinel: no live reading ever carries
/// it, and [`Timestamp::from_ticks`] skips it on wrap.
///
/// Ordering is decided inside a half-window of [`SYNCH_OVERFLOW`] ticks:
/// `b.after(a)` holds iff `b` is ahead of `a` by less than the window, or `a`
/// is ahead of `b` by more than `TS_MAX - SYNCH_OVERFLOW` (a wrap).
/// [`Timestamp::after_synch`] additionally requires the gap to exceed
/// [`SYNCH_ACCURACY`], tolerating inter-node skew: equality under slack means
/// "indistinguishable".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(pub u16);

impl Timestamp {
    pub const EMPTY: Timestamp = Timestamp(0);

    /// True for the empty-slot sentinel.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Wrap a monotonic tick counter into the 16-bit timestamp domain,
    /// skipping the empty sentinel.
    pub fn from_ticks(ticks: u64) -> Self {
        let raw = (ticks & 0xffff) as u16;
        if raw == 0 { Timestamp(1) } else { Timestamp(raw) }
    }

    /// `self` is strictly newer than `reference` under the wrap window.
    pub fn after(self, reference: Timestamp) -> bool {
        let (c, r) = (u32::from(self.0), u32::from(reference.0));
        let (ovfl, max) = (u32::from(SYNCH_OVERFLOW), u32::from(TS_MAX));
        (c > r && c - r < ovfl) || (r > c && r - c > max - ovfl)
    }

    /// `self` is newer than or indistinguishable from `reference`.
    pub fn after_eq(self, reference: Timestamp) -> bool {
        let (c, r) = (u32::from(self.0), u32::from(reference.0));
        let (ovfl, max) = (u32::from(SYNCH_OVERFLOW), u32::from(TS_MAX));
        (c >= r && c - r < ovfl) || (r > c && r - c > max - ovfl)
    }

    /// `self` is *meaningfully* newer than `reference`: ahead by more than
    /// the clock-synchronisation slack, or across a wrap.
    pub fn after_synch(self, reference: Timestamp) -> bool {
        let (c, r) = (u32::from(self.0), u32::from(reference.0));
        let acc = u32::from(SYNCH_ACCURACY);
        let (ovfl, max) = (u32::from(SYNCH_OVERFLOW), u32::from(TS_MAX));
        (c > r + acc && c - r < acc + ovfl) || (r > c && r - c > max - ovfl)
    }

    /// Shift forward by `delta`, clamping to `now`: rebasing a remote
    /// timestamp must never create a future.
    pub fn shift_forward(self, delta: u16, now: Timestamp) -> Timestamp {
        let shifted = u32::from(self.0) + u32::from(delta);
        Timestamp(shifted.min(u32::from(now.0)) as u16)
    }

    /// Shift backward by `delta`, saturating above the empty sentinel.
    pub fn shift_back(self, delta: u16) -> Timestamp {
        if self.0 > delta {
            Timestamp(self.0 - delta)
        } else {
            Timestamp(1)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic node clock: a tick counter since process start.
///
/// The full counter drives timer scheduling; the wrapped 16-bit projection
/// stamps readings and packets.
#[derive(Debug, Clone)]
pub struct NodeClock {
    origin: Instant,
}

impl NodeClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn ticks(&self) -> u64 {
        let elapsed = self.origin.elapsed();
        elapsed.as_secs() * TICKS_PER_SEC
            + u64::from(elapsed.subsec_nanos()) * TICKS_PER_SEC / 1_000_000_000
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_ticks(self.ticks())
    }
}

// =============================================================================
// VIEW STRUCTURES
// =============================================================================

/// One observed reading: a scalar attribute value at a source node.
/// `ts == 0` denotes an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewEntry {
    pub val: u16,
    pub attr: u16,
    pub ts: Timestamp,
    pub src: NodeAddr,
}

impl ViewEntry {
    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }
}

impl fmt::Display for ViewEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}@{}({})", self.val, self.src, self.ts)
        }
    }
}

/// Drop tombstone: readings from `src` at or before `ts` are obsolete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewDrop {
    pub ts: Timestamp,
    pub src: NodeAddr,
}

impl ViewDrop {
    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// True when this tombstone makes `entry` obsolete.
    pub fn shadows(&self, entry: &ViewEntry) -> bool {
        self.src == entry.src && self.ts.after_eq(entry.ts)
    }
}

impl fmt::Display for ViewDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "D@{}({})", self.src, self.ts)
        }
    }
}

/// The plain local view: sliced entry slots plus the drop table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct View {
    pub entries: [ViewEntry; LV_ENTRIES],
    pub drops: [ViewDrop; LV_DROPS],
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, ">[")?;
        for (i, d) in self.drops.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// One conjunction descriptor of the T1 (disjunctive) view.
///
/// `flagged[q]` records that node `src[q]` observed its local conjunct
/// violated for quantifier position `q` at `ts[q]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewConj {
    pub flagged: [bool; MAX_QUANTIFIERS],
    pub src: [NodeAddr; MAX_QUANTIFIERS],
    pub ts: [Timestamp; MAX_QUANTIFIERS],
}

impl fmt::Display for ViewConj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for q in 0..MAX_QUANTIFIERS {
            if self.ts[q].is_empty() {
                write!(f, "[-]")?;
            } else {
                write!(f, "[{}({})]", self.src[q], self.ts[q])?;
            }
        }
        Ok(())
    }
}

/// The T1 local view: one conjunction descriptor per disjunct plus drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewT1 {
    pub conjs: [ViewConj; LV_CONJS],
    pub drops: [ViewDrop; LV_DROPS],
}

impl fmt::Display for ViewT1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for (i, c) in self.conjs.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ">[")?;
        for (i, d) in self.drops.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

// =============================================================================
// VIEW SIGNATURE
// =============================================================================

/// Ranking objective of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    Maximize,
    Minimize,
}

impl Objective {
    /// True when `candidate` is strictly worse than `occupant` under this
    /// objective. Ties are not worse: an equal value ranks ahead of the
    /// occupant it ties with.
    pub fn worse(self, candidate: u16, occupant: u16) -> bool {
        match self {
            Objective::Maximize => candidate < occupant,
            Objective::Minimize => candidate > occupant,
        }
    }
}

/// One slice descriptor: which attribute it collects, how entries rank,
/// how many slots it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureEntry {
    pub attr: u16,
    pub objective: Objective,
    pub slice_size: usize,
}

/// Static description of the view layout: a concatenation of slices.
///
/// Built once at startup; the group must share it for merges to make sense.
#[derive(Debug, Clone)]
pub struct ViewSignature {
    entries: Vec<SignatureEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("signature describes {0} slices, at most {SIGNATURE_ENTRIES} supported")]
    TooManySlices(usize),
    #[error("signature slices cover {0} slots, view holds {LV_ENTRIES}")]
    SlicesExceedView(usize),
    #[error("signature slice has zero size")]
    EmptySlice,
    #[error("{0} disjunctions installed, at most {LV_CONJS} supported")]
    TooManyDisjunctions(usize),
    #[error("invariant holds {0} nodes, at most {MAX_INV_NODES} supported")]
    InvariantTooLarge(usize),
    #[error("no attributes owned by this node")]
    NoAttributes,
    #[error("{0} attributes owned, at most {MAX_ATTRIBUTES} supported")]
    TooManyAttributes(usize),
}

impl ViewSignature {
    pub fn new(entries: Vec<SignatureEntry>) -> Result<Self, ConfigError> {
        if entries.len() > SIGNATURE_ENTRIES {
            return Err(ConfigError::TooManySlices(entries.len()));
        }
        if entries.iter().any(|e| e.slice_size == 0) {
            return Err(ConfigError::EmptySlice);
        }
        let total: usize = entries.iter().map(|e| e.slice_size).sum();
        if total > LV_ENTRIES {
            return Err(ConfigError::SlicesExceedView(total));
        }
        Ok(Self { entries })
    }

    /// Iterate slices as `(start_slot, end_slot, descriptor)`.
    pub fn slices(&self) -> impl Iterator<Item = (usize, usize, &SignatureEntry)> {
        let mut start = 0;
        self.entries.iter().map(move |e| {
            let range = (start, start + e.slice_size, e);
            start += e.slice_size;
            range
        })
    }

    /// End slot (exclusive) of the slice containing `idx`.
    pub fn slice_end_of(&self, idx: usize) -> Option<usize> {
        self.slices()
            .find(|&(start, end, _)| start <= idx && idx < end)
            .map(|(_, end, _)| end)
    }
}
