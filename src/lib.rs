pub mod attributes;
pub mod engine;
pub mod eval;
pub mod group;
pub mod history;
pub mod invariant;
pub mod node;
pub mod trickle;
pub mod types;
pub mod view;
pub mod wire;

pub use attributes::{ATTRIBUTE_REFRESH_SECS, AttributeReader, Attributes, Sensor};
pub use engine::{DissemMode, Engine, EngineConfig};
pub use eval::{EvalError, evaluate, evaluate_disjunctions};
pub use group::{CLOCK_TICK_SECS, GroupError, GroupMonitor};
pub use history::{History, HistoryRecord};
pub use invariant::{InvNode, Invariant, InvariantSet, Mapping, MappingEntry, Operator};
pub use node::{Node, NodeConfig};
pub use trickle::{TRICKLE_HIGH, TRICKLE_LOW, TRICKLE_REDUNDANCY, Trickle};
pub use types::*;
pub use view::{Liveness, ViewStore};
pub use wire::{DISSEMINATION_CHANNEL, DissemPacket, DissemPayload, GROUP_CHANNEL, VectorClockPacket};
