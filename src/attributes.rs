//! Locally-owned attributes: periodic resampling and lookup.
//!
//! The sensor itself is external to the engine; it is injected as a sampling
//! closure so tests and deployments can supply real measurements while the
//! demo binary runs on pseudo-random ones.

use crate::types::{ConfigError, MAX_ATTRIBUTES, NodeAddr, Timestamp, ViewEntry};
use tracing::debug;

/// Seconds between refreshes of the node's own readings.
pub const ATTRIBUTE_REFRESH_SECS: u64 = 120;

/// Read access to the node's current attribute values.
/// Used by the T1 local evaluator to resolve attribute references.
pub trait AttributeReader {
    fn get_attribute(&self, hash: u16) -> Option<u16>;
}

/// Sampling function: maps an attribute id to its current raw value.
pub type Sensor = Box<dyn FnMut(u16) -> u16 + Send>;

struct OwnedAttribute {
    hash: u16,
    value: u16,
}

/// Registry of the attributes this node produces.
pub struct Attributes {
    self_addr: NodeAddr,
    owned: Vec<OwnedAttribute>,
    sensor: Sensor,
}

impl Attributes {
    pub fn new(self_addr: NodeAddr, hashes: &[u16], mut sensor: Sensor) -> Result<Self, ConfigError> {
        if hashes.is_empty() {
            return Err(ConfigError::NoAttributes);
        }
        if hashes.len() > MAX_ATTRIBUTES {
            return Err(ConfigError::TooManyAttributes(hashes.len()));
        }
        let owned = hashes
            .iter()
            .map(|&hash| OwnedAttribute { hash, value: sensor(hash) })
            .collect();
        Ok(Self { self_addr, owned, sensor })
    }

    /// Resample every owned attribute and return the fresh readings, stamped
    /// at `now` and sourced at this node.
    pub fn refresh(&mut self, now: Timestamp) -> Vec<ViewEntry> {
        for att in &mut self.owned {
            att.value = (self.sensor)(att.hash);
            debug!(attr = att.hash, value = att.value, "attribute refresh");
        }
        self.current_entries(now)
    }

    /// The current readings without resampling. Used when a merge re-pushes
    /// the node's own values to keep its self-representation current.
    pub fn current_entries(&self, now: Timestamp) -> Vec<ViewEntry> {
        self.owned
            .iter()
            .map(|att| ViewEntry { val: att.value, attr: att.hash, ts: now, src: self.self_addr })
            .collect()
    }
}

impl AttributeReader for Attributes {
    fn get_attribute(&self, hash: u16) -> Option<u16> {
        self.owned.iter().find(|att| att.hash == hash).map(|att| att.value)
    }
}
