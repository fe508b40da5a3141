//! Wire formats and safe deserialization with bounded collections.
//!
//! Both protocol channels share one radio; a one-byte channel id in the
//! frame keeps them logically distinct:
//!
//! | Channel | Payload | Contents |
//! |---------|---------|----------|
//! | 129     | [`DissemPacket`] | source, timestamp, one view form |
//! | 130     | [`VectorClockPacket`] | logical clock + per-member offsets |
//!
//! Everything is postcard-encoded. Collection limits are enforced *during*
//! deserialization, so an oversized packet fails before it allocates.

use crate::types::{MAX_NODES, NodeAddr, Timestamp, View, ViewT1};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::marker::PhantomData;

/// Trickle dissemination channel.
pub const DISSEMINATION_CHANNEL: u8 = 129;

/// Group monitor channel.
pub const GROUP_CHANNEL: u8 = 130;

/// Ceiling for a whole radio frame payload. The largest legitimate packet
/// (a T1 view) stays well under this.
pub const MAX_FRAME_BYTES: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(postcard::Error),
    #[error("decode failed: {0}")]
    Decode(postcard::Error),
    #[error("frame payload exceeds {MAX_FRAME_BYTES} bytes")]
    Oversized,
}

// =============================================================================
// BOUNDED COLLECTIONS
// =============================================================================

/// Vector that refuses to deserialize past `N` elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(pub Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new(v: Vec<T>) -> Option<Self> {
        if v.len() <= N { Some(Self(v)) } else { None }
    }

    /// Internal use only; caller must ensure len <= N.
    #[inline]
    pub fn new_unchecked(v: Vec<T>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedVecVisitor<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for BoundedVecVisitor<T, N> {
            type Value = BoundedVec<T, N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a sequence with at most {} elements", N)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > N {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }
                let mut vec = Vec::with_capacity(size_hint.min(N));
                while let Some(elem) = seq.next_element()? {
                    if vec.len() >= N {
                        return Err(de::Error::invalid_length(vec.len() + 1, &self));
                    }
                    vec.push(elem);
                }
                Ok(BoundedVec(vec))
            }
        }

        deserializer.deserialize_seq(BoundedVecVisitor(PhantomData))
    }
}

/// Byte buffer that refuses to deserialize past `N` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundedBytes<const N: usize>(pub Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub fn new(v: Vec<u8>) -> Option<Self> {
        if v.len() <= N { Some(Self(v)) } else { None }
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedBytesVisitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for BoundedBytesVisitor<N> {
            type Value = BoundedBytes<N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a byte sequence with at most {} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                if v.len() > N {
                    return Err(de::Error::invalid_length(v.len(), &self));
                }
                Ok(BoundedBytes(v.to_vec()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > N {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }
                let mut vec = Vec::with_capacity(size_hint.min(N));
                while let Some(byte) = seq.next_element()? {
                    if vec.len() >= N {
                        return Err(de::Error::invalid_length(vec.len() + 1, &self));
                    }
                    vec.push(byte);
                }
                Ok(BoundedBytes(vec))
            }
        }

        deserializer.deserialize_bytes(BoundedBytesVisitor)
    }
}

// =============================================================================
// PACKETS
// =============================================================================

/// The view form carried by a dissemination packet.
/// Wire tag 0 is the T1 (disjunctive) view, tag 1 the plain view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DissemPayload {
    Disjunctions(ViewT1),
    Readings(View),
}

impl DissemPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            DissemPayload::Disjunctions(_) => "t1",
            DissemPayload::Readings(_) => "view",
        }
    }
}

/// Trickle dissemination packet: the sender's view stamped with the
/// sender's clock, so the receiver can rebase every inner timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissemPacket {
    pub src: NodeAddr,
    pub timestamp: Timestamp,
    pub payload: DissemPayload,
}

/// One member entry of a vector-clock packet: the member's address and its
/// clock lag behind the sender, truncated to 8 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcEntry {
    pub addr: NodeAddr,
    pub offset: u8,
}

/// Group monitor packet: the sender's logical clock plus its member table.
/// The entry count is implicit in the encoding and bounded by [`MAX_NODES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClockPacket {
    pub clock: u32,
    pub entries: BoundedVec<VcEntry, MAX_NODES>,
}

impl VectorClockPacket {
    /// Build from locally tracked members (bounded by the group table).
    pub fn new(clock: u32, entries: Vec<VcEntry>) -> Self {
        Self { clock, entries: BoundedVec::new_unchecked(entries) }
    }
}

/// Radio frame: channel id, sender, opaque packet bytes. The sender field
/// stands in for the link-layer source address of the broadcast primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioFrame {
    pub channel: u8,
    pub src: NodeAddr,
    pub payload: BoundedBytes<MAX_FRAME_BYTES>,
}

impl RadioFrame {
    pub fn new(channel: u8, src: NodeAddr, payload: Vec<u8>) -> Result<Self, WireError> {
        let payload = BoundedBytes::new(payload).ok_or(WireError::Oversized)?;
        Ok(Self { channel, src, payload })
    }
}

/// Serialize with postcard.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    postcard::to_allocvec(value).map_err(WireError::Encode)
}

/// Deserialize with postcard; bounded collections validate during decode.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, WireError> {
    postcard::from_bytes(data).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ViewDrop, ViewEntry};

    #[test]
    fn dissem_packet_roundtrip() {
        let mut view = View::default();
        view.entries[0] =
            ViewEntry { val: 50, attr: 1, ts: Timestamp(10), src: NodeAddr(3) };
        view.drops[0] = ViewDrop { ts: Timestamp(8), src: NodeAddr(4) };
        let pkt = DissemPacket {
            src: NodeAddr(3),
            timestamp: Timestamp(12),
            payload: DissemPayload::Readings(view),
        };
        let bytes = to_bytes(&pkt).unwrap();
        let back: DissemPacket = from_bytes(&bytes).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn t1_packet_roundtrip() {
        let mut t1 = ViewT1::default();
        t1.conjs[0].flagged[2] = true;
        t1.conjs[0].src[2] = NodeAddr(9);
        t1.conjs[0].ts[2] = Timestamp(77);
        let pkt = DissemPacket {
            src: NodeAddr(9),
            timestamp: Timestamp(80),
            payload: DissemPayload::Disjunctions(t1),
        };
        let bytes = to_bytes(&pkt).unwrap();
        let back: DissemPacket = from_bytes(&bytes).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn vector_clock_roundtrip() {
        let pkt = VectorClockPacket::new(
            1234,
            vec![VcEntry { addr: NodeAddr(2), offset: 3 }],
        );
        let bytes = to_bytes(&pkt).unwrap();
        let back: VectorClockPacket = from_bytes(&bytes).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn vector_clock_entry_bound_enforced_on_decode() {
        let entries: Vec<VcEntry> =
            (0..MAX_NODES as u16 + 1).map(|i| VcEntry { addr: NodeAddr(i), offset: 0 }).collect();
        // Serialize through an unbounded vec to forge an oversized packet.
        #[derive(Serialize)]
        struct Forged {
            clock: u32,
            entries: Vec<VcEntry>,
        }
        let bytes = to_bytes(&Forged { clock: 1, entries }).unwrap();
        assert!(from_bytes::<VectorClockPacket>(&bytes).is_err());
    }

    #[test]
    fn frame_size_limit() {
        assert!(RadioFrame::new(DISSEMINATION_CHANNEL, NodeAddr(1), vec![0; 64]).is_ok());
        assert!(matches!(
            RadioFrame::new(DISSEMINATION_CHANNEL, NodeAddr(1), vec![0; MAX_FRAME_BYTES + 1]),
            Err(WireError::Oversized)
        ));
    }

    #[test]
    fn dissem_packet_fits_frame_limit() {
        // Worst case payloads must stay under MAX_FRAME_BYTES.
        let full_view = View {
            entries: [ViewEntry {
                val: u16::MAX,
                attr: u16::MAX,
                ts: Timestamp(u16::MAX),
                src: NodeAddr(u16::MAX),
            }; crate::types::LV_ENTRIES],
            drops: [ViewDrop { ts: Timestamp(u16::MAX), src: NodeAddr(u16::MAX) };
                crate::types::LV_DROPS],
        };
        let pkt = DissemPacket {
            src: NodeAddr(u16::MAX),
            timestamp: Timestamp(u16::MAX),
            payload: DissemPayload::Readings(full_view),
        };
        assert!(to_bytes(&pkt).unwrap().len() <= MAX_FRAME_BYTES);
    }
}
