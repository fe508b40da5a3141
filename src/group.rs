//! Group liveness monitor: a shared logical clock over a bounded member
//! table, gossiped as compact vector-clock packets on its own channel.
//!
//! ```text
//! Per-peer state machine:
//!
//! ┌────────┐  first packet   ┌───────┐  silence >= threshold  ┌─────────┐
//! │ absent │ ───────────────►│ alive │ ──────────────────────►│ evicted │
//! └────────┘                 └───────┘                        └────┬────┘
//!      ▲                                                          │
//!      └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Eviction is one-shot: a later packet from the same address re-adds the
//! peer as a fresh member.

use crate::types::{MAX_NODES, NodeAddr};
use crate::view::Liveness;
use crate::wire::{VcEntry, VectorClockPacket};
use tracing::{debug, info, warn};

/// Seconds between logical clock ticks.
pub const CLOCK_TICK_SECS: u64 = 1;

/// Default seconds before a never-heard neighbour is announced to the group.
pub const DEFAULT_NEW_NEIGHBOUR_LATENCY_SECS: u32 = 5;

/// Default seconds of silence before a member is evicted.
pub const DEFAULT_MISSING_LATENCY_SECS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("group monitor already running")]
    Busy,
}

#[derive(Debug, Clone, Copy)]
struct GroupMember {
    addr: NodeAddr,
    clock: u32,
}

/// Effects of one monitor step: peers declared dead, and the vector-clock
/// packet to broadcast if the cadence is due.
#[derive(Debug, Default)]
pub struct GroupTick {
    pub evicted: Vec<NodeAddr>,
    pub broadcast: Option<VectorClockPacket>,
}

/// Tracks which peers are currently alive.
///
/// The logical clock starts at the eviction threshold so that a freshly
/// booted node never computes a negative silence for early members. Every
/// tick ages the table; every `broadcast_ticks` ticks the clock is gossiped
/// with one 8-bit offset per known member.
pub struct GroupMonitor {
    self_addr: NodeAddr,
    members: Vec<GroupMember>,
    local_clock: u32,
    evict_threshold: u32,
    broadcast_ticks: u32,
    broadcast_ticks_cnt: u32,
    started: bool,
}

impl GroupMonitor {
    pub fn new(self_addr: NodeAddr) -> Self {
        Self {
            self_addr,
            members: Vec::with_capacity(MAX_NODES),
            local_clock: 0,
            evict_threshold: 0,
            broadcast_ticks: 0,
            broadcast_ticks_cnt: 0,
            started: false,
        }
    }

    /// Start monitoring. Latencies are given in seconds and converted to
    /// clock ticks. Fails with [`GroupError::Busy`] when already running.
    pub fn start(
        &mut self,
        new_neighbour_latency_secs: u32,
        missing_latency_secs: u32,
    ) -> Result<(), GroupError> {
        if self.started {
            return Err(GroupError::Busy);
        }
        self.evict_threshold = missing_latency_secs / CLOCK_TICK_SECS as u32;
        self.broadcast_ticks = new_neighbour_latency_secs / CLOCK_TICK_SECS as u32;
        self.broadcast_ticks_cnt = 0;
        self.local_clock = self.evict_threshold;
        self.members.clear();
        self.started = true;
        Ok(())
    }

    /// Stop the monitor; packets and ticks are ignored until restarted.
    pub fn stop(&mut self) {
        self.started = false;
    }

    /// Forget every member and rewind the clock to its start value.
    pub fn reset(&mut self) {
        self.local_clock = self.evict_threshold;
        self.members.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn update_member(&mut self, addr: NodeAddr, clock: u32) {
        for m in &mut self.members {
            if m.addr != addr {
                continue;
            }
            if m.clock >= clock {
                return;
            }
            m.clock = clock;
            debug!(member = %addr, clock, "vc update member");
            return;
        }

        if self.members.len() == MAX_NODES {
            warn!(member = %addr, "group table full, peer dropped");
            return;
        }
        self.members.push(GroupMember { addr, clock });
        info!(member = %addr, clock, "vc new member");
    }

    /// Scan for members whose silence reached the threshold. The age is
    /// computed in signed arithmetic: a member whose clock runs ahead of
    /// ours (by the +1 broadcast slack) must never be evicted by underflow.
    fn check_all_expired(&mut self) -> Vec<NodeAddr> {
        let mut evicted = Vec::new();
        let local_clock = self.local_clock;
        let threshold = i64::from(self.evict_threshold);
        self.members.retain(|m| {
            let age = i64::from(local_clock) + 1 - i64::from(m.clock);
            if age < threshold {
                return true;
            }
            debug!(member = %m.addr, age, "vc dead member");
            evicted.push(m.addr);
            false
        });
        evicted
    }

    /// Advance the logical clock by one tick (1 s cadence).
    pub fn tick(&mut self) -> GroupTick {
        if !self.started {
            return GroupTick::default();
        }
        self.local_clock += 1;
        self.broadcast_ticks_cnt += 1;
        let evicted = self.check_all_expired();

        let mut broadcast = None;
        if self.broadcast_ticks_cnt >= self.broadcast_ticks {
            self.broadcast_ticks_cnt = 0;
            broadcast = Some(self.vector_clock());
        }
        GroupTick { evicted, broadcast }
    }

    /// Build the vector-clock packet: our clock plus one truncated offset
    /// per member. Offsets assume our clock dominates; a member ahead of us
    /// wraps through the 8-bit truncation exactly like everyone else's.
    fn vector_clock(&self) -> VectorClockPacket {
        let entries = self
            .members
            .iter()
            .map(|m| VcEntry {
                addr: m.addr,
                offset: (self.local_clock.wrapping_add(1).wrapping_sub(m.clock)) as u8,
            })
            .collect();
        VectorClockPacket::new(self.local_clock, entries)
    }

    /// Merge a received vector clock. The sender's clock is adopted when it
    /// outruns ours; every carried entry re-derives the member's clock from
    /// the sender's offset. Any adopted clock triggers a fresh expiry scan.
    pub fn on_packet(&mut self, src: NodeAddr, pkt: &VectorClockPacket) -> Vec<NodeAddr> {
        if !self.started {
            return Vec::new();
        }
        debug!(from = %src, clock = pkt.clock, "vc receive");

        let mut need_check = false;
        if pkt.clock > self.local_clock + 1 {
            need_check = true;
            self.local_clock = pkt.clock;
            debug!(clock = self.local_clock, "vc clock sync");
        }

        self.update_member(src, pkt.clock);

        for e in pkt.entries.iter() {
            if e.addr == self.self_addr {
                continue;
            }
            let remote_clock = pkt.clock.wrapping_add(1).wrapping_sub(u32::from(e.offset));
            self.update_member(e.addr, remote_clock);
            if remote_clock <= self.local_clock + 1 {
                continue;
            }
            need_check = true;
            self.local_clock = remote_clock;
        }

        if need_check { self.check_all_expired() } else { Vec::new() }
    }

    /// Fast-register a peer at our local clock. Used when the disseminator
    /// hears a packet from a source the monitor does not know yet.
    pub fn force_update(&mut self, addr: NodeAddr) {
        let clock = self.local_clock;
        self.update_member(addr, clock);
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

impl Liveness for GroupMonitor {
    fn is_alive(&self, addr: NodeAddr) -> bool {
        addr == self.self_addr || self.members.iter().any(|m| m.addr == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_monitor() -> GroupMonitor {
        let mut mon = GroupMonitor::new(NodeAddr(1));
        mon.start(5, 30).unwrap();
        mon
    }

    #[test]
    fn double_start_is_busy() {
        let mut mon = started_monitor();
        assert!(matches!(mon.start(5, 30), Err(GroupError::Busy)));
        mon.stop();
        assert!(mon.start(5, 30).is_ok());
    }

    #[test]
    fn self_is_always_alive() {
        let mon = started_monitor();
        assert!(mon.is_alive(NodeAddr(1)));
        assert!(!mon.is_alive(NodeAddr(2)));
    }

    #[test]
    fn member_registration_and_silence_eviction() {
        let mut mon = started_monitor();
        mon.force_update(NodeAddr(2));
        assert!(mon.is_alive(NodeAddr(2)));

        // Silent for the full missing latency: evicted exactly once, in the
        // first tick where age reaches the threshold.
        let mut evictions = Vec::new();
        for tick in 0..40 {
            let out = mon.tick();
            for addr in out.evicted {
                evictions.push((tick, addr));
            }
        }
        assert_eq!(evictions.len(), 1);
        assert_eq!(evictions[0].1, NodeAddr(2));
        // Registered at age 1 (local+1 - clock); after t+1 silent ticks the
        // age is t+2, so the threshold of 30 is reached at tick 28.
        assert_eq!(evictions[0].0, 28);
        assert!(!mon.is_alive(NodeAddr(2)));
    }

    #[test]
    fn packet_refreshes_member() {
        let mut mon = started_monitor();
        mon.force_update(NodeAddr(2));
        for _ in 0..20 {
            mon.tick();
        }
        // A fresh packet from the peer resets its silence.
        let pkt = VectorClockPacket::new(mon.local_clock, vec![]);
        assert!(mon.on_packet(NodeAddr(2), &pkt).is_empty());
        for _ in 0..25 {
            assert!(mon.tick().evicted.is_empty());
        }
        assert!(mon.is_alive(NodeAddr(2)));
    }

    #[test]
    fn adopting_remote_clock_triggers_expiry() {
        let mut mon = started_monitor();
        mon.force_update(NodeAddr(2));
        // A sender far ahead of us ages every member at once.
        let pkt = VectorClockPacket::new(mon.local_clock + 100, vec![]);
        let evicted = mon.on_packet(NodeAddr(3), &pkt);
        assert_eq!(evicted, vec![NodeAddr(2)]);
        // The sender itself was just heard at the new clock: still alive.
        assert!(mon.is_alive(NodeAddr(3)));
        assert_eq!(mon.local_clock, pkt.clock);
    }

    #[test]
    fn carried_entries_register_third_parties() {
        let mut mon = started_monitor();
        let pkt = VectorClockPacket::new(
            mon.local_clock,
            vec![
                VcEntry { addr: NodeAddr(3), offset: 2 },
                // Our own address in a peer's vector must be skipped.
                VcEntry { addr: NodeAddr(1), offset: 200 },
            ],
        );
        mon.on_packet(NodeAddr(2), &pkt);
        assert!(mon.is_alive(NodeAddr(2)));
        assert!(mon.is_alive(NodeAddr(3)));
        assert_eq!(mon.member_count(), 2);
    }

    #[test]
    fn full_table_drops_new_peers() {
        let mut mon = started_monitor();
        for i in 0..MAX_NODES as u16 {
            mon.force_update(NodeAddr(100 + i));
        }
        assert_eq!(mon.member_count(), MAX_NODES);
        mon.force_update(NodeAddr(999));
        assert_eq!(mon.member_count(), MAX_NODES);
        assert!(!mon.is_alive(NodeAddr(999)));
    }

    #[test]
    fn broadcast_cadence() {
        let mut mon = started_monitor();
        let mut broadcasts = 0;
        for _ in 0..10 {
            if mon.tick().broadcast.is_some() {
                broadcasts += 1;
            }
        }
        // new-neighbour latency 5 s at a 1 s tick: every fifth tick.
        assert_eq!(broadcasts, 2);
    }

    #[test]
    fn stopped_monitor_ignores_everything() {
        let mut mon = started_monitor();
        mon.stop();
        assert!(mon.tick().evicted.is_empty());
        let pkt = VectorClockPacket::new(1000, vec![]);
        assert!(mon.on_packet(NodeAddr(2), &pkt).is_empty());
        assert!(!mon.is_alive(NodeAddr(2)));
    }
}
