//! Async runtime glue: drives the engine from a tokio event loop and
//! emulates the group-addressed wireless broadcast over UDP multicast.
//!
//! The engine itself is synchronous; this loop serialises timer callbacks
//! and inbound packets exactly as the cooperative scheduler of the target
//! platform would. One multicast socket carries both logical channels,
//! distinguished by the frame's channel id.

use crate::attributes::ATTRIBUTE_REFRESH_SECS;
use crate::engine::Engine;
use crate::group::CLOCK_TICK_SECS;
use crate::types::{NodeClock, TICKS_PER_SEC};
use crate::wire::{
    self, DISSEMINATION_CHANNEL, DissemPacket, GROUP_CHANNEL, RadioFrame, VectorClockPacket,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{Instant as TokioInstant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

/// Multicast group standing in for the shared radio medium.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 66, 77, 1);

/// Default UDP port for the emulated radio.
pub const DEFAULT_PORT: u16 = 17129;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub multicast_addr: Ipv4Addr,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT, multicast_addr: DEFAULT_MULTICAST_ADDR }
    }
}

enum Event {
    GroupTick,
    AttributeRefresh,
    TrickleFire,
    Frame(usize),
}

pub struct Node {
    engine: Engine,
    socket: UdpSocket,
    target: SocketAddrV4,
    clock: NodeClock,
}

impl Node {
    /// Bind the radio socket. SO_REUSEADDR plus multicast loop lets several
    /// nodes share one host, which is how the protocol is exercised locally.
    pub fn bind(engine: Engine, cfg: &NodeConfig) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port).into())?;
        socket.join_multicast_v4(&cfg.multicast_addr, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            engine,
            socket,
            target: SocketAddrV4::new(cfg.multicast_addr, cfg.port),
            clock: NodeClock::start(),
        })
    }

    async fn broadcast(&self, channel: u8, payload: Vec<u8>) {
        let frame = match RadioFrame::new(channel, self.engine.self_addr(), payload) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, channel, "frame not sent");
                return;
            }
        };
        let bytes = match wire::to_bytes(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, channel, "frame encode failed");
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&bytes, self.target).await {
            // The medium is lossy by contract; a send failure is not fatal.
            debug!(%err, "broadcast failed");
        }
    }

    fn deadline_instant(&self, ticks: u64) -> TokioInstant {
        let now = self.clock.ticks();
        let delta_ms = ticks.saturating_sub(now) * 1000 / TICKS_PER_SEC;
        TokioInstant::now() + Duration::from_millis(delta_ms)
    }

    async fn sleep_opt(deadline: Option<TokioInstant>) {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        let frame: RadioFrame = match wire::from_bytes(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "frame dropped");
                return;
            }
        };
        if frame.src == self.engine.self_addr() {
            return;
        }
        match frame.channel {
            DISSEMINATION_CHANNEL => match wire::from_bytes::<DissemPacket>(&frame.payload) {
                Ok(pkt) => self.engine.on_dissemination(pkt, self.clock.ticks()),
                Err(err) => debug!(%err, "dissemination packet dropped"),
            },
            GROUP_CHANNEL => match wire::from_bytes::<VectorClockPacket>(&frame.payload) {
                Ok(pkt) => self.engine.on_group_packet(frame.src, &pkt, self.clock.ticks()),
                Err(err) => debug!(%err, "vector clock packet dropped"),
            },
            other => debug!(channel = other, "unknown channel"),
        }
    }

    pub async fn run(mut self) -> std::io::Result<()> {
        self.engine
            .start(self.clock.ticks())
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        info!(addr = %self.engine.self_addr(), target = %self.target, "radio up");

        let start = TokioInstant::now();
        let mut group_tick =
            interval_at(start + Duration::from_secs(CLOCK_TICK_SECS), Duration::from_secs(CLOCK_TICK_SECS));
        group_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attr_tick = interval_at(
            start + Duration::from_secs(ATTRIBUTE_REFRESH_SECS),
            Duration::from_secs(ATTRIBUTE_REFRESH_SECS),
        );
        attr_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; 2048];

        loop {
            let trickle_deadline =
                self.engine.next_trickle_fire().map(|ticks| self.deadline_instant(ticks));

            let event = tokio::select! {
                _ = group_tick.tick() => Event::GroupTick,
                _ = attr_tick.tick() => Event::AttributeRefresh,
                _ = Self::sleep_opt(trickle_deadline), if trickle_deadline.is_some() => {
                    Event::TrickleFire
                }
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, _)) => Event::Frame(len),
                    Err(err) => {
                        warn!(%err, "radio receive failed");
                        continue;
                    }
                },
            };

            match event {
                Event::GroupTick => {
                    if let Some(pkt) = self.engine.group_tick(self.clock.ticks()) {
                        debug!("vc broadcast");
                        match wire::to_bytes(&pkt) {
                            Ok(bytes) => self.broadcast(GROUP_CHANNEL, bytes).await,
                            Err(err) => warn!(%err, "vc encode failed"),
                        }
                    }
                }
                Event::AttributeRefresh => {
                    self.engine.refresh_attributes(self.clock.ticks());
                }
                Event::TrickleFire => {
                    if let Some(pkt) = self.engine.trickle_fire(self.clock.ticks()) {
                        match wire::to_bytes(&pkt) {
                            Ok(bytes) => self.broadcast(DISSEMINATION_CHANNEL, bytes).await,
                            Err(err) => warn!(%err, "view encode failed"),
                        }
                    }
                }
                Event::Frame(len) => {
                    let raw = buf[..len].to_vec();
                    self.handle_frame(&raw);
                }
            }
        }
    }
}
