// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side packet demux (HOT PATH).
//!
//! Two threads share the work: the TUN thread reads the virtual
//! interface and routes each packet by inner destination address; the RAW
//! thread reads the raw socket and routes each datagram by outer source
//! address. Matching packets land on the owning session's pipe; packets
//! with no match are dropped silently.
//!
//! The routers read the slot table without the status lock. That is safe
//! because everything they touch is bundled into one immutable
//! [`SlotPorts`] value published through an `ArcSwapOption` only after it
//! is fully built; un-publication is the same single pointer store.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::channel::{Sender, TrySendError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::net::raw::{RawTunnelSocket, RAW_READ_BUF_LEN};
use crate::net::tun::{VirtualInterface, TUN_PI_LEN, TUN_READ_BUF_LEN};
use crate::session::SessionShared;
use crate::tunnel::stats::TunnelStats;

const DEVICE: Token = Token(0);
const WAKE: Token = Token(1);
const POLL_TICK: Duration = Duration::from_secs(1);

/// Router-visible face of one session slot. Immutable after publication;
/// the routers only ever load the whole Arc.
pub struct SlotPorts {
    /// Tunnel address assigned to the client (inner destination).
    pub tunnel_addr: Ipv4Addr,
    /// Underlying address of the client (outer source).
    pub peer_addr: Ipv4Addr,
    /// Underlying local address this client talks to (outer destination,
    /// enforced to keep NAT-sharing peers apart).
    pub local_addr: Ipv4Addr,
    /// "fake tun" pipe: packets to compress and send out.
    pub tun_tx: Sender<Vec<u8>>,
    /// "fake raw" pipe: datagrams to depacketize and deliver.
    pub raw_tx: Sender<Vec<u8>>,
    pub shared: Arc<SessionShared>,
}

/// Outcome of routing one packet, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No session matched; silently dropped.
    NoMatch,
    /// Matched session's pipe was full; dropped and counted.
    Overrun,
    /// Matched session's worker is gone; the session was marked dying.
    PeerGone,
    /// Packet too short or filtered before the scan.
    Malformed,
}

/// Fixed-size slot table shared between the supervisor (writer) and the
/// router threads (readers).
pub struct SessionTable {
    slots: Vec<ArcSwapOption<SlotPorts>>,
}

impl SessionTable {
    pub fn new(max_clients: usize) -> Self {
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, ArcSwapOption::empty);
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Publish a fully-built ports block; the routers may observe it from
    /// the moment this store returns.
    pub fn publish(&self, idx: usize, ports: Arc<SlotPorts>) {
        self.slots[idx].store(Some(ports));
    }

    /// Withdraw a slot from routing. Dropping the last Arc closes the
    /// pipe senders, which in turn stops the worker.
    pub fn clear(&self, idx: usize) {
        self.slots[idx].store(None);
    }

    /// Route one TUN frame (envelope still attached) by inner destination.
    pub fn route_tun(&self, frame: &[u8]) -> RouteOutcome {
        if frame.len() < TUN_PI_LEN + 20 {
            return RouteOutcome::Malformed;
        }
        let packet = &frame[TUN_PI_LEN..];
        let dest = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        for slot in &self.slots {
            let guard = slot.load();
            let Some(ports) = guard.as_ref() else {
                continue;
            };
            if ports.tunnel_addr != dest {
                continue;
            }
            return Self::deliver(ports, &ports.tun_tx, packet.to_vec(), "TUN");
        }
        log::debug!("[ROUTER] no session for inner destination {}", dest);
        RouteOutcome::NoMatch
    }

    /// Route one raw datagram (outer header attached) by outer source,
    /// enforcing the per-session local address on the way.
    pub fn route_raw(&self, dgram: &[u8]) -> RouteOutcome {
        if dgram.len() < 20 || dgram[0] >> 4 != 4 {
            return RouteOutcome::Malformed;
        }
        let src = Ipv4Addr::new(dgram[12], dgram[13], dgram[14], dgram[15]);
        let dst = Ipv4Addr::new(dgram[16], dgram[17], dgram[18], dgram[19]);
        for slot in &self.slots {
            let guard = slot.load();
            let Some(ports) = guard.as_ref() else {
                continue;
            };
            if ports.peer_addr != src {
                continue;
            }
            if ports.local_addr != dst {
                log::debug!(
                    "[ROUTER] dropping datagram from {} aimed at {} (session endpoint is {})",
                    src,
                    dst,
                    ports.local_addr
                );
                return RouteOutcome::Malformed;
            }
            return Self::deliver(ports, &ports.raw_tx, dgram.to_vec(), "RAW");
        }
        log::debug!("[ROUTER] no session for outer source {}", src);
        RouteOutcome::NoMatch
    }

    fn deliver(
        ports: &SlotPorts,
        tx: &Sender<Vec<u8>>,
        packet: Vec<u8>,
        tag: &str,
    ) -> RouteOutcome {
        match tx.try_send(packet) {
            Ok(()) => RouteOutcome::Delivered,
            Err(TrySendError::Full(_)) => {
                TunnelStats::bump(&ports.shared.stats.router_overrun);
                log::debug!(
                    "[ROUTER] {} pipe full for {}, packet dropped",
                    tag,
                    ports.tunnel_addr
                );
                RouteOutcome::Overrun
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(
                    "[ROUTER] {} pipe closed for {}, marking session for delete",
                    tag,
                    ports.tunnel_addr
                );
                ports.shared.mark_pending_delete();
                RouteOutcome::PeerGone
            }
        }
    }
}

/// The two demux threads plus their shutdown plumbing.
pub struct Router {
    shutdown: Arc<AtomicBool>,
    tun_thread: Option<(Arc<Waker>, JoinHandle<()>)>,
    raw_thread: Option<(Arc<Waker>, JoinHandle<()>)>,
}

impl Router {
    /// Start both router threads over the shared devices.
    pub fn start(
        table: Arc<SessionTable>,
        tun: Arc<VirtualInterface>,
        raw: Arc<RawTunnelSocket>,
    ) -> io::Result<Self> {
        tun.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let tun_thread = {
            let table = Arc::clone(&table);
            let shutdown = Arc::clone(&shutdown);
            spawn_router("router-tun", tun.as_raw_fd(), shutdown, move || {
                let mut buf = [0u8; TUN_READ_BUF_LEN];
                loop {
                    match tun.read_frame(&mut buf) {
                        Ok(n) if n > 0 => {
                            table.route_tun(&buf[..n]);
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            })?
        };

        let raw_thread = {
            let shutdown = Arc::clone(&shutdown);
            let raw_dev = Arc::clone(&raw);
            spawn_router("router-raw", raw.as_raw_fd(), shutdown, move || {
                let mut buf = [0u8; RAW_READ_BUF_LEN];
                loop {
                    match raw_dev.recv(&mut buf) {
                        Ok(n) if n > 0 => {
                            table.route_raw(&buf[..n]);
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            })?
        };

        log::info!("[ROUTER] TUN and RAW routing threads started");
        Ok(Self {
            shutdown,
            tun_thread: Some(tun_thread),
            raw_thread: Some(raw_thread),
        })
    }

    /// Cooperative shutdown: raise the flag, wake both polls, join.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        for thread in [self.tun_thread.take(), self.raw_thread.take()] {
            if let Some((waker, join)) = thread {
                let _ = waker.wake();
                if join.join().is_err() {
                    log::error!("[ROUTER] routing thread panicked");
                }
            }
        }
        log::info!("[ROUTER] routing threads stopped");
    }
}

fn spawn_router<F>(
    name: &str,
    fd: std::os::fd::RawFd,
    shutdown: Arc<AtomicBool>,
    mut drain: F,
) -> io::Result<(Arc<Waker>, JoinHandle<()>)>
where
    F: FnMut() -> io::Result<()> + Send + 'static,
{
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&fd), DEVICE, Interest::READABLE)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);

    let thread_name = name.to_string();
    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut poll = poll;
            let mut events = Events::with_capacity(16);
            log::info!("[ROUTER] {} running", thread_name);
            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = poll.poll(&mut events, Some(POLL_TICK)) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("[ROUTER] {} poll failed: {}", thread_name, e);
                    break;
                }
                for event in events.iter() {
                    if event.token() == DEVICE {
                        if let Err(e) = drain() {
                            log::error!("[ROUTER] {} read failed: {}", thread_name, e);
                            return;
                        }
                    }
                }
            }
        })?;
    Ok((waker, join))
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    fn ports(
        tunnel: [u8; 4],
        peer: [u8; 4],
        local: [u8; 4],
    ) -> (
        Arc<SlotPorts>,
        crossbeam::channel::Receiver<Vec<u8>>,
        crossbeam::channel::Receiver<Vec<u8>>,
    ) {
        let (tun_tx, tun_rx) = bounded(4);
        let (raw_tx, raw_rx) = bounded(4);
        let ports = Arc::new(SlotPorts {
            tunnel_addr: tunnel.into(),
            peer_addr: peer.into(),
            local_addr: local.into(),
            tun_tx,
            raw_tx,
            shared: Arc::new(SessionShared::new()),
        });
        (ports, tun_rx, raw_rx)
    }

    fn tun_frame(dest: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0, 0, 0x08, 0x00];
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&dest);
        frame.extend_from_slice(&packet);
        frame
    }

    fn raw_dgram(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut dgram = vec![0u8; 24];
        dgram[0] = 0x45;
        dgram[12..16].copy_from_slice(&src);
        dgram[16..20].copy_from_slice(&dst);
        dgram[20..24].copy_from_slice(b"body");
        dgram
    }

    #[test]
    fn tun_packets_reach_only_the_matching_session() {
        let table = SessionTable::new(4);
        let (a, a_tun, _a_raw) = ports([10, 0, 0, 2], [1, 1, 1, 1], [9, 9, 9, 9]);
        let (b, b_tun, _b_raw) = ports([10, 0, 0, 3], [2, 2, 2, 2], [9, 9, 9, 9]);
        table.publish(0, a);
        table.publish(1, b);

        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 2])),
            RouteOutcome::Delivered
        );
        assert!(a_tun.try_recv().is_ok());
        assert!(b_tun.try_recv().is_err());
    }

    #[test]
    fn raw_datagrams_match_on_outer_source() {
        let table = SessionTable::new(4);
        let (a, _a_tun, a_raw) = ports([10, 0, 0, 2], [1, 1, 1, 1], [9, 9, 9, 9]);
        let (b, _b_tun, b_raw) = ports([10, 0, 0, 3], [2, 2, 2, 2], [9, 9, 9, 9]);
        table.publish(0, a);
        table.publish(1, b);

        assert_eq!(
            table.route_raw(&raw_dgram([2, 2, 2, 2], [9, 9, 9, 9])),
            RouteOutcome::Delivered
        );
        assert!(b_raw.try_recv().is_ok());
        assert!(a_raw.try_recv().is_err());
    }

    #[test]
    fn unmatched_traffic_is_silently_dropped() {
        let table = SessionTable::new(2);
        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 9])),
            RouteOutcome::NoMatch
        );
        assert_eq!(
            table.route_raw(&raw_dgram([3, 3, 3, 3], [9, 9, 9, 9])),
            RouteOutcome::NoMatch
        );
    }

    #[test]
    fn wrong_outer_destination_is_filtered() {
        let table = SessionTable::new(1);
        let (a, _a_tun, a_raw) = ports([10, 0, 0, 2], [1, 1, 1, 1], [9, 9, 9, 9]);
        table.publish(0, a);

        assert_eq!(
            table.route_raw(&raw_dgram([1, 1, 1, 1], [8, 8, 8, 8])),
            RouteOutcome::Malformed
        );
        assert!(a_raw.try_recv().is_err());
    }

    #[test]
    fn full_pipe_counts_an_overrun() {
        let table = SessionTable::new(1);
        let (tun_tx, _tun_rx_kept) = bounded(1);
        let (raw_tx, _raw_rx_kept) = bounded(1);
        let shared = Arc::new(SessionShared::new());
        table.publish(
            0,
            Arc::new(SlotPorts {
                tunnel_addr: [10, 0, 0, 2].into(),
                peer_addr: [1, 1, 1, 1].into(),
                local_addr: [9, 9, 9, 9].into(),
                tun_tx,
                raw_tx,
                shared: Arc::clone(&shared),
            }),
        );

        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 2])),
            RouteOutcome::Delivered
        );
        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 2])),
            RouteOutcome::Overrun
        );
        assert_eq!(shared.stats.snapshot().router_overrun, 1);
    }

    #[test]
    fn closed_pipe_marks_session_dying() {
        let table = SessionTable::new(1);
        let (a, tun_rx, _raw_rx) = ports([10, 0, 0, 2], [1, 1, 1, 1], [9, 9, 9, 9]);
        let shared = Arc::clone(&a.shared);
        table.publish(0, a);
        drop(tun_rx);

        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 2])),
            RouteOutcome::PeerGone
        );
        assert_eq!(
            shared.status(),
            crate::session::SessionStatus::PendingDelete
        );
    }

    #[test]
    fn cleared_slot_no_longer_routes() {
        let table = SessionTable::new(1);
        let (a, a_tun, _a_raw) = ports([10, 0, 0, 2], [1, 1, 1, 1], [9, 9, 9, 9]);
        table.publish(0, a);
        table.clear(0);
        assert_eq!(
            table.route_tun(&tun_frame([10, 0, 0, 2])),
            RouteOutcome::NoMatch
        );
        // Clearing dropped the senders with the slot.
        assert!(a_tun.try_recv().is_err());
    }
}
