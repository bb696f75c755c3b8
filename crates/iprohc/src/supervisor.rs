// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server supervisor: the single-threaded main loop.
//!
//! One poll with a one-second tick watches the listening socket, the
//! signal pipe and every occupied slot's control socket. Each iteration
//! accepts new clients into the lowest free slot, drives keepalives,
//! watches for dead peers, reaps sessions in `PendingDelete` once their
//! worker has finished, and dumps statistics on request.
//!
//! The supervisor is the sole writer of the slot table; the router
//! threads only observe the published [`SlotPorts`] blocks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig as TlsServerConfig;

use crate::event::{SignalEvent, SignalPipe};
use crate::logging;
use crate::net::{RawTunnelSocket, VirtualInterface};
use crate::pool::AddrPool;
use crate::protocol::frame::Frame;
use crate::router::{SessionTable, SlotPorts};
use crate::session::{
    dead_after_secs, keepalive_interval_secs, SessionEndpoint, SessionError, SessionShared,
    SessionStatus,
};
use crate::tunnel::worker::{TunnelWorker, WorkerHandle, PIPE_DEPTH};
use crate::tunnel::TunnelParams;

const LISTENER: Token = Token(0);
const SIGNAL: Token = Token(1);
const SLOT_BASE: usize = 2;

const TICK: Duration = Duration::from_secs(1);

/// Control-plane phase of a server-side session, tracked alongside the
/// shared status (which the data plane and routers see).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    TlsHandshake,
    WaitConnect,
    Connected,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::TlsHandshake => "handshaking",
            Phase::WaitConnect => "waiting for connect",
            Phase::Connected => "connected",
        }
    }
}

/// Everything the supervisor owns for one occupied slot.
struct ServerSlot {
    endpoint: SessionEndpoint,
    shared: Arc<SessionShared>,
    phase: Phase,
    worker: Option<WorkerHandle>,
    tunnel_addr: Option<Ipv4Addr>,
    params: Option<TunnelParams>,
    /// Set once teardown has been initiated (pipes withdrawn, worker
    /// asked to stop); the slot is freed when the worker finishes.
    reaping: bool,
}

/// Wiring the binary hands to the supervisor at boot.
pub struct SupervisorConfig {
    pub listener: TcpListener,
    pub signals: SignalPipe,
    pub tls: Arc<TlsServerConfig>,
    pub pool: AddrPool,
    pub table: Arc<SessionTable>,
    pub tun: Arc<VirtualInterface>,
    pub raw: Arc<RawTunnelSocket>,
    pub defaults: TunnelParams,
}

pub struct Supervisor {
    listener: TcpListener,
    signals: SignalPipe,
    poll: Poll,
    tls: Arc<TlsServerConfig>,
    pool: AddrPool,
    table: Arc<SessionTable>,
    tun: Arc<VirtualInterface>,
    raw: Arc<RawTunnelSocket>,
    defaults: TunnelParams,
    slots: Vec<Option<ServerSlot>>,
    clients_nr: usize,
    dump_requested: bool,
    alive: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> io::Result<Self> {
        let max_clients = config.table.len();
        config.listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&config.listener.as_raw_fd()),
            LISTENER,
            Interest::READABLE,
        )?;
        poll.registry().register(
            &mut SourceFd(&config.signals.as_raw_fd()),
            SIGNAL,
            Interest::READABLE,
        )?;

        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, || None);

        Ok(Self {
            listener: config.listener,
            signals: config.signals,
            poll,
            tls: config.tls,
            pool: config.pool,
            table: config.table,
            tun: config.tun,
            raw: config.raw,
            defaults: config.defaults,
            slots,
            clients_nr: 0,
            dump_requested: false,
            alive: true,
        })
    }

    /// Run until a shutdown signal arrives, then tear every session down.
    pub fn run(&mut self) -> io::Result<()> {
        log::info!("[SUPERVISOR] server is now ready to accept requests from clients");
        let mut events = Events::with_capacity(128);

        while self.alive {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    SIGNAL => self.handle_signals(),
                    Token(n) => self.slot_readable(n - SLOT_BASE),
                }
            }

            self.tick();

            if self.dump_requested {
                self.dump_requested = false;
                self.dump_stats();
            }
        }

        self.teardown();
        Ok(())
    }

    // ===== Accept path =====

    fn accept_pending(&mut self) {
        loop {
            let (sock, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("[SUPERVISOR] failed to accept new connection: {}", e);
                    break;
                }
            };

            if self.clients_nr >= self.slots.len() {
                log::error!(
                    "[SUPERVISOR] no more clients accepted, maximum {} reached",
                    self.slots.len()
                );
                drop(sock);
                continue;
            }

            let Some(idx) = lowest_free_slot(&self.slots) else {
                log::error!("[SUPERVISOR] no free slot despite client count below maximum");
                drop(sock);
                continue;
            };
            log::info!(
                "[SUPERVISOR] will store client {}/{} at index {}",
                self.clients_nr + 1,
                self.slots.len(),
                idx
            );

            match self.new_session(idx, sock, peer) {
                Ok(slot) => {
                    self.slots[idx] = Some(slot);
                    self.clients_nr += 1;
                }
                Err(e) => {
                    log::error!("[SUPERVISOR] failed to set up client #{}: {}", idx, e);
                }
            }
        }
    }

    fn new_session(
        &mut self,
        idx: usize,
        sock: std::net::TcpStream,
        peer: SocketAddr,
    ) -> Result<ServerSlot, SessionError> {
        let shared = Arc::new(SessionShared::new());
        let endpoint = SessionEndpoint::server(sock, Arc::clone(&self.tls), Arc::clone(&shared))?;
        self.poll
            .registry()
            .register(
                &mut SourceFd(&endpoint.as_raw_fd()),
                Token(SLOT_BASE + idx),
                Interest::READABLE,
            )
            .map_err(SessionError::Io)?;
        log::info!("[SUPERVISOR] client #{} connected from {}", idx, peer);
        Ok(ServerSlot {
            endpoint,
            shared,
            phase: Phase::TlsHandshake,
            worker: None,
            tunnel_addr: None,
            params: None,
            reaping: false,
        })
    }

    // ===== Control path =====

    fn handle_signals(&mut self) {
        for event in self.signals.drain() {
            match event {
                SignalEvent::Shutdown => {
                    log::info!("[SUPERVISOR] SIGTERM or SIGINT received");
                    self.alive = false;
                }
                SignalEvent::DumpStats => self.dump_requested = true,
                SignalEvent::ToggleDebug => {
                    let level = logging::toggle_debug();
                    log::info!("[SUPERVISOR] log verbosity switched to {}", level);
                }
            }
        }
    }

    fn slot_readable(&mut self, idx: usize) {
        let result = {
            let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
                return;
            };
            if slot.shared.status() == SessionStatus::PendingDelete {
                return;
            }
            let result = slot.endpoint.on_readable();
            if result.is_ok() && slot.phase == Phase::TlsHandshake && !slot.endpoint.is_handshaking()
            {
                slot.phase = Phase::WaitConnect;
                log::info!("[SUPERVISOR] TLS handshake succeeded with client #{}", idx);
            }
            result
        };

        match result {
            Ok(frames) => {
                for frame in frames {
                    self.handle_frame(idx, frame);
                }
            }
            Err(e) => self.fail_session(idx, &e),
        }
    }

    fn handle_frame(&mut self, idx: usize, frame: Frame) {
        let phase = match self.slots.get(idx).and_then(Option::as_ref) {
            Some(slot) => slot.phase,
            None => return,
        };
        match (phase, frame) {
            (Phase::WaitConnect, Frame::Connect { packing }) => self.negotiate(idx, packing),
            (_, Frame::Keepalive) => {
                log::debug!("[SUPERVISOR] keepalive from client #{}", idx);
            }
            (_, Frame::Disconnect) => {
                log::info!("[SUPERVISOR] client #{} asked to disconnect", idx);
                if let Some(slot) = self.slots.get(idx).and_then(Option::as_ref) {
                    slot.shared.mark_pending_delete();
                }
            }
            (_, frame) => {
                log::warn!(
                    "[SUPERVISOR] unexpected {} from client #{} while {}",
                    frame,
                    idx,
                    phase.as_str()
                );
                self.fail_session(
                    idx,
                    &SessionError::UnexpectedFrame {
                        frame: frame.name(),
                        phase: phase.as_str(),
                    },
                );
            }
        }
    }

    /// Handle a CONNECT: reserve an address, spawn the worker, publish
    /// the slot to the routers, answer CONNECT_OK.
    fn negotiate(&mut self, idx: usize, requested_packing: Option<u8>) {
        let Some(addr) = self.pool.reserve() else {
            log::error!("[SUPERVISOR] no address available for client #{}", idx);
            if let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) {
                let _ = slot.endpoint.send(&Frame::ConnectKo {
                    reason: "no address available".to_string(),
                });
                slot.shared.mark_pending_delete();
            }
            return;
        };

        let spawn_result = (|| -> Result<(), SessionError> {
            let slot = self
                .slots
                .get_mut(idx)
                .and_then(Option::as_mut)
                .ok_or(SessionError::PeerClosed)?;
            let (SocketAddr::V4(peer), SocketAddr::V4(local)) =
                (slot.endpoint.peer_addr(), slot.endpoint.local_addr())
            else {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "control connection is not IPv4",
                )));
            };

            let params = self.defaults.negotiate(requested_packing);
            let (tun_tx, tun_rx) = bounded(PIPE_DEPTH);
            let (raw_tx, raw_rx) = bounded(PIPE_DEPTH);

            let worker = TunnelWorker {
                tun_rx,
                raw_rx,
                tun: Arc::clone(&self.tun),
                raw: Arc::clone(&self.raw),
                peer: *peer.ip(),
                params,
                shared: Arc::clone(&slot.shared),
            }
            .spawn()?;
            slot.worker = Some(worker);
            slot.tunnel_addr = Some(addr);
            slot.params = Some(params);

            self.table.publish(
                idx,
                Arc::new(SlotPorts {
                    tunnel_addr: addr,
                    peer_addr: *peer.ip(),
                    local_addr: *local.ip(),
                    tun_tx,
                    raw_tx,
                    shared: Arc::clone(&slot.shared),
                }),
            );

            slot.endpoint.send(&Frame::ConnectOk { addr, params })?;
            slot.shared.mark_connected();
            slot.phase = Phase::Connected;
            log::info!(
                "[SUPERVISOR] client #{} connected: tunnel address {}, packing {}",
                idx,
                addr,
                params.packing
            );
            Ok(())
        })();

        if let Err(e) = spawn_result {
            // A reservation that never made it into the slot would leak
            // at reap time; give it back here.
            let recorded = self
                .slots
                .get(idx)
                .and_then(Option::as_ref)
                .and_then(|slot| slot.tunnel_addr);
            if recorded != Some(addr) {
                self.pool.release(addr);
            }
            log::error!("[SUPERVISOR] failed to start tunnel for client #{}: {}", idx, e);
            self.fail_session(idx, &e);
        }
    }

    /// Unrecoverable per-session failure: answer CONNECT_KO while still
    /// negotiating, then let the reaper collect the slot.
    fn fail_session(&mut self, idx: usize, err: &SessionError) {
        let Some(slot) = self.slots.get_mut(idx).and_then(Option::as_mut) else {
            return;
        };
        match err {
            SessionError::PeerClosed => {
                log::warn!("[SUPERVISOR] client #{} was disconnected", idx);
            }
            e => {
                log::warn!("[SUPERVISOR] client #{} failed: {}", idx, e);
            }
        }
        if slot.phase != Phase::Connected
            && matches!(
                err,
                SessionError::Frame(_) | SessionError::UnexpectedFrame { .. }
            )
        {
            let _ = slot.endpoint.send(&Frame::ConnectKo {
                reason: err.to_string(),
            });
        }
        slot.shared.mark_pending_delete();
    }

    // ===== Timers and reaping =====

    fn tick(&mut self) {
        let now = Instant::now();
        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            let state = slot.shared.state_snapshot();
            let keepalive = slot
                .params
                .map_or(self.defaults.keepalive_timeout, |p| p.keepalive_timeout);

            match state.status {
                SessionStatus::Connected => {
                    let _ = slot.endpoint.flush();
                    if now.duration_since(state.last_sent).as_secs()
                        >= keepalive_interval_secs(keepalive)
                    {
                        log::debug!("[SUPERVISOR] keepalive to client #{}", idx);
                        if slot.endpoint.send(&Frame::Keepalive).is_err() {
                            slot.shared.mark_pending_delete();
                        }
                    }
                    if now.duration_since(state.last_read).as_secs() >= dead_after_secs(keepalive)
                    {
                        log::warn!(
                            "[SUPERVISOR] client #{} silent for too long, dropping session",
                            idx
                        );
                        slot.shared.mark_pending_delete();
                    }
                }
                SessionStatus::Connecting => {
                    // A peer stuck in handshake or negotiation is held to
                    // the same liveness bar as a connected one.
                    if now.duration_since(state.last_read).as_secs() >= dead_after_secs(keepalive)
                    {
                        log::warn!(
                            "[SUPERVISOR] client #{} never finished connecting, dropping session",
                            idx
                        );
                        slot.shared.mark_pending_delete();
                    }
                }
                SessionStatus::PendingDelete => self.reap(idx),
            }
        }
    }

    /// Two-stage reap: withdraw the slot from routing and stop the worker
    /// first, free everything once the worker's completion signal can be
    /// acquired without blocking.
    fn reap(&mut self, idx: usize) {
        let finished = {
            let Some(slot) = self.slots[idx].as_mut() else {
                return;
            };
            if !slot.reaping {
                slot.reaping = true;
                self.table.clear(idx);
                if let Some(worker) = &slot.worker {
                    worker.stop();
                }
            }
            slot.worker.as_ref().map_or(true, WorkerHandle::is_finished)
        };
        if !finished {
            return;
        }

        log::info!("[SUPERVISOR] remove context of client #{}", idx);
        if let Some(mut slot) = self.slots[idx].take() {
            dump_slot(idx, &slot);
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&slot.endpoint.as_raw_fd()));
            slot.endpoint.close();
            if let Some(worker) = slot.worker.take() {
                worker.join();
            }
            if let Some(addr) = slot.tunnel_addr {
                self.pool.release(addr);
            }
        }
        self.clients_nr -= 1;
        log::info!(
            "[SUPERVISOR] only {}/{} clients remaining",
            self.clients_nr,
            self.slots.len()
        );
    }

    // ===== Stats =====

    fn dump_stats(&self) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                dump_slot(idx, slot);
            }
        }
    }

    // ===== Shutdown =====

    fn teardown(&mut self) {
        log::info!("[SUPERVISOR] someone asked to stop the server");
        log::info!("[SUPERVISOR] release resources of connected clients...");
        for idx in 0..self.slots.len() {
            let Some(mut slot) = self.slots[idx].take() else {
                continue;
            };
            slot.shared.mark_pending_delete();
            self.table.clear(idx);
            if let Some(worker) = slot.worker.take() {
                worker.stop();
                worker.join();
            }
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&slot.endpoint.as_raw_fd()));
            slot.endpoint.close();
            if let Some(addr) = slot.tunnel_addr {
                self.pool.release(addr);
            }
            self.clients_nr -= 1;
        }
    }
}

/// Per-client statistics dump, taken under the status lock so status and
/// counters stay coherent.
fn dump_slot(idx: usize, slot: &ServerSlot) {
    slot.shared.with_state(|state| {
        log::info!("client #{} --------------------------------------------", idx);
        log::info!("status: {}", state.status);
        if state.status == SessionStatus::Connected {
            if let Some(params) = slot.params {
                log::info!("packing: {}", params.packing);
            }
            let snap = slot.shared.stats.snapshot();
            log::info!("stats:");
            log::info!("  failed decompression:          {}", snap.decomp_failed);
            log::info!("  total  decompression:          {}", snap.decomp_total);
            log::info!("  failed compression:            {}", snap.comp_failed);
            log::info!("  total  compression:            {}", snap.comp_total);
            log::info!("  failed depacketization:        {}", snap.unpack_failed);
            log::info!("  total received packets on raw: {}", snap.total_received);
            log::info!("  router overruns:               {}", snap.router_overrun);
            log::info!("  total compressed header size:  {} bytes", snap.head_comp_size);
            log::info!("  total compressed packet size:  {} bytes", snap.total_comp_size);
            log::info!("  total header size before comp: {} bytes", snap.head_uncomp_size);
            log::info!("  total packet size before comp: {} bytes", snap.total_uncomp_size);
            log::info!("stats packing:");
            for (count, n) in snap.packing_histogram.iter().enumerate().skip(1) {
                log::info!("  {} packets: {}", count, n);
            }
        }
        log::info!("--------------------------------------------");
    });
}

/// Lowest unoccupied slot index, if any.
fn lowest_free_slot(slots: &[Option<ServerSlot>]) -> Option<usize> {
    slots.iter().position(Option::is_none)
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_free_slot_prefers_smallest_index() {
        let mut slots: Vec<Option<ServerSlot>> = Vec::new();
        slots.resize_with(3, || None);
        assert_eq!(lowest_free_slot(&slots), Some(0));
    }

    #[test]
    fn full_table_has_no_free_slot() {
        let slots: Vec<Option<ServerSlot>> = Vec::new();
        assert_eq!(lowest_free_slot(&slots), None);
    }
}
