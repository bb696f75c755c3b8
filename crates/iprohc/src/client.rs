// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client main loop.
//!
//! The client drives one control session: TLS handshake, CONNECT,
//! CONNECT_OK, then keepalives until either side tears the tunnel down.
//! On CONNECT_OK it starts the data plane (one tunnel worker fed by two
//! device pumps), runs the optional up-script and silences the stderr
//! log mirror.

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::bounded;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::event::{SignalEvent, SignalPipe};
use crate::logging;
use crate::net::{reader, RawTunnelSocket, ReaderHandle, VirtualInterface};
use crate::protocol::frame::Frame;
use crate::session::{
    dead_after_secs, keepalive_interval_secs, SessionEndpoint, SessionError, SessionShared,
    SessionStatus,
};
use crate::tunnel::worker::{TunnelWorker, WorkerHandle, PIPE_DEPTH};
use crate::tunnel::TunnelParams;

const SOCKET: Token = Token(0);
const SIGNAL: Token = Token(1);

/// How long to wait for the server's answer before giving up.
const WAIT_REPLY_TIMEOUT: Duration = Duration::from_secs(80);

const TICK: Duration = Duration::from_secs(1);

/// Final outcome of a client run, mapped onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// Shut down on request (SIGINT/SIGTERM/SIGQUIT).
    Clean,
    /// The established session was lost.
    SessionLost,
    /// Never reached the CONNECTED state.
    ConnectFailed,
}

impl ClientExit {
    pub fn code(self) -> i32 {
        match self {
            ClientExit::Clean => 0,
            ClientExit::SessionLost => 1,
            ClientExit::ConnectFailed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    TlsHandshake,
    WaitReply,
    Connected,
}

/// A fully-wired client ready to run its control loop.
pub struct ClientSession {
    pub endpoint: SessionEndpoint,
    pub shared: Arc<SessionShared>,
    pub signals: SignalPipe,
    pub tun: Arc<VirtualInterface>,
    pub raw: Arc<RawTunnelSocket>,
    /// Name of the local TUN interface, passed to the up-script.
    pub tun_name: String,
    /// Packing factor forced by the user, if any.
    pub requested_packing: Option<u8>,
    pub up_script: Option<PathBuf>,
}

/// Data-plane pieces started once the tunnel is negotiated.
struct DataPlane {
    worker: WorkerHandle,
    tun_pump: ReaderHandle,
    raw_pump: ReaderHandle,
}

impl ClientSession {
    /// Run the control loop to completion.
    pub fn run(mut self) -> ClientExit {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                log::error!("[CLIENT] cannot create poll: {}", e);
                return ClientExit::ConnectFailed;
            }
        };
        if let Err(e) = poll
            .registry()
            .register(
                &mut SourceFd(&self.endpoint.as_raw_fd()),
                SOCKET,
                Interest::READABLE,
            )
            .and_then(|()| {
                poll.registry().register(
                    &mut SourceFd(&self.signals.as_raw_fd()),
                    SIGNAL,
                    Interest::READABLE,
                )
            })
        {
            log::error!("[CLIENT] cannot register poll sources: {}", e);
            return ClientExit::ConnectFailed;
        }

        let mut events = Events::with_capacity(16);
        let mut phase = Phase::TlsHandshake;
        let mut params: Option<TunnelParams> = None;
        let mut data_plane: Option<DataPlane> = None;
        let connect_deadline = Instant::now() + WAIT_REPLY_TIMEOUT;

        log::info!("[CLIENT] wait for connect answer from server");
        let exit = loop {
            if let Err(e) = poll.poll(&mut events, Some(TICK)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[CLIENT] poll failed: {}", e);
                break self.failure_exit(phase);
            }

            let mut shutdown = false;
            let mut outcome: Option<ClientExit> = None;

            for event in events.iter() {
                match event.token() {
                    SIGNAL => {
                        for signal in self.signals.drain() {
                            match signal {
                                SignalEvent::Shutdown => {
                                    log::info!("[CLIENT] shutdown requested, interrupting session");
                                    shutdown = true;
                                }
                                SignalEvent::ToggleDebug => {
                                    let level = logging::toggle_debug();
                                    log::info!("[CLIENT] log verbosity switched to {}", level);
                                }
                                SignalEvent::DumpStats => self.dump_stats(params.as_ref()),
                            }
                        }
                    }
                    SOCKET => match self.endpoint.on_readable() {
                        Ok(frames) => {
                            if phase == Phase::TlsHandshake && !self.endpoint.is_handshaking() {
                                log::info!("[CLIENT] TLS handshake succeeded");
                                if let Err(e) = self.endpoint.send(&Frame::Connect {
                                    packing: self.requested_packing,
                                }) {
                                    log::error!("[CLIENT] failed to send connect message: {}", e);
                                    outcome = Some(ClientExit::ConnectFailed);
                                    break;
                                }
                                log::info!("[CLIENT] connect message sent to server");
                                phase = Phase::WaitReply;
                            }
                            for frame in frames {
                                match self.handle_frame(frame, &mut phase, &mut params) {
                                    FrameAction::Continue => {}
                                    FrameAction::StartDataPlane(addr, negotiated) => {
                                        match self.start_data_plane(addr, negotiated) {
                                            Ok(plane) => data_plane = Some(plane),
                                            Err(e) => {
                                                log::error!(
                                                    "[CLIENT] failed to start tunnel: {}",
                                                    e
                                                );
                                                outcome = Some(ClientExit::ConnectFailed);
                                            }
                                        }
                                    }
                                    FrameAction::Exit(code) => outcome = Some(code),
                                }
                                if outcome.is_some() {
                                    break;
                                }
                            }
                        }
                        Err(SessionError::PeerClosed) => {
                            log::error!("[CLIENT] TLS session was interrupted by server");
                            outcome = Some(self.failure_exit(phase));
                        }
                        Err(e) => {
                            log::error!("[CLIENT] control channel failed: {}", e);
                            outcome = Some(self.failure_exit(phase));
                        }
                    },
                    _ => {}
                }
                if shutdown || outcome.is_some() {
                    break;
                }
            }

            if let Some(code) = outcome {
                break code;
            }
            if shutdown {
                // Orderly goodbye; failures here only cost a log line.
                if self.endpoint.send(&Frame::Disconnect).is_err() {
                    log::warn!("[CLIENT] failed to cleanly close the session with server");
                }
                break ClientExit::Clean;
            }

            match phase {
                Phase::Connected => {
                    if let Some(code) = self.connected_tick(params.as_ref()) {
                        break code;
                    }
                }
                _ => {
                    if Instant::now() >= connect_deadline {
                        log::error!(
                            "[CLIENT] timeout ({}s) reached while waiting for server, give up",
                            WAIT_REPLY_TIMEOUT.as_secs()
                        );
                        break ClientExit::ConnectFailed;
                    }
                }
            }
        };

        self.teardown(data_plane);
        exit
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        phase: &mut Phase,
        params: &mut Option<TunnelParams>,
    ) -> FrameAction {
        match (frame, *phase) {
            (Frame::ConnectOk { addr, params: p }, Phase::WaitReply) => {
                if let Err(e) = p.validate() {
                    log::error!("[CLIENT] server sent unusable tunnel parameters: {}", e);
                    return FrameAction::Exit(ClientExit::ConnectFailed);
                }
                log::info!(
                    "[CLIENT] server assigned tunnel address {} (packing {}, keepalive {}s)",
                    addr,
                    p.packing,
                    p.keepalive_timeout
                );
                *params = Some(p);
                *phase = Phase::Connected;
                FrameAction::StartDataPlane(addr, p)
            }
            (Frame::ConnectKo { reason }, _) => {
                log::error!("[CLIENT] server refused connection: {}", reason);
                FrameAction::Exit(ClientExit::ConnectFailed)
            }
            (Frame::Keepalive, _) => FrameAction::Continue,
            (Frame::Disconnect, _) => {
                log::warn!("[CLIENT] server asked to disconnect");
                FrameAction::Exit(ClientExit::SessionLost)
            }
            (frame, phase) => {
                log::error!(
                    "[CLIENT] unexpected {} in phase {:?}, aborting",
                    frame,
                    phase
                );
                FrameAction::Exit(match phase {
                    Phase::Connected => ClientExit::SessionLost,
                    _ => ClientExit::ConnectFailed,
                })
            }
        }
    }

    /// Spawn the worker and the two device pumps, mark the session
    /// established, run the up-script.
    fn start_data_plane(
        &mut self,
        addr: Ipv4Addr,
        params: TunnelParams,
    ) -> std::io::Result<DataPlane> {
        let std::net::SocketAddr::V4(peer) = self.endpoint.peer_addr() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "control connection is not IPv4",
            ));
        };

        let (tun_tx, tun_rx) = bounded(PIPE_DEPTH);
        let (raw_tx, raw_rx) = bounded(PIPE_DEPTH);

        let worker = TunnelWorker {
            tun_rx,
            raw_rx,
            tun: Arc::clone(&self.tun),
            raw: Arc::clone(&self.raw),
            peer: *peer.ip(),
            params,
            shared: Arc::clone(&self.shared),
        }
        .spawn()?;
        let tun_pump = reader::spawn_tun_pump(Arc::clone(&self.tun), tun_tx)?;
        let raw_pump = reader::spawn_raw_pump(Arc::clone(&self.raw), raw_tx)?;

        self.shared.mark_connected();
        self.run_up_script(addr);

        // The tunnel is up; from here on syslog is the only log sink.
        logging::set_stderr_enabled(false);
        log::info!("[CLIENT] tunnel established");

        Ok(DataPlane {
            worker,
            tun_pump,
            raw_pump,
        })
    }

    fn run_up_script(&self, addr: Ipv4Addr) {
        let Some(script) = &self.up_script else {
            return;
        };
        log::info!(
            "[CLIENT] run up-script '{}' for {} on {}",
            script.display(),
            addr,
            self.tun_name
        );
        match Command::new(script)
            .arg(&self.tun_name)
            .arg(addr.to_string())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => {
                log::warn!("[CLIENT] up-script exited with {}", status);
            }
            Err(e) => {
                log::warn!("[CLIENT] failed to run up-script: {}", e);
            }
        }
    }

    /// Keepalive timers for the established session.
    fn connected_tick(&mut self, params: Option<&TunnelParams>) -> Option<ClientExit> {
        let keepalive = params.map_or(TunnelParams::default().keepalive_timeout, |p| {
            p.keepalive_timeout
        });
        let now = Instant::now();
        let state = self.shared.state_snapshot();
        let _ = self.endpoint.flush();

        if now.duration_since(state.last_sent).as_secs() >= keepalive_interval_secs(keepalive) {
            log::debug!("[CLIENT] keepalive to server");
            if let Err(e) = self.endpoint.send(&Frame::Keepalive) {
                log::error!("[CLIENT] failed to send keepalive: {}", e);
                return Some(ClientExit::SessionLost);
            }
        }
        if now.duration_since(state.last_read).as_secs() >= dead_after_secs(keepalive) {
            log::error!(
                "[CLIENT] nothing heard from server for {}s, session is dead",
                dead_after_secs(keepalive)
            );
            return Some(ClientExit::SessionLost);
        }
        None
    }

    fn dump_stats(&self, params: Option<&TunnelParams>) {
        self.shared.with_state(|state| {
            log::info!("--------------------------------------------");
            log::info!("status: {}", state.status);
            if state.status == SessionStatus::Connected {
                if let Some(p) = params {
                    log::info!("packing: {}", p.packing);
                }
                let snap = self.shared.stats.snapshot();
                log::info!("stats:");
                log::info!("  failed decompression:          {}", snap.decomp_failed);
                log::info!("  total  decompression:          {}", snap.decomp_total);
                log::info!("  failed compression:            {}", snap.comp_failed);
                log::info!("  total  compression:            {}", snap.comp_total);
                log::info!("  failed depacketization:        {}", snap.unpack_failed);
                log::info!("  total received packets on raw: {}", snap.total_received);
            }
            log::info!("--------------------------------------------");
        });
    }

    fn failure_exit(&self, phase: Phase) -> ClientExit {
        match phase {
            Phase::Connected => ClientExit::SessionLost,
            _ => ClientExit::ConnectFailed,
        }
    }

    fn teardown(mut self, data_plane: Option<DataPlane>) {
        self.shared.mark_pending_delete();
        if let Some(plane) = data_plane {
            plane.worker.stop();
            plane.tun_pump.stop();
            plane.raw_pump.stop();
            plane.worker.join();
        }
        log::info!("[CLIENT] close TLS session");
        self.endpoint.close();
    }
}

enum FrameAction {
    Continue,
    StartDataPlane(Ipv4Addr, TunnelParams),
    Exit(ClientExit),
}
