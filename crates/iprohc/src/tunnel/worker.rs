// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel worker thread.
//!
//! Outbound: packets read from the "fake tun" pipe are compressed,
//! batched up to the packing factor (or the flush threshold) and written
//! to the raw socket as one framed datagram addressed to the peer.
//!
//! Inbound: datagrams from the "fake raw" pipe are depacketized and each
//! element decompressed and written to the virtual interface.
//!
//! Codec failures are counted, never fatal. The worker stops when either
//! pipe closes, when the session status turns `PendingDelete`, or when
//! the stop flag is raised; it never closes the shared devices, which it
//! only borrows through `Arc`.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Select, SelectTimeoutError};

use crate::net::{RawTunnelSocket, VirtualInterface};
use crate::session::{SessionShared, SessionStatus};
use crate::tunnel::codec::{self, Compressor, Decompressor};
use crate::tunnel::packing::{depacketize, Packetizer};
use crate::tunnel::params::TunnelParams;
use crate::tunnel::stats::TunnelStats;

/// Depth of each per-session pipe, in packets.
pub const PIPE_DEPTH: usize = 64;

/// An under-filled batch is flushed this long after its first packet.
const FLUSH_THRESHOLD: Duration = Duration::from_millis(100);

/// Idle tick; bounds how quickly a stop request is observed.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Everything a worker needs to run; devices are borrowed, not owned.
pub struct TunnelWorker {
    pub tun_rx: Receiver<Vec<u8>>,
    pub raw_rx: Receiver<Vec<u8>>,
    pub tun: Arc<VirtualInterface>,
    pub raw: Arc<RawTunnelSocket>,
    /// Underlying address of the peer, for raw sends and ingress checks.
    pub peer: Ipv4Addr,
    pub params: TunnelParams,
    pub shared: Arc<SessionShared>,
}

/// Supervisor-side handle: stop flag plus the completion signal.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop at its next loop turn.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Non-blocking completion check, used by the supervisor's reaper.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) {
        if self.join.join().is_err() {
            log::error!("[TUNNEL] worker thread panicked");
        }
    }
}

impl TunnelWorker {
    /// Spawn the worker thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_seen = Arc::clone(&stop);
        self.shared.stats.init_packing(self.params.packing);
        let join = thread::Builder::new()
            .name(format!("tunnel-{}", self.peer))
            .spawn(move || self.run(&stop_seen))?;
        Ok(WorkerHandle { stop, join })
    }

    fn run(self, stop: &AtomicBool) {
        log::info!(
            "[TUNNEL] worker for peer {} starting (packing {})",
            self.peer,
            self.params.packing
        );
        let mut comp = codec::compressor_for(&self.params);
        let mut decomp = codec::decompressor_for(&self.params);
        let mut batch = Packetizer::new(self.params.packing);

        loop {
            if stop.load(Ordering::Acquire)
                || self.shared.status() == SessionStatus::PendingDelete
            {
                break;
            }

            let timeout = match batch.opened_at() {
                Some(at) => FLUSH_THRESHOLD
                    .saturating_sub(at.elapsed())
                    .min(IDLE_TICK),
                None => IDLE_TICK,
            };

            let mut sel = Select::new();
            let idx_tun = sel.recv(&self.tun_rx);
            let idx_raw = sel.recv(&self.raw_rx);
            match sel.select_timeout(timeout) {
                Ok(op) if op.index() == idx_tun => match op.recv(&self.tun_rx) {
                    Ok(packet) => self.outbound(&mut *comp, &mut batch, &packet),
                    Err(_) => break, // pipe closed
                },
                Ok(op) if op.index() == idx_raw => match op.recv(&self.raw_rx) {
                    Ok(dgram) => self.inbound(&mut *decomp, &dgram),
                    Err(_) => break, // pipe closed
                },
                Ok(_) => unreachable!("unregistered select index"),
                Err(SelectTimeoutError) => {}
            }

            if let Some(at) = batch.opened_at() {
                if batch.is_full() || at.elapsed() >= FLUSH_THRESHOLD {
                    self.flush(&mut batch);
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch);
        }
        log::info!("[TUNNEL] worker for peer {} stopped", self.peer);
    }

    /// Virtual interface -> wire.
    fn outbound(&self, comp: &mut dyn Compressor, batch: &mut Packetizer, packet: &[u8]) {
        let stats = &self.shared.stats;
        TunnelStats::bump(&stats.comp_total);
        let compressed = match comp.compress(packet) {
            Ok(c) => c,
            Err(e) => {
                TunnelStats::bump(&stats.comp_failed);
                log::debug!("[TUNNEL] compression failed for peer {}: {}", self.peer, e);
                return;
            }
        };
        TunnelStats::add(&stats.total_uncomp_size, packet.len() as u64);
        TunnelStats::add(&stats.total_comp_size, compressed.data.len() as u64);
        TunnelStats::add(&stats.head_uncomp_size, compressed.header_uncomp_len as u64);
        TunnelStats::add(&stats.head_comp_size, compressed.header_comp_len as u64);

        if let Err(e) = batch.push(&compressed.data) {
            TunnelStats::bump(&stats.comp_failed);
            log::debug!("[TUNNEL] cannot frame packet for peer {}: {}", self.peer, e);
        }
    }

    /// Wire -> virtual interface.
    fn inbound(&self, decomp: &mut dyn Decompressor, dgram: &[u8]) {
        let stats = &self.shared.stats;
        TunnelStats::bump(&stats.total_received);

        let Some(payload) = outer_payload(dgram, self.peer) else {
            TunnelStats::bump(&stats.unpack_failed);
            log::debug!(
                "[TUNNEL] dropped {}-byte datagram with bad outer header (peer {})",
                dgram.len(),
                self.peer
            );
            return;
        };

        for elem in depacketize(payload) {
            let elem = match elem {
                Ok(elem) => elem,
                Err(e) => {
                    TunnelStats::bump(&stats.unpack_failed);
                    log::debug!(
                        "[TUNNEL] depacketization failed for peer {}: {}",
                        self.peer,
                        e
                    );
                    break; // remainder of the datagram is unrecoverable
                }
            };
            TunnelStats::bump(&stats.decomp_total);
            match decomp.decompress(elem) {
                Ok(packet) => {
                    if let Err(e) = self.tun.write_packet(&packet) {
                        log::warn!(
                            "[TUNNEL] failed to write {}-byte packet to TUN: {}",
                            packet.len(),
                            e
                        );
                    }
                }
                Err(e) => {
                    TunnelStats::bump(&stats.decomp_failed);
                    log::debug!(
                        "[TUNNEL] decompression failed for peer {}: {}",
                        self.peer,
                        e
                    );
                }
            }
        }
    }

    fn flush(&self, batch: &mut Packetizer) {
        let (payload, count) = batch.take();
        if count == 0 {
            return;
        }
        match self.raw.send_to(&payload, self.peer) {
            Ok(_) => self.shared.stats.record_packing(count),
            Err(e) => {
                log::warn!(
                    "[TUNNEL] failed to send {}-packet datagram to {}: {}",
                    count,
                    self.peer,
                    e
                );
            }
        }
    }
}

/// Strip the outer IPv4 header of a raw-path datagram, enforcing that it
/// actually came from the session's peer.
fn outer_payload(dgram: &[u8], peer: Ipv4Addr) -> Option<&[u8]> {
    if dgram.len() < 20 || dgram[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((dgram[0] & 0x0f) as usize) * 4;
    if ihl < 20 || dgram.len() < ihl {
        return None;
    }
    let src = Ipv4Addr::new(dgram[12], dgram[13], dgram[14], dgram[15]);
    if src != peer {
        return None;
    }
    Some(&dgram[ihl..])
}

// ===== Tests =====
