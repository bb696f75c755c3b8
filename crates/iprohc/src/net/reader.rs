// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device pump threads (client side).
//!
//! A pump reads one shared device and forwards every packet into a
//! bounded pipe, giving the tunnel worker the same uniform read loop the
//! server's demux router provides. Reads go through a poll so the pump
//! can be shut down cooperatively; it never closes the device it reads.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, TrySendError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::net::raw::{RawTunnelSocket, RAW_READ_BUF_LEN};
use crate::net::tun::{VirtualInterface, TUN_PI_LEN, TUN_READ_BUF_LEN};

const DEVICE: Token = Token(0);
const WAKE: Token = Token(1);

const POLL_TICK: Duration = Duration::from_secs(1);

enum PumpStep {
    /// Device drained; wait for the next readable event.
    Idle,
    /// Pipe closed or unrecoverable device error; leave the thread.
    Stop,
}

/// Handle to one pump thread.
pub struct ReaderHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    join: JoinHandle<()>,
}

impl ReaderHandle {
    /// Stop the pump and wait for it.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.waker.wake();
        if self.join.join().is_err() {
            log::error!("[PUMP] device pump thread panicked");
        }
    }
}

/// Pump the virtual interface into `tx`, stripping the packet-information
/// envelope so the pipe carries bare IP packets.
pub fn spawn_tun_pump(
    tun: Arc<VirtualInterface>,
    tx: Sender<Vec<u8>>,
) -> io::Result<ReaderHandle> {
    tun.set_nonblocking(true)?;
    let fd = tun.as_raw_fd();
    spawn_pump("tun-pump", fd, move || {
        let mut buf = [0u8; TUN_READ_BUF_LEN];
        loop {
            match tun.read_frame(&mut buf) {
                Ok(n) if n > TUN_PI_LEN => {
                    if !forward(&tx, buf[TUN_PI_LEN..n].to_vec(), "TUN") {
                        return PumpStep::Stop;
                    }
                }
                Ok(_) => {} // runt frame, nothing to forward
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return PumpStep::Idle,
                Err(e) => {
                    log::error!("[PUMP] TUN read failed: {}", e);
                    return PumpStep::Stop;
                }
            }
        }
    })
}

/// Pump the raw socket into `tx`; datagrams keep their outer IP header,
/// which the worker validates and strips.
pub fn spawn_raw_pump(
    raw: Arc<RawTunnelSocket>,
    tx: Sender<Vec<u8>>,
) -> io::Result<ReaderHandle> {
    let fd = raw.as_raw_fd();
    spawn_pump("raw-pump", fd, move || {
        let mut buf = [0u8; RAW_READ_BUF_LEN];
        loop {
            match raw.recv(&mut buf) {
                Ok(n) if n > 0 => {
                    if !forward(&tx, buf[..n].to_vec(), "RAW") {
                        return PumpStep::Stop;
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return PumpStep::Idle,
                Err(e) => {
                    log::error!("[PUMP] raw socket read failed: {}", e);
                    return PumpStep::Stop;
                }
            }
        }
    })
}

/// True when the packet was handed over (or dropped on backpressure);
/// false when the pipe is gone and the pump should stop.
fn forward(tx: &Sender<Vec<u8>>, packet: Vec<u8>, tag: &str) -> bool {
    match tx.try_send(packet) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::debug!("[PUMP] {} pipe full, packet dropped", tag);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

fn spawn_pump<F>(name: &str, fd: RawFd, mut drain: F) -> io::Result<ReaderHandle>
where
    F: FnMut() -> PumpStep + Send + 'static,
{
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&fd), DEVICE, Interest::READABLE)?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let shutdown_seen = Arc::clone(&shutdown);
    let thread_name = name.to_string();
    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut poll = poll;
            let mut events = Events::with_capacity(8);
            log::debug!("[PUMP] {} running", thread_name);
            'outer: loop {
                if shutdown_seen.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = poll.poll(&mut events, Some(POLL_TICK)) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    log::error!("[PUMP] {} poll failed: {}", thread_name, e);
                    break;
                }
                for event in events.iter() {
                    if event.token() == DEVICE {
                        match drain() {
                            PumpStep::Idle => {}
                            PumpStep::Stop => break 'outer,
                        }
                    }
                }
            }
            log::debug!("[PUMP] {} stopped", thread_name);
        })?;

    Ok(ReaderHandle {
        shutdown,
        waker,
        join,
    })
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::net::UdpSocket;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::time::Duration;

    #[test]
    fn tun_pump_strips_envelope_and_forwards() {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe2 fills the two descriptors on success.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        // SAFETY: both descriptors were just created and are unowned.
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        let device = Arc::new(VirtualInterface::from_fd(rd));
        let feeder = VirtualInterface::from_fd(wr);

        let (tx, rx) = bounded(8);
        let pump = spawn_tun_pump(Arc::clone(&device), tx).unwrap();

        feeder.write_packet(&[0x45, 1, 2, 3]).unwrap();
        let pkt = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(pkt, vec![0x45, 1, 2, 3]);

        pump.stop();
    }

    #[test]
    fn raw_pump_forwards_whole_datagrams() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sock.local_addr().unwrap().port();
        let raw = Arc::new(RawTunnelSocket::from_datagram(sock, 0).unwrap());

        let (tx, rx) = bounded(8);
        let pump = spawn_raw_pump(Arc::clone(&raw), tx).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"dgram", ("127.0.0.1", port)).unwrap();

        let dgram = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(dgram, b"dgram");

        pump.stop();
    }
}
