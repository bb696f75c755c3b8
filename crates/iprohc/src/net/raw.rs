// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw IPv4 socket carrying the outer tunnel datagrams.
//!
//! The socket speaks protocol IPPROTO_IPIP: sends take a bare payload and
//! the kernel prepends the outer IPv4 header; receives deliver the whole
//! outer datagram, header included. Sends are atomic per datagram, so the
//! socket is shared by every tunnel worker without a lock.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

/// Largest outer datagram one receive can deliver.
pub const RAW_READ_BUF_LEN: usize = 65536;

const SEND_RETRY_LIMIT: u32 = 1000;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Shared raw socket for the data channel.
#[derive(Debug)]
pub struct RawTunnelSocket {
    sock: UdpSocket,
    /// 0 on the raw socket (the kernel ignores the port); fixed per
    /// deployment when a datagram substitute carries the tunnel.
    dest_port: u16,
}

impl RawTunnelSocket {
    /// Open the IPPROTO_IPIP raw socket. Requires CAP_NET_RAW.
    pub fn create() -> io::Result<Self> {
        let sock = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_IPIP)),
        )?;
        sock.set_nonblocking(true)?;
        log::info!("[RAW] created IPPROTO_IPIP socket");
        Ok(Self {
            sock: sock.into(),
            dest_port: 0,
        })
    }

    /// Wrap an already-configured datagram socket, addressing peers at
    /// `dest_port`. Lets deployments substitute a UDP transport for the
    /// raw path.
    pub fn from_datagram(sock: UdpSocket, dest_port: u16) -> io::Result<Self> {
        sock.set_nonblocking(true)?;
        Ok(Self { sock, dest_port })
    }

    /// Send one datagram payload to the peer's underlying address.
    ///
    /// Retries briefly when the socket buffer is full; persistent
    /// backpressure surfaces as `WouldBlock`.
    pub fn send_to(&self, payload: &[u8], peer: Ipv4Addr) -> io::Result<usize> {
        let dest = SocketAddrV4::new(peer, self.dest_port);
        let mut attempts = 0;
        loop {
            match self.sock.send_to(payload, dest) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock && attempts < SEND_RETRY_LIMIT =>
                {
                    attempts += 1;
                    std::thread::sleep(SEND_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Receive one outer datagram.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }
}

impl AsRawFd for RawTunnelSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

// ===== Tests =====
