// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS endpoint of the control channel.
//!
//! The TCP socket runs non-blocking under the caller's poll; the TLS
//! engine is driven explicitly (`read_tls` / `process_new_packets` /
//! `write_tls`) so a readable event advances handshake and plaintext
//! alike. Decrypted bytes accumulate in a small buffer that frames are
//! parsed out of, each advancing the stream by exactly its encoded
//! length.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};

use crate::protocol::frame::{Frame, FrameError};
use crate::session::SessionShared;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("control socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("TLS session failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("protocol violation: {0}")]
    Frame(#[from] FrameError),
    /// A well-formed message that the session's current phase does not
    /// allow (a second CONNECT once connected, a server-only reply sent
    /// by a client, ...).
    #[error("{frame} not allowed while {phase}")]
    UnexpectedFrame {
        frame: &'static str,
        phase: &'static str,
    },
    #[error("peer closed the control channel")]
    PeerClosed,
}

/// Client or server half of one TLS session.
enum TlsChannel {
    Client(Box<ClientConnection>),
    Server(Box<ServerConnection>),
}

impl TlsChannel {
    fn is_handshaking(&self) -> bool {
        match self {
            TlsChannel::Client(c) => c.is_handshaking(),
            TlsChannel::Server(c) => c.is_handshaking(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsChannel::Client(c) => c.wants_write(),
            TlsChannel::Server(c) => c.wants_write(),
        }
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsChannel::Client(c) => c.read_tls(rd),
            TlsChannel::Server(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsChannel::Client(c) => c.write_tls(wr),
            TlsChannel::Server(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsChannel::Client(c) => c.process_new_packets(),
            TlsChannel::Server(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsChannel::Client(c) => c.reader(),
            TlsChannel::Server(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsChannel::Client(c) => c.writer(),
            TlsChannel::Server(c) => c.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsChannel::Client(c) => c.send_close_notify(),
            TlsChannel::Server(c) => c.send_close_notify(),
        }
    }
}

/// One side of an established control connection.
pub struct SessionEndpoint {
    sock: TcpStream,
    tls: TlsChannel,
    /// Decrypted control bytes not yet parsed into frames.
    rx: Vec<u8>,
    peer_eof: bool,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    shared: Arc<SessionShared>,
}

impl SessionEndpoint {
    /// Client endpoint over a freshly connected socket. Queues the first
    /// handshake flight immediately.
    pub fn client(
        sock: TcpStream,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        shared: Arc<SessionShared>,
    ) -> Result<Self, SessionError> {
        let conn = ClientConnection::new(config, server_name)?;
        let mut endpoint = Self::wrap(sock, TlsChannel::Client(Box::new(conn)), shared)?;
        endpoint.flush()?;
        Ok(endpoint)
    }

    /// Server endpoint over an accepted socket.
    pub fn server(
        sock: TcpStream,
        config: Arc<ServerConfig>,
        shared: Arc<SessionShared>,
    ) -> Result<Self, SessionError> {
        let conn = ServerConnection::new(config)?;
        Self::wrap(sock, TlsChannel::Server(Box::new(conn)), shared)
    }

    fn wrap(
        sock: TcpStream,
        tls: TlsChannel,
        shared: Arc<SessionShared>,
    ) -> Result<Self, SessionError> {
        sock.set_nonblocking(true)?;
        let local_addr = sock.local_addr()?;
        let peer_addr = sock.peer_addr()?;
        Ok(Self {
            sock,
            tls,
            rx: Vec::with_capacity(256),
            peer_eof: false,
            local_addr,
            peer_addr,
            shared,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn is_handshaking(&self) -> bool {
        self.tls.is_handshaking()
    }

    /// Advance the TLS engine after a readable event and parse every
    /// complete frame out of the plaintext stream.
    ///
    /// An empty result is normal while the handshake is still running.
    /// `PeerClosed` is reported only once all frames received before the
    /// close have been delivered.
    pub fn on_readable(&mut self) -> Result<Vec<Frame>, SessionError> {
        loop {
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => {
                    self.peer_eof = true;
                    break;
                }
                Ok(_) => {
                    let state = match self.tls.process_new_packets() {
                        Ok(state) => state,
                        Err(e) => {
                            // Push out the fatal alert before reporting.
                            let _ = self.flush();
                            return Err(SessionError::Tls(e));
                        }
                    };
                    let n = state.plaintext_bytes_to_read();
                    if n > 0 {
                        let start = self.rx.len();
                        self.rx.resize(start + n, 0);
                        self.tls.reader().read_exact(&mut self.rx[start..])?;
                    }
                    if state.peer_has_closed() {
                        self.peer_eof = true;
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.flush()?;

        let mut frames = Vec::new();
        while let Some((frame, used)) = Frame::decode(&self.rx)? {
            self.rx.drain(..used);
            frames.push(frame);
        }
        if !frames.is_empty() {
            self.shared.touch_read();
        } else if self.peer_eof {
            if !self.rx.is_empty() {
                // The peer hung up mid-frame.
                return Err(SessionError::Frame(FrameError::Truncated));
            }
            return Err(SessionError::PeerClosed);
        }
        Ok(frames)
    }

    /// Encrypt and send one control frame.
    pub fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let wire = frame.encode();
        self.tls.writer().write_all(&wire)?;
        self.shared.touch_sent();
        self.flush()
    }

    /// Push buffered TLS output toward the socket. Safe to call from a
    /// timer tick; leftover bytes stay queued on backpressure.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Orderly close: TLS close-notify, then TCP shutdown. Best effort.
    pub fn close(&mut self) {
        self.tls.send_close_notify();
        let _ = self.flush();
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
    }
}

impl AsRawFd for SessionEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
