// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TUN virtual interface wrapper.
//!
//! Reads deliver the kernel's 4-byte packet-information envelope (flags +
//! EtherType) followed by the raw IP packet; [`VirtualInterface::write_packet`]
//! prepends the envelope itself so callers only ever hand it bare IP
//! packets. The descriptor is shared between the router (reads) and every
//! tunnel worker (writes); writes are atomic per packet, so no lock is
//! needed around them.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::net::set_nonblocking_fd;

/// Length of the packet-information envelope on reads and writes.
pub const TUN_PI_LEN: usize = 4;

/// Biggest frame one read can deliver (envelope included).
pub const TUN_READ_BUF_LEN: usize = 65536;

/// EtherType for IPv4, placed in the envelope on writes.
const ETH_P_IP: u16 = 0x0800;

/// TUNSETIFF ioctl request (_IOW('T', 202, int)).
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

const IFNAMSIZ: usize = 16;

/// How long a worker write may spin on a full device queue before the
/// packet is counted as lost.
const WRITE_RETRY_LIMIT: u32 = 1000;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// A point-to-point TUN device, shared by reference across threads.
#[derive(Debug)]
pub struct VirtualInterface {
    fd: OwnedFd,
}

impl VirtualInterface {
    /// Create a TUN interface with the given name.
    ///
    /// Requires CAP_NET_ADMIN. The interface comes up unconfigured;
    /// addressing is left to the deployment.
    pub fn create(name: &str) -> io::Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("TUN interface name '{name}' is empty or too long"),
            ));
        }

        // SAFETY: open takes a valid NUL-terminated path.
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by open and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: libc::IFF_TUN as libc::c_short,
            _pad: [0; 22],
        };
        req.name[..name.len()].copy_from_slice(name.as_bytes());

        // SAFETY: TUNSETIFF reads a properly initialized ifreq.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &req) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        log::info!("[TUN] created interface '{}'", name);
        Ok(Self { fd })
    }

    /// Wrap an already-opened TUN descriptor (e.g. one passed in by a
    /// supervisor process).
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        set_nonblocking_fd(self.fd.as_raw_fd(), nonblocking)
    }

    /// Read one frame (envelope + IP packet) into `buf`.
    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: read into a caller-owned buffer of the stated length.
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(n as usize);
        }
    }

    /// Write one bare IP packet, prepending the envelope.
    ///
    /// Retries briefly on a full device queue; a queue that stays full
    /// past the retry budget surfaces as `WouldBlock`.
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(TUN_PI_LEN + packet.len());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&ETH_P_IP.to_be_bytes());
        frame.extend_from_slice(packet);

        let mut attempts = 0;
        loop {
            // SAFETY: write from a valid buffer of the stated length.
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    frame.as_ptr().cast::<libc::c_void>(),
                    frame.len(),
                )
            };
            if n >= 0 {
                // TUN writes are all-or-nothing per packet.
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if attempts < WRITE_RETRY_LIMIT => {
                    attempts += 1;
                    std::thread::sleep(WRITE_RETRY_DELAY);
                }
                _ => return Err(err),
            }
        }
    }
}

impl AsRawFd for VirtualInterface {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    /// Pipe-backed stand-in: the write end behaves like a packet sink,
    /// the read end lets the test observe what was written.
    fn pipe_pair() -> (VirtualInterface, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe2 fills the two descriptors on success.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        // SAFETY: both descriptors were just created and are unowned.
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        (VirtualInterface::from_fd(wr), rd)
    }

    #[test]
    fn write_packet_prepends_envelope() {
        let (dev, rd) = pipe_pair();
        dev.write_packet(&[0x45, 0x00, 0x00, 0x14]).unwrap();

        let reader = VirtualInterface::from_fd(rd);
        let mut buf = [0u8; 64];
        let n = reader.read_frame(&mut buf).unwrap();
        assert_eq!(n, TUN_PI_LEN + 4);
        assert_eq!(&buf[..TUN_PI_LEN], &[0, 0, 0x08, 0x00]);
        assert_eq!(&buf[TUN_PI_LEN..n], &[0x45, 0x00, 0x00, 0x14]);
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(VirtualInterface::create("").is_err());
        assert!(VirtualInterface::create("a-name-way-too-long-for-an-itf").is_err());
    }
}
