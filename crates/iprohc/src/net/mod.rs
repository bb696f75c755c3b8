// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Kernel-facing plumbing: the TUN virtual interface, the IPPROTO_IPIP
//! raw socket, and the pump threads that feed device traffic into the
//! per-session pipes on the client side.
//!
//! Address assignment and MTU discovery on the host are deployment
//! concerns (up-script territory) and are deliberately not here.

pub mod raw;
pub mod reader;
pub mod tun;

use std::ffi::CString;
use std::io;

pub use raw::RawTunnelSocket;
pub use reader::ReaderHandle;
pub use tun::{VirtualInterface, TUN_PI_LEN};

/// Interface index of a named network interface, if it exists.
pub fn ifindex(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    // SAFETY: if_nametoindex reads a valid NUL-terminated string.
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("interface '{name}' does not exist"),
        ));
    }
    Ok(idx)
}

/// Set or clear O_NONBLOCK on a raw descriptor.
pub(crate) fn set_nonblocking_fd(fd: libc::c_int, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; F_GETFL/F_SETFL take no pointers.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_interface_exists() {
        assert!(ifindex("lo").is_ok());
    }

    #[test]
    fn missing_interface_is_reported() {
        assert!(ifindex("definitely-not-an-itf").is_err());
    }
}
