// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UNIX signals as poll-able events.
//!
//! Signal handlers may only touch async-signal-safe state, so delivery is
//! translated through a fixed-capacity non-blocking pipe: the handler
//! writes the signal number as one byte, the main loop registers the read
//! end with its poll and drains typed events at its own pace. A full pipe
//! drops the byte, which is fine: coalescing pending signals of the same
//! kind is exactly what signalfd-style consumers expect.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end of the pipe, reachable from the signal handler.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Typed event derived from a delivered signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT / SIGTERM / SIGQUIT: leave the main loop.
    Shutdown,
    /// SIGUSR1: dump per-session statistics at the next iteration.
    DumpStats,
    /// SIGUSR2: toggle log verbosity.
    ToggleDebug,
}

/// Read end of the signal pipe, registered with the main loop's poll.
#[derive(Debug)]
pub struct SignalPipe {
    read: OwnedFd,
}

extern "C" fn forward_signal(sig: libc::c_int) {
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        // SAFETY: write(2) is async-signal-safe; the buffer is one live byte.
        unsafe {
            libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
        }
    }
}

impl SignalPipe {
    /// Install handlers for `signals` and return the event source.
    pub fn install(signals: &[libc::c_int]) -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe2 fills the two descriptors on success.
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are unowned.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        // The write end is leaked into the handler on purpose; it lives
        // for the rest of the process.
        SIGNAL_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);
        std::mem::forget(write);

        for &sig in signals {
            set_handler(sig, forward_signal as libc::sighandler_t)?;
        }
        Ok(Self { read })
    }

    /// Server signal set: shutdown, stats dump and verbosity toggle;
    /// SIGHUP and SIGPIPE are ignored so a dropped TCP connection or a
    /// dying controlling terminal cannot kill the daemon.
    pub fn install_server() -> io::Result<Self> {
        let pipe = Self::install(&[
            libc::SIGINT,
            libc::SIGTERM,
            libc::SIGUSR1,
            libc::SIGUSR2,
        ])?;
        Self::ignore(libc::SIGHUP)?;
        Self::ignore(libc::SIGPIPE)?;
        Ok(pipe)
    }

    /// Client signal set: shutdown only.
    pub fn install_client() -> io::Result<Self> {
        Self::install(&[libc::SIGINT, libc::SIGTERM, libc::SIGQUIT])
    }

    /// Ignore a signal entirely (SIGPIPE, SIGHUP).
    pub fn ignore(sig: libc::c_int) -> io::Result<()> {
        set_handler(sig, libc::SIG_IGN)
    }

    /// Drain every pending signal into typed events.
    pub fn drain(&self) -> Vec<SignalEvent> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read into a live buffer of the stated length.
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &byte in &buf[..n as usize] {
                match libc::c_int::from(byte) {
                    libc::SIGINT | libc::SIGTERM | libc::SIGQUIT => {
                        out.push(SignalEvent::Shutdown);
                    }
                    libc::SIGUSR1 => out.push(SignalEvent::DumpStats),
                    libc::SIGUSR2 => out.push(SignalEvent::ToggleDebug),
                    other => log::debug!("[SIGNAL] ignoring unexpected signal {}", other),
                }
            }
        }
        out
    }
}

impl AsRawFd for SignalPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: zeroed sigaction is a valid starting point; sigemptyset
    // initializes the mask before sigaction reads the struct.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = handler;
        act.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn raised_signals_become_events() {
        let pipe = SignalPipe::install(&[libc::SIGUSR1, libc::SIGUSR2]).unwrap();

        // SAFETY: raising a handled signal in our own process.
        unsafe {
            libc::raise(libc::SIGUSR1);
            libc::raise(libc::SIGUSR2);
        }

        // Delivery is asynchronous; give it a moment.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while events.len() < 2 && Instant::now() < deadline {
            events.extend(pipe.drain());
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(events.contains(&SignalEvent::DumpStats));
        assert!(events.contains(&SignalEvent::ToggleDebug));
    }
}
