// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process logger: syslog plus a stderr mirror.
//!
//! Every record goes to syslog (facility daemon, ident set by the
//! binary). The stderr mirror is active from startup so operators see
//! early failures, and is silenced once the session is established.
//! Verbosity is the global `log` max level, toggled between Info and
//! Debug by SIGUSR2 or the `-d` flag.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

static STDERR_ENABLED: AtomicBool = AtomicBool::new(true);
/// openlog(3) keeps a pointer to the ident; it must live forever.
static IDENT: OnceLock<CString> = OnceLock::new();

struct SyslogLogger;

impl Log for SyslogLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = format!("{}", record.args());
        if let Ok(c_msg) = CString::new(msg.clone()) {
            // SAFETY: "%s" with one matching string argument.
            unsafe {
                libc::syslog(priority(record.level()), c"%s".as_ptr(), c_msg.as_ptr());
            }
        }
        if STDERR_ENABLED.load(Ordering::Relaxed) {
            eprintln!("[{:5}] {}", record.level(), msg);
        }
    }

    fn flush(&self) {}
}

fn priority(level: Level) -> libc::c_int {
    match level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        Level::Info => libc::LOG_INFO,
        Level::Debug | Level::Trace => libc::LOG_DEBUG,
    }
}

static SYSLOG_LOGGER: SyslogLogger = SyslogLogger;

/// Install the process logger. `debug` starts verbosity at Debug.
pub fn init(ident: &str, debug: bool) {
    let ident = IDENT.get_or_init(|| CString::new(ident).unwrap_or_default());
    // SAFETY: the ident string lives for the process lifetime (OnceLock).
    unsafe {
        libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
    }
    if log::set_logger(&SYSLOG_LOGGER).is_ok() {
        log::set_max_level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

/// Keep or silence the stderr mirror. Silenced once the tunnel session
/// is established.
pub fn set_stderr_enabled(enabled: bool) {
    STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Flip Info <-> Debug. Returns the level now in force.
pub fn toggle_debug() -> LevelFilter {
    let next = if log::max_level() == LevelFilter::Debug {
        LevelFilter::Info
    } else {
        LevelFilter::Debug
    };
    log::set_max_level(next);
    next
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_between_info_and_debug() {
        log::set_max_level(LevelFilter::Info);
        assert_eq!(toggle_debug(), LevelFilter::Debug);
        assert_eq!(toggle_debug(), LevelFilter::Info);
    }

    #[test]
    fn priorities_map_to_syslog_levels() {
        assert_eq!(priority(Level::Error), libc::LOG_ERR);
        assert_eq!(priority(Level::Info), libc::LOG_INFO);
        assert_eq!(priority(Level::Debug), libc::LOG_DEBUG);
    }
}
