// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session control plane.
//!
//! A session is the full control+data relationship between one client and
//! the server. This module holds the pieces every thread can see: the
//! status block (mutex-guarded, supervisor-written) and the statistics
//! block (atomic counters). The TLS endpoint that drives the control
//! socket lives in [`endpoint`]; credential loading and TLS configuration
//! live in [`tls`].

pub mod endpoint;
pub mod tls;

use std::time::Instant;

use parking_lot::Mutex;

use crate::tunnel::stats::TunnelStats;

pub use endpoint::{SessionEndpoint, SessionError};

/// Lifecycle status. Transitions are monotonic: once a session is
/// `PendingDelete`, only the supervisor may move it on to freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionStatus {
    Connecting,
    Connected,
    PendingDelete,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::PendingDelete => write!(f, "pending delete"),
        }
    }
}

/// Fields guarded by the session status lock.
#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    pub status: SessionStatus,
    /// Last moment anything arrived on the control channel.
    pub last_read: Instant,
    /// Last moment anything was sent on the control channel.
    pub last_sent: Instant,
}

/// Shared per-session block: status under a plain mutex (single
/// supervisor writer, worker readers), statistics as relaxed atomics.
#[derive(Debug)]
pub struct SessionShared {
    state: Mutex<SessionState>,
    pub stats: TunnelStats,
}

impl SessionShared {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SessionState {
                status: SessionStatus::Connecting,
                last_read: now,
                last_sent: now,
            }),
            stats: TunnelStats::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Copy of the guarded fields, for timer decisions.
    pub fn state_snapshot(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move `Connecting` to `Connected`. Returns false if the session is
    /// already dying; status never moves backwards.
    pub fn mark_connected(&self) -> bool {
        let mut st = self.state.lock();
        if st.status != SessionStatus::Connecting {
            return false;
        }
        st.status = SessionStatus::Connected;
        true
    }

    /// Move the session toward teardown, from any state.
    pub fn mark_pending_delete(&self) {
        let mut st = self.state.lock();
        st.status = SessionStatus::PendingDelete;
    }

    pub fn touch_read(&self) {
        self.state.lock().last_read = Instant::now();
    }

    pub fn touch_sent(&self) {
        self.state.lock().last_sent = Instant::now();
    }

    /// Run `f` while holding the status lock (stats dumps snapshot under
    /// the lock so status and counters stay coherent).
    pub fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        let st = self.state.lock();
        f(&st)
    }
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Keepalive send threshold: a side sends KEEPALIVE after a third of the
/// negotiated timeout with nothing sent, rounded up.
pub fn keepalive_interval_secs(keepalive_timeout: u16) -> u64 {
    u64::from(keepalive_timeout).div_ceil(3)
}

/// Peer-death threshold: twice the negotiated timeout with nothing read.
pub fn dead_after_secs(keepalive_timeout: u16) -> u64 {
    u64::from(keepalive_timeout) * 2
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_monotonic() {
        let shared = SessionShared::new();
        assert_eq!(shared.status(), SessionStatus::Connecting);
        assert!(shared.mark_connected());
        assert_eq!(shared.status(), SessionStatus::Connected);

        shared.mark_pending_delete();
        assert_eq!(shared.status(), SessionStatus::PendingDelete);
        // No way back.
        assert!(!shared.mark_connected());
        assert_eq!(shared.status(), SessionStatus::PendingDelete);
    }

    #[test]
    fn connecting_session_can_die_directly() {
        let shared = SessionShared::new();
        shared.mark_pending_delete();
        assert!(!shared.mark_connected());
    }

    #[test]
    fn keepalive_thresholds() {
        assert_eq!(keepalive_interval_secs(60), 20);
        assert_eq!(keepalive_interval_secs(61), 21);
        assert_eq!(keepalive_interval_secs(1), 1);
        assert_eq!(dead_after_secs(60), 120);
    }
}
