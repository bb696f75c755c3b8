// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-tunnel statistics block.
//!
//! Counters are relaxed atomics updated from the worker and router
//! threads; consumers only need monotonic snapshots. The packing
//! histogram is sized at negotiation time (index = packets per flushed
//! datagram) and sits behind a small mutex of its own.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct TunnelStats {
    pub comp_total: AtomicU64,
    pub comp_failed: AtomicU64,
    pub decomp_total: AtomicU64,
    pub decomp_failed: AtomicU64,
    pub unpack_failed: AtomicU64,
    /// Datagrams received on the raw path.
    pub total_received: AtomicU64,
    pub head_comp_size: AtomicU64,
    pub head_uncomp_size: AtomicU64,
    pub total_comp_size: AtomicU64,
    pub total_uncomp_size: AtomicU64,
    /// Packets the router dropped because this session's pipe was full.
    pub router_overrun: AtomicU64,
    packing_histogram: Mutex<Vec<u64>>,
}

/// Plain-value copy of the counters, taken for a stats dump.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub comp_total: u64,
    pub comp_failed: u64,
    pub decomp_total: u64,
    pub decomp_failed: u64,
    pub unpack_failed: u64,
    pub total_received: u64,
    pub head_comp_size: u64,
    pub head_uncomp_size: u64,
    pub total_comp_size: u64,
    pub total_uncomp_size: u64,
    pub router_overrun: u64,
    /// `packing_histogram[n]` = datagrams flushed with n packets inside.
    pub packing_histogram: Vec<u64>,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the packing histogram for the negotiated packing factor.
    pub fn init_packing(&self, packing: u8) {
        let mut hist = self.packing_histogram.lock();
        hist.clear();
        hist.resize(usize::from(packing) + 1, 0);
    }

    /// Record one flushed datagram carrying `count` packets.
    pub fn record_packing(&self, count: usize) {
        let mut hist = self.packing_histogram.lock();
        if hist.is_empty() {
            return;
        }
        let idx = count.min(hist.len() - 1);
        hist[idx] += 1;
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            comp_total: self.comp_total.load(Ordering::Relaxed),
            comp_failed: self.comp_failed.load(Ordering::Relaxed),
            decomp_total: self.decomp_total.load(Ordering::Relaxed),
            decomp_failed: self.decomp_failed.load(Ordering::Relaxed),
            unpack_failed: self.unpack_failed.load(Ordering::Relaxed),
            total_received: self.total_received.load(Ordering::Relaxed),
            head_comp_size: self.head_comp_size.load(Ordering::Relaxed),
            head_uncomp_size: self.head_uncomp_size.load(Ordering::Relaxed),
            total_comp_size: self.total_comp_size.load(Ordering::Relaxed),
            total_uncomp_size: self.total_uncomp_size.load(Ordering::Relaxed),
            router_overrun: self.router_overrun.load(Ordering::Relaxed),
            packing_histogram: self.packing_histogram.lock().clone(),
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = TunnelStats::new();
        TunnelStats::bump(&stats.comp_total);
        TunnelStats::bump(&stats.comp_total);
        TunnelStats::add(&stats.total_comp_size, 512);
        let snap = stats.snapshot();
        assert_eq!(snap.comp_total, 2);
        assert_eq!(snap.total_comp_size, 512);
        assert_eq!(snap.decomp_failed, 0);
    }

    #[test]
    fn histogram_counts_per_flush_size() {
        let stats = TunnelStats::new();
        stats.init_packing(5);
        stats.record_packing(1);
        stats.record_packing(5);
        stats.record_packing(5);
        let snap = stats.snapshot();
        assert_eq!(snap.packing_histogram.len(), 6);
        assert_eq!(snap.packing_histogram[1], 1);
        assert_eq!(snap.packing_histogram[5], 2);
    }

    #[test]
    fn histogram_before_init_is_ignored() {
        let stats = TunnelStats::new();
        stats.record_packing(3);
        assert!(stats.snapshot().packing_histogram.is_empty());
    }
}
