// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Negotiated tunnel parameters.
//!
//! The server owns every parameter; the client may only bid a smaller
//! packing factor. Values travel in CONNECT_OK and are validated on both
//! sides before a tunnel worker is started.

use std::fmt;

/// Codec compatibility version accepted from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompatVersion {
    V1 = 1,
    V2 = 2,
}

impl CompatVersion {
    /// Map a wire byte onto a known version.
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            1 => Some(CompatVersion::V1),
            2 => Some(CompatVersion::V2),
            _ => None,
        }
    }
}

impl fmt::Display for CompatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Parameter set for one tunnel, as negotiated over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelParams {
    /// Max compressed packets concatenated into one data-channel datagram.
    pub packing: u8,
    /// Largest header-compression context identifier (0..=16383).
    pub max_cid: u16,
    /// Whether the compression profile runs without a feedback channel.
    pub is_unidirectional: bool,
    /// Window width for least-significant-bit encoding.
    pub wlsb_window_width: u16,
    /// Compression context refresh interval.
    pub refresh: u16,
    /// Keepalive timeout in seconds.
    pub keepalive_timeout: u16,
    /// Codec compatibility version.
    pub compat: CompatVersion,
}

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("packing factor must be in 1..=255")]
    BadPacking,
    #[error("max_cid {0} exceeds 16383")]
    BadMaxCid(u16),
    #[error("keepalive timeout must be non-zero")]
    BadKeepalive,
}

impl Default for TunnelParams {
    /// Server defaults, overridable from the configuration file.
    fn default() -> Self {
        Self {
            packing: 5,
            max_cid: 14,
            is_unidirectional: true,
            wlsb_window_width: 23,
            refresh: 9,
            keepalive_timeout: 60,
            compat: CompatVersion::V1,
        }
    }
}

impl TunnelParams {
    /// Check the ranges the protocol allows.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.packing == 0 {
            return Err(ParamsError::BadPacking);
        }
        if self.max_cid > 16383 {
            return Err(ParamsError::BadMaxCid(self.max_cid));
        }
        if self.keepalive_timeout == 0 {
            return Err(ParamsError::BadKeepalive);
        }
        Ok(())
    }

    /// Apply the negotiation rule to a client bid.
    ///
    /// The server value is authoritative; a non-zero client request may
    /// only lower the packing factor. Everything else is returned as-is.
    pub fn negotiate(&self, requested_packing: Option<u8>) -> Self {
        let mut out = *self;
        if let Some(req) = requested_packing {
            if req != 0 {
                out.packing = out.packing.min(req);
            }
        }
        out
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TunnelParams::default().validate().unwrap();
    }

    #[test]
    fn client_bid_lowers_packing() {
        let server = TunnelParams::default();
        assert_eq!(server.negotiate(Some(3)).packing, 3);
    }

    #[test]
    fn client_bid_cannot_raise_packing() {
        let server = TunnelParams::default();
        assert_eq!(server.negotiate(Some(200)).packing, server.packing);
    }

    #[test]
    fn zero_or_absent_bid_keeps_server_value() {
        let server = TunnelParams::default();
        assert_eq!(server.negotiate(Some(0)).packing, server.packing);
        assert_eq!(server.negotiate(None).packing, server.packing);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut p = TunnelParams::default();
        p.max_cid = 16384;
        assert!(p.validate().is_err());
        let mut p = TunnelParams::default();
        p.packing = 0;
        assert!(p.validate().is_err());
        let mut p = TunnelParams::default();
        p.keepalive_timeout = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn compat_wire_mapping() {
        assert_eq!(CompatVersion::from_wire(1), Some(CompatVersion::V1));
        assert_eq!(CompatVersion::from_wire(2), Some(CompatVersion::V2));
        assert_eq!(CompatVersion::from_wire(3), None);
    }
}
