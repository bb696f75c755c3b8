// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec for the TLS control channel.
//!
//! Wire format (protocol version 1):
//!
//! ```text
//! +--------+------------------------------------------+
//! | opcode | TLV block (CONNECT / CONNECT_OK / _KO)   |
//! +--------+------------------------------------------+
//! ```
//!
//! Each TLV entry is one type byte, a 16-bit big-endian length and
//! `length` value bytes; the block ends with an END entry (type 0x00,
//! length 0). KEEPALIVE and DISCONNECT are bare opcodes.
//!
//! Unknown TLV types inside a known message are skipped silently so that
//! newer peers can add fields. A malformed or oversized TLV is a protocol
//! error and tears the session down.

use std::fmt;
use std::net::Ipv4Addr;

use crate::tunnel::params::{CompatVersion, TunnelParams};

/// Opcode bytes. Fixed on the wire; existing deployments depend on them.
pub const OP_CONNECT: u8 = 0x43; // 'C'
pub const OP_CONNECT_OK: u8 = 0x63; // 'c'
pub const OP_CONNECT_KO: u8 = 0x6B; // 'k'
pub const OP_KEEPALIVE: u8 = 0x4B; // 'K'
pub const OP_DISCONNECT: u8 = 0x44; // 'D'

/// TLV type bytes (protocol version 1).
const TLV_END: u8 = 0x00;
const TLV_TUNNEL_ADDR: u8 = 0x01;
const TLV_PACKING: u8 = 0x02;
const TLV_MAX_CID: u8 = 0x03;
const TLV_UNIDIRECTIONAL: u8 = 0x04;
const TLV_WINDOW_WIDTH: u8 = 0x05;
const TLV_REFRESH: u8 = 0x06;
const TLV_KEEPALIVE: u8 = 0x07;
const TLV_COMPAT: u8 = 0x08;
const TLV_REASON: u8 = 0x09;

/// Upper bound on one encoded frame. A frame that cannot complete within
/// this many buffered bytes is treated as malformed rather than pending.
pub const MAX_FRAME_LEN: usize = 1024;

/// Decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client connection request, with an optional forced packing factor.
    Connect { packing: Option<u8> },
    /// Server acceptance: assigned tunnel address plus the authoritative
    /// tunnel parameters.
    ConnectOk {
        addr: Ipv4Addr,
        params: TunnelParams,
    },
    /// Server refusal with a human-readable reason.
    ConnectKo { reason: String },
    /// Liveness probe, sent by both sides.
    Keepalive,
    /// Orderly teardown, sent by both sides.
    Disconnect,
}

/// Control-channel protocol errors. All of them are fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("frame truncated: TLV block ended before its END entry")]
    Truncated,
    #[error("frame exceeds {MAX_FRAME_LEN} bytes without completing")]
    Oversized,
    #[error("TLV type 0x{tlv:02x} has invalid length {len}")]
    BadTlvLength { tlv: u8, len: usize },
    #[error("message is missing mandatory field 0x{0:02x}")]
    MissingField(u8),
    #[error("message carries an invalid value: {0}")]
    BadValue(&'static str),
}

impl Frame {
    /// Encode the frame into its on-wire byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Frame::Connect { packing } => {
                buf.push(OP_CONNECT);
                if let Some(p) = packing {
                    put_tlv(&mut buf, TLV_PACKING, &[*p]);
                }
                put_end(&mut buf);
            }
            Frame::ConnectOk { addr, params } => {
                buf.push(OP_CONNECT_OK);
                put_tlv(&mut buf, TLV_TUNNEL_ADDR, &addr.octets());
                put_tlv(&mut buf, TLV_PACKING, &[params.packing]);
                put_tlv(&mut buf, TLV_MAX_CID, &params.max_cid.to_be_bytes());
                put_tlv(
                    &mut buf,
                    TLV_UNIDIRECTIONAL,
                    &[u8::from(params.is_unidirectional)],
                );
                put_tlv(
                    &mut buf,
                    TLV_WINDOW_WIDTH,
                    &params.wlsb_window_width.to_be_bytes(),
                );
                put_tlv(&mut buf, TLV_REFRESH, &params.refresh.to_be_bytes());
                put_tlv(
                    &mut buf,
                    TLV_KEEPALIVE,
                    &params.keepalive_timeout.to_be_bytes(),
                );
                put_tlv(&mut buf, TLV_COMPAT, &[params.compat as u8]);
                put_end(&mut buf);
            }
            Frame::ConnectKo { reason } => {
                buf.push(OP_CONNECT_KO);
                let reason = reason.as_bytes();
                let reason = &reason[..reason.len().min(MAX_FRAME_LEN - 8)];
                put_tlv(&mut buf, TLV_REASON, reason);
                put_end(&mut buf);
            }
            Frame::Keepalive => buf.push(OP_KEEPALIVE),
            Frame::Disconnect => buf.push(OP_DISCONNECT),
        }
        buf
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some((frame, consumed)))` when a complete frame is
    /// available; the caller must advance the stream by exactly
    /// `consumed` bytes. Returns `Ok(None)` when more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let Some(&opcode) = buf.first() else {
            return Ok(None);
        };
        match opcode {
            OP_KEEPALIVE => Ok(Some((Frame::Keepalive, 1))),
            OP_DISCONNECT => Ok(Some((Frame::Disconnect, 1))),
            OP_CONNECT | OP_CONNECT_OK | OP_CONNECT_KO => {
                let block = match TlvBlock::parse(&buf[1..])? {
                    Some(block) => block,
                    None => {
                        // Incomplete: either still arriving, or never going
                        // to complete within the frame bound.
                        if buf.len() >= MAX_FRAME_LEN {
                            return Err(FrameError::Oversized);
                        }
                        return Ok(None);
                    }
                };
                let consumed = 1 + block.consumed;
                let frame = match opcode {
                    OP_CONNECT => Frame::Connect {
                        packing: block.get_u8(TLV_PACKING)?,
                    },
                    OP_CONNECT_OK => Frame::ConnectOk {
                        addr: block.require_addr(TLV_TUNNEL_ADDR)?,
                        params: TunnelParams {
                            packing: block.require_u8(TLV_PACKING)?,
                            max_cid: block.require_u16(TLV_MAX_CID)?,
                            is_unidirectional: block.require_u8(TLV_UNIDIRECTIONAL)? != 0,
                            wlsb_window_width: block.require_u16(TLV_WINDOW_WIDTH)?,
                            refresh: block.require_u16(TLV_REFRESH)?,
                            keepalive_timeout: block.require_u16(TLV_KEEPALIVE)?,
                            compat: CompatVersion::from_wire(block.require_u8(TLV_COMPAT)?)
                                .ok_or(FrameError::BadValue("codec compatibility version"))?,
                        },
                    },
                    _ => Frame::ConnectKo {
                        reason: String::from_utf8_lossy(
                            block.get_bytes(TLV_REASON).unwrap_or(&[]),
                        )
                        .into_owned(),
                    },
                };
                Ok(Some((frame, consumed)))
            }
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    /// Opcode of this frame, for logging.
    pub fn opcode(&self) -> u8 {
        match self {
            Frame::Connect { .. } => OP_CONNECT,
            Frame::ConnectOk { .. } => OP_CONNECT_OK,
            Frame::ConnectKo { .. } => OP_CONNECT_KO,
            Frame::Keepalive => OP_KEEPALIVE,
            Frame::Disconnect => OP_DISCONNECT,
        }
    }

    /// Message name, for logs and error reasons.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "CONNECT",
            Frame::ConnectOk { .. } => "CONNECT_OK",
            Frame::ConnectKo { .. } => "CONNECT_KO",
            Frame::Keepalive => "KEEPALIVE",
            Frame::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn put_tlv(buf: &mut Vec<u8>, tlv: u8, value: &[u8]) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.push(tlv);
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}

fn put_end(buf: &mut Vec<u8>) {
    buf.push(TLV_END);
    buf.extend_from_slice(&0u16.to_be_bytes());
}

/// A parsed TLV block: known entries collected, unknown entries skipped.
struct TlvBlock<'a> {
    entries: Vec<(u8, &'a [u8])>,
    consumed: usize,
}

impl<'a> TlvBlock<'a> {
    /// Walk the block up to and including its END entry.
    ///
    /// `Ok(None)` means the block is incomplete (more stream bytes may
    /// still arrive); length errors are reported immediately because no
    /// amount of further bytes can repair them.
    fn parse(buf: &'a [u8]) -> Result<Option<TlvBlock<'a>>, FrameError> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        loop {
            let Some(&tlv) = buf.get(pos) else {
                return Ok(None);
            };
            if tlv == TLV_END {
                if buf.len() < pos + 3 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]) as usize;
                if len != 0 {
                    return Err(FrameError::BadTlvLength { tlv, len });
                }
                return Ok(Some(TlvBlock {
                    entries,
                    consumed: pos + 3,
                }));
            }
            if buf.len() < pos + 3 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::BadTlvLength { tlv, len });
            }
            if buf.len() < pos + 3 + len {
                return Ok(None);
            }
            entries.push((tlv, &buf[pos + 3..pos + 3 + len]));
            pos += 3 + len;
        }
    }

    fn get_bytes(&self, tlv: u8) -> Option<&'a [u8]> {
        self.entries.iter().find(|(t, _)| *t == tlv).map(|(_, v)| *v)
    }

    fn get_u8(&self, tlv: u8) -> Result<Option<u8>, FrameError> {
        match self.get_bytes(tlv) {
            None => Ok(None),
            Some([v]) => Ok(Some(*v)),
            Some(v) => Err(FrameError::BadTlvLength { tlv, len: v.len() }),
        }
    }

    fn require_u8(&self, tlv: u8) -> Result<u8, FrameError> {
        self.get_u8(tlv)?.ok_or(FrameError::MissingField(tlv))
    }

    fn require_u16(&self, tlv: u8) -> Result<u16, FrameError> {
        match self.get_bytes(tlv) {
            None => Err(FrameError::MissingField(tlv)),
            Some([hi, lo]) => Ok(u16::from_be_bytes([*hi, *lo])),
            Some(v) => Err(FrameError::BadTlvLength { tlv, len: v.len() }),
        }
    }

    fn require_addr(&self, tlv: u8) -> Result<Ipv4Addr, FrameError> {
        match self.get_bytes(tlv) {
            None => Err(FrameError::MissingField(tlv)),
            Some(&[a, b, c, d]) => Ok(Ipv4Addr::new(a, b, c, d)),
            Some(v) => Err(FrameError::BadTlvLength { tlv, len: v.len() }),
        }
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> TunnelParams {
        TunnelParams {
            packing: 5,
            max_cid: 14,
            is_unidirectional: true,
            wlsb_window_width: 23,
            refresh: 9,
            keepalive_timeout: 60,
            compat: CompatVersion::V1,
        }
    }

    #[test]
    fn bare_opcodes_round_trip() {
        for frame in [Frame::Keepalive, Frame::Disconnect] {
            let wire = frame.encode();
            assert_eq!(wire.len(), 1);
            let (decoded, used) = Frame::decode(&wire).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, wire.len());
        }
    }

    #[test]
    fn connect_round_trip() {
        for packing in [None, Some(3)] {
            let frame = Frame::Connect { packing };
            let wire = frame.encode();
            let (decoded, used) = Frame::decode(&wire).unwrap().unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(used, wire.len());
        }
    }

    #[test]
    fn connect_ok_round_trip() {
        let frame = Frame::ConnectOk {
            addr: Ipv4Addr::new(192, 168, 99, 2),
            params: sample_params(),
        };
        let wire = frame.encode();
        let (decoded, used) = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn connect_ko_round_trip() {
        let frame = Frame::ConnectKo {
            reason: "no address available".to_string(),
        };
        let wire = frame.encode();
        let (decoded, used) = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(used, wire.len());
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let mut wire = Frame::Keepalive.encode();
        wire.extend_from_slice(&Frame::Disconnect.encode());
        let (first, used) = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(first, Frame::Keepalive);
        let (second, used2) = Frame::decode(&wire[used..]).unwrap().unwrap();
        assert_eq!(second, Frame::Disconnect);
        assert_eq!(used + used2, wire.len());
    }

    #[test]
    fn unknown_tlv_is_skipped() {
        let mut wire = vec![OP_CONNECT];
        // A future TLV type the current decoder has never heard of.
        wire.push(0x7f);
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[1, 2, 3, 4]);
        wire.push(TLV_PACKING);
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.push(7);
        wire.push(TLV_END);
        wire.extend_from_slice(&0u16.to_be_bytes());

        let (frame, used) = Frame::decode(&wire).unwrap().unwrap();
        assert_eq!(frame, Frame::Connect { packing: Some(7) });
        assert_eq!(used, wire.len());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let wire = Frame::ConnectKo {
            reason: "try again".to_string(),
        }
        .encode();
        for cut in 1..wire.len() {
            assert!(Frame::decode(&wire[..cut]).unwrap().is_none(), "cut={cut}");
        }
    }

    #[test]
    fn oversized_tlv_length_is_rejected() {
        let mut wire = vec![OP_CONNECT, TLV_PACKING];
        wire.extend_from_slice(&(MAX_FRAME_LEN as u16 + 1).to_be_bytes());
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::BadTlvLength { .. })
        ));
    }

    #[test]
    fn runaway_frame_is_rejected() {
        // A stream that never reaches END within the frame bound.
        let mut wire = vec![OP_CONNECT];
        while wire.len() < MAX_FRAME_LEN + 8 {
            wire.push(0x70);
            wire.extend_from_slice(&1u16.to_be_bytes());
            wire.push(0);
        }
        // Remove the trailing bytes so the block stays incomplete.
        wire.truncate(MAX_FRAME_LEN + 2);
        assert!(matches!(Frame::decode(&wire), Err(FrameError::Oversized)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(
            Frame::decode(&[0x5a]),
            Err(FrameError::UnknownOpcode(0x5a))
        ));
    }

    #[test]
    fn wrong_field_width_is_rejected() {
        let mut wire = vec![OP_CONNECT, TLV_PACKING];
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(&[1, 2]);
        wire.push(TLV_END);
        wire.extend_from_slice(&0u16.to_be_bytes());
        assert!(matches!(
            Frame::decode(&wire),
            Err(FrameError::BadTlvLength { tlv: TLV_PACKING, len: 2 })
        ));
    }
}
