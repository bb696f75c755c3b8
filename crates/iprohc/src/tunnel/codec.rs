// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Header-compression codec seam.
//!
//! The tunnel worker treats compression as bytes-in/bytes-out behind the
//! [`Compressor`] and [`Decompressor`] traits; the negotiated profile
//! decides the wire bytes. The built-in profile compresses each inner IP
//! packet as an independent deflate stream. Per-context state (CID table,
//! LSB windows) is a concern of richer profiles and stays behind the same
//! seam.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::tunnel::params::TunnelParams;

/// Hard ceiling on one decompressed inner packet. Anything larger than
/// the biggest IPv4 datagram is a corrupt or hostile stream.
const MAX_DECOMPRESSED_LEN: u64 = 65535;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The codec rejected the packet; the stream itself continues.
    #[error("codec rejected packet: {0}")]
    Reject(String),
    /// The input is not a packet the profile can represent at all.
    #[error("not a compressible IPv4 packet")]
    Malformed,
}

/// One compressed inner packet plus the size bookkeeping the statistics
/// block wants.
pub struct CompressedPacket {
    pub data: Vec<u8>,
    /// Length of the uncompressed IPv4 header (IHL x 4).
    pub header_uncomp_len: usize,
    /// Length of the compressed header stream. Whole-packet profiles have
    /// no separate header stream and report 0.
    pub header_comp_len: usize,
}

/// Compress one inner IP packet into zero or more wire packets.
///
/// The built-in profile is 1:1; profiles with context refresh may emit an
/// extra context packet, which is why the worker treats the output as a
/// batch contribution rather than a single element.
pub trait Compressor: Send {
    fn compress(&mut self, packet: &[u8]) -> Result<CompressedPacket, CodecError>;
}

/// Recover one inner IP packet from one wire packet.
pub trait Decompressor: Send {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Instantiate the compression side of the negotiated profile.
pub fn compressor_for(params: &TunnelParams) -> Box<dyn Compressor> {
    Box::new(DeflateCompressor {
        level: Compression::default(),
        _refresh: params.refresh,
    })
}

/// Instantiate the decompression side of the negotiated profile.
pub fn decompressor_for(_params: &TunnelParams) -> Box<dyn Decompressor> {
    Box::new(DeflateDecompressor)
}

/// Whole-packet deflate profile.
struct DeflateCompressor {
    level: Compression,
    _refresh: u16,
}

impl Compressor for DeflateCompressor {
    fn compress(&mut self, packet: &[u8]) -> Result<CompressedPacket, CodecError> {
        let header_uncomp_len = ipv4_header_len(packet).ok_or(CodecError::Malformed)?;
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(packet.len()), self.level);
        encoder
            .write_all(packet)
            .and_then(|()| encoder.finish())
            .map(|data| CompressedPacket {
                data,
                header_uncomp_len,
                header_comp_len: 0,
            })
            .map_err(|e| CodecError::Reject(e.to_string()))
    }
}

struct DeflateDecompressor;

impl Decompressor for DeflateDecompressor {
    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut decoder = DeflateDecoder::new(data).take(MAX_DECOMPRESSED_LEN + 1);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Reject(e.to_string()))?;
        if out.len() as u64 > MAX_DECOMPRESSED_LEN {
            return Err(CodecError::Reject("decompressed packet too large".into()));
        }
        if ipv4_header_len(&out).is_none() {
            return Err(CodecError::Reject("output is not an IPv4 packet".into()));
        }
        Ok(out)
    }
}

/// Header length of a plausible IPv4 packet, or None.
fn ipv4_header_len(packet: &[u8]) -> Option<usize> {
    let first = *packet.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = ((first & 0x0f) as usize) * 4;
    if ihl < 20 || packet.len() < ihl {
        return None;
    }
    Some(ihl)
}

// ===== Tests =====
