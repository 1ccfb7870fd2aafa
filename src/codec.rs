//! Optional data-stream codec for the bridge.
//!
//! Payloads worth compressing are deflated and tagged with a two-byte
//! `1B 43` prefix; everything else passes through untagged. Small chunks
//! (< 64 bytes) and chunks whose deflated form is not at least 20% smaller
//! are sent as-is. The decompressor keys off the prefix alone, so
//! pass-through payloads must not begin with `1B 43` — PPP frames open with
//! `7E` or `FF`, which keeps the tag unambiguous in practice.
//!
//! The bridge only arms the codec when both sides agreed during command-mode
//! setup; see the `enable_compression` config switch and `AT%C`.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Tag marking a deflated payload.
pub const CODEC_PREFIX: [u8; 2] = [0x1B, 0x43];

/// Chunks below this size are never compressed.
const MIN_COMPRESS_LEN: usize = 64;

/// Deflate-based chunk codec.
#[derive(Debug, Clone, Copy)]
pub struct StreamCodec {
    level: Compression,
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCodec {
    pub fn new() -> Self {
        // Latency matters more than ratio on a modem-speed link
        Self {
            level: Compression::fast(),
        }
    }

    /// Compress a chunk, or pass it through when compression does not pay.
    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        if data.len() < MIN_COMPRESS_LEN {
            return data.to_vec();
        }
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), self.level);
        if encoder.write_all(data).is_err() {
            return data.to_vec();
        }
        let Ok(deflated) = encoder.finish() else {
            return data.to_vec();
        };
        // Tagged form must be at least 20% smaller to be worth sending
        if (deflated.len() + CODEC_PREFIX.len()) * 5 >= data.len() * 4 {
            return data.to_vec();
        }
        let mut out = Vec::with_capacity(deflated.len() + CODEC_PREFIX.len());
        out.extend_from_slice(&CODEC_PREFIX);
        out.extend_from_slice(&deflated);
        out
    }

    /// Inverse of [`StreamCodec::compress`].
    pub fn decompress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let Some(body) = data.strip_prefix(&CODEC_PREFIX[..]) else {
            return Ok(data.to_vec());
        };
        let mut out = Vec::with_capacity(body.len() * 2);
        DeflateDecoder::new(body).read_to_end(&mut out)?;
        Ok(out)
    }
}
