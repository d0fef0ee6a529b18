//! Length-prefixed serial framing for Meshtastic protobuf envelopes.
//!
//! Every binary message on the wired serial link is emitted as:
//!
//!   `<magic0><magic1><len_hi><len_lo><protobuf bytes>`
//!
//! Two firmware generations use different magic pairs (`0x94 0xC3` legacy, `0x44 0x03`
//! for 2.1). The length is big-endian and counts only the protobuf bytes.
//!
//! This module provides the stateless helpers used by the decoder and the write path, plus
//! a small incremental accumulator that can be fed arbitrary serial chunks and yields whole
//! frames when available.
use bytes::{Buf, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const HEADER_LEN: usize = 4;

/// Legacy (and current default) frame magic.
pub const LEGACY_MAGIC: [u8; 2] = [0x94, 0xC3];
/// Frame magic emitted by 2.1 firmware.
pub const V21_MAGIC: [u8; 2] = [0x44, 0x03];

/// Largest payload representable by the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame: header declares {declared} bytes but only {available} follow")]
    Incomplete { declared: usize, available: usize },
    #[error("payload of {len} bytes exceeds the 16-bit frame length field")]
    TooLarge { len: usize },
}

/// Protocol generation selected by the version tag given on the command line or in config.
///
/// `""` and `"latest"` are synonyms. Both generations share one message schema today; the
/// tag only changes which magic pair outgoing frames carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtoVersion {
    #[default]
    Latest,
    V2_1,
}

/// Rejected protocol version tag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported proto version: {0}")]
pub struct UnsupportedVersion(pub String);

impl FromStr for ProtoVersion {
    type Err = UnsupportedVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "latest" => Ok(ProtoVersion::Latest),
            "2.1" => Ok(ProtoVersion::V2_1),
            other => Err(UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoVersion::Latest => f.write_str("latest"),
            ProtoVersion::V2_1 => f.write_str("2.1"),
        }
    }
}

impl ProtoVersion {
    /// Magic pair written at the start of outgoing frames.
    pub fn magic(self) -> [u8; 2] {
        match self {
            ProtoVersion::Latest => LEGACY_MAGIC,
            ProtoVersion::V2_1 => V21_MAGIC,
        }
    }
}

fn is_magic(b0: u8, b1: u8) -> bool {
    [b0, b1] == LEGACY_MAGIC || [b0, b1] == V21_MAGIC
}

/// Strip a frame header if one is present.
///
/// Buffers that start with either magic pair must contain the full declared payload;
/// anything after it is ignored. Buffers without a recognizable header are returned
/// unchanged, as callers may hand over payloads that were already de-framed.
pub fn deframe(raw: &[u8]) -> Result<&[u8], FrameError> {
    if raw.len() < HEADER_LEN || !is_magic(raw[0], raw[1]) {
        return Ok(raw);
    }
    let declared = ((raw[2] as usize) << 8) | raw[3] as usize;
    let available = raw.len() - HEADER_LEN;
    if available < declared {
        return Err(FrameError::Incomplete {
            declared,
            available,
        });
    }
    Ok(&raw[HEADER_LEN..HEADER_LEN + declared])
}

/// Prepend the version's header to `payload`.
pub fn encode_frame(version: ProtoVersion, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }
    let magic = version.magic();
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(magic[0]);
    frame.push(magic[1]);
    frame.push(((payload.len() >> 8) & 0xFF) as u8);
    frame.push((payload.len() & 0xFF) as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental frame extractor for the serial read loop.
///
/// Bytes that cannot start a frame (debug console text, line noise, truncated frames)
/// are discarded while realigning to the next magic pair.
pub struct FrameAccumulator {
    buf: BytesMut,
    discarded: u64,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            discarded: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered and not yet part of a returned frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Total number of bytes dropped while searching for frame headers.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn drop_front(&mut self, n: usize) {
        self.buf.advance(n);
        self.discarded += n as u64;
    }

    /// Extract the next complete frame payload (header removed), if one is buffered.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < 2 {
                return None;
            }
            // Realign to a header if needed
            if !is_magic(self.buf[0], self.buf[1]) {
                let next = self
                    .buf
                    .windows(2)
                    .position(|w| is_magic(w[0], w[1]));
                match next {
                    Some(pos) => self.drop_front(pos),
                    None => {
                        // Keep a trailing first magic byte; its partner may be in the next chunk.
                        let last = self.buf[self.buf.len() - 1];
                        let keep = usize::from(last == LEGACY_MAGIC[0] || last == V21_MAGIC[0]);
                        let n = self.buf.len() - keep;
                        self.drop_front(n);
                        return None;
                    }
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            // The 16-bit field already caps the length; an empty frame is a false match
            if declared == 0 {
                self.drop_front(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags_parse() {
        assert_eq!("".parse::<ProtoVersion>(), Ok(ProtoVersion::Latest));
        assert_eq!("latest".parse::<ProtoVersion>(), Ok(ProtoVersion::Latest));
        assert_eq!("2.1".parse::<ProtoVersion>(), Ok(ProtoVersion::V2_1));
        assert_eq!(
            "2.0".parse::<ProtoVersion>(),
            Err(UnsupportedVersion("2.0".to_string()))
        );
        assert!("LATEST".parse::<ProtoVersion>().is_err());
    }

    #[test]
    fn encode_uses_version_magic_and_big_endian_length() {
        let payload = vec![0xAB; 0x0102];
        let legacy = encode_frame(ProtoVersion::Latest, &payload).unwrap();
        assert_eq!(&legacy[..4], &[0x94, 0xC3, 0x01, 0x02]);
        let v21 = encode_frame(ProtoVersion::V2_1, &payload).unwrap();
        assert_eq!(&v21[..4], &[0x44, 0x03, 0x01, 0x02]);
        assert_eq!(&v21[4..], &payload[..]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode_frame(ProtoVersion::Latest, &payload),
            Err(FrameError::TooLarge {
                len: MAX_PAYLOAD_LEN + 1
            })
        );
        assert!(encode_frame(ProtoVersion::Latest, &payload[..MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn deframe_passes_through_bare_payload() {
        let bare = [0x12, 0x03, 0x22, 0x01, 0x08];
        assert_eq!(deframe(&bare).unwrap(), &bare[..]);
        // Too short to carry a header even if the magic matches
        assert_eq!(deframe(&[0x94, 0xC3, 0x00]).unwrap(), &[0x94, 0xC3, 0x00][..]);
    }

    #[test]
    fn deframe_reports_incomplete_frame() {
        let err = deframe(&[0x44, 0x03, 0x00, 0x05, 1, 2]).unwrap_err();
        assert_eq!(
            err,
            FrameError::Incomplete {
                declared: 5,
                available: 2
            }
        );
    }

    #[test]
    fn deframe_ignores_trailing_bytes() {
        let framed = [0x94, 0xC3, 0x00, 0x02, 7, 8, 9, 9];
        assert_eq!(deframe(&framed).unwrap(), &[7, 8][..]);
    }

    #[test]
    fn accumulator_handles_split_chunks_and_noise() {
        let mut acc = FrameAccumulator::new();
        let frame = encode_frame(ProtoVersion::Latest, b"abc").unwrap();
        acc.push(b"boot log line\r\n");
        acc.push(&frame[..3]);
        assert_eq!(acc.next_frame(), None);
        acc.push(&frame[3..]);
        assert_eq!(acc.next_frame(), Some(b"abc".to_vec()));
        assert_eq!(acc.next_frame(), None);
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.discarded(), b"boot log line\r\n".len() as u64);
    }

    #[test]
    fn accumulator_yields_mixed_generations_in_order() {
        let mut acc = FrameAccumulator::new();
        let mut stream = encode_frame(ProtoVersion::V2_1, b"one").unwrap();
        stream.extend(encode_frame(ProtoVersion::Latest, b"two").unwrap());
        acc.push(&stream);
        assert_eq!(acc.next_frame(), Some(b"one".to_vec()));
        assert_eq!(acc.next_frame(), Some(b"two".to_vec()));
        assert_eq!(acc.next_frame(), None);
    }

    #[test]
    fn accumulator_skips_zero_length_header() {
        let mut acc = FrameAccumulator::new();
        acc.push(&[0x94, 0xC3, 0x00, 0x00]);
        acc.push(&encode_frame(ProtoVersion::Latest, b"ok").unwrap());
        assert_eq!(acc.next_frame(), Some(b"ok".to_vec()));
    }

    #[test]
    fn accumulator_accepts_frames_up_to_the_length_field_limit() {
        let mut acc = FrameAccumulator::new();
        let big = vec![0x5A; 9000];
        let max = vec![0x11; MAX_PAYLOAD_LEN];
        let frame = encode_frame(ProtoVersion::V2_1, &big).unwrap();
        for chunk in frame.chunks(1024) {
            acc.push(chunk);
        }
        acc.push(&encode_frame(ProtoVersion::Latest, &max).unwrap());
        assert_eq!(acc.next_frame(), Some(big));
        assert_eq!(acc.next_frame(), Some(max));
        assert_eq!(acc.discarded(), 0);
    }

    #[test]
    fn accumulator_keeps_split_magic() {
        let mut acc = FrameAccumulator::new();
        let frame = encode_frame(ProtoVersion::Latest, b"x").unwrap();
        acc.push(&[b'z', frame[0]]);
        assert_eq!(acc.next_frame(), None);
        acc.push(&frame[1..]);
        assert_eq!(acc.next_frame(), Some(b"x".to_vec()));
    }
}
