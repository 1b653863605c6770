//! The 76-byte session handshake header.
//!
//! The first bytes the on-device agent writes on the video socket
//! describe the device and the initial frame geometry:
//!
//! ```text
//! bytes[0..63]   device name, NUL-padded UTF-8 (byte 63 forced NUL)
//! bytes[64..67]  codec identifier (single fixed codec — ignored)
//! bytes[68..71]  frame width,  big-endian u32
//! bytes[72..75]  frame height, big-endian u32
//! ```
//!
//! TCP gives no framing guarantees, so [`HandshakeAccumulator`]
//! collects partial reads until the full header is buffered; a short
//! buffer is not an error. Bytes past the header belong to the video
//! stream and are handed back via [`HandshakeAccumulator::into_remainder`].

use bytes::{Bytes, BytesMut};

/// Width of the NUL-padded device-name field.
pub const DEVICE_NAME_FIELD_LEN: usize = 64;

/// Total handshake header length on the wire.
pub const HANDSHAKE_LEN: usize = DEVICE_NAME_FIELD_LEN + 12;

// ── HandshakeHeader ──────────────────────────────────────────────

/// Parsed handshake header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Human-readable device name (invalid UTF-8 replaced).
    pub device_name: String,
    /// Codec identifier. Carried on the wire but not interpreted.
    pub codec_id: u32,
    /// Initial frame width in pixels.
    pub width: u32,
    /// Initial frame height in pixels.
    pub height: u32,
}

impl HandshakeHeader {
    /// Parse a complete header.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Self {
        let mut name = buf[..DEVICE_NAME_FIELD_LEN].to_vec();
        // In case the agent sends garbage instead of a terminator.
        name[DEVICE_NAME_FIELD_LEN - 1] = 0;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let device_name = String::from_utf8_lossy(&name[..end]).into_owned();

        Self {
            device_name,
            codec_id: read_u32_be(&buf[DEVICE_NAME_FIELD_LEN..]),
            width: read_u32_be(&buf[DEVICE_NAME_FIELD_LEN + 4..]),
            height: read_u32_be(&buf[DEVICE_NAME_FIELD_LEN + 8..]),
        }
    }

    /// Serialize a header (agent side / tests).
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let name = self.device_name.as_bytes();
        let n = name.len().min(DEVICE_NAME_FIELD_LEN - 1);
        buf[..n].copy_from_slice(&name[..n]);
        buf[DEVICE_NAME_FIELD_LEN..DEVICE_NAME_FIELD_LEN + 4]
            .copy_from_slice(&self.codec_id.to_be_bytes());
        buf[DEVICE_NAME_FIELD_LEN + 4..DEVICE_NAME_FIELD_LEN + 8]
            .copy_from_slice(&self.width.to_be_bytes());
        buf[DEVICE_NAME_FIELD_LEN + 8..DEVICE_NAME_FIELD_LEN + 12]
            .copy_from_slice(&self.height.to_be_bytes());
        buf
    }
}

fn read_u32_be(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf[..4].try_into().expect("slice of 4"))
}

// ── HandshakeAccumulator ─────────────────────────────────────────

/// Accumulates socket reads until the full 76-byte header is buffered.
///
/// The parser completes exactly once, regardless of how the header is
/// fragmented across reads.
#[derive(Debug, Default)]
pub struct HandshakeAccumulator {
    buf: BytesMut,
    parsed: bool,
}

impl HandshakeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the header once enough bytes arrived.
    ///
    /// Returns `None` while the buffer is still short of 76 bytes, and
    /// on every call after the header was already produced.
    pub fn push(&mut self, chunk: &[u8]) -> Option<HandshakeHeader> {
        if self.parsed {
            return None;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() < HANDSHAKE_LEN {
            return None;
        }

        let mut header = [0u8; HANDSHAKE_LEN];
        header.copy_from_slice(&self.buf[..HANDSHAKE_LEN]);
        let _ = self.buf.split_to(HANDSHAKE_LEN);
        self.parsed = true;
        Some(HandshakeHeader::parse(&header))
    }

    /// Whether the header has been produced.
    pub fn is_complete(&self) -> bool {
        self.parsed
    }

    /// Bytes still needed before the header can be parsed.
    pub fn bytes_needed(&self) -> usize {
        HANDSHAKE_LEN.saturating_sub(self.buf.len())
    }

    /// Bytes received past the header — the start of the video stream.
    pub fn into_remainder(self) -> Bytes {
        self.buf.freeze()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HandshakeHeader {
        HandshakeHeader {
            device_name: "Pixel 7".into(),
            codec_id: 0x6832_3634, // "h264"
            width: 1080,
            height: 2400,
        }
    }

    #[test]
    fn roundtrip_single_chunk() {
        let wire = sample().encode();
        let mut acc = HandshakeAccumulator::new();
        let header = acc.push(&wire).expect("complete after 76 bytes");
        assert_eq!(header, sample());
        assert!(acc.is_complete());
    }

    #[test]
    fn split_40_plus_36() {
        let wire = sample().encode();
        let mut acc = HandshakeAccumulator::new();
        assert!(acc.push(&wire[..40]).is_none());
        assert_eq!(acc.bytes_needed(), 36);
        let header = acc.push(&wire[40..]).expect("complete after second chunk");
        assert_eq!(header.device_name, "Pixel 7");
        assert_eq!(header.width, 1080);
        assert_eq!(header.height, 2400);
    }

    #[test]
    fn one_byte_at_a_time() {
        let wire = sample().encode();
        let mut acc = HandshakeAccumulator::new();
        let mut produced = Vec::new();
        for (i, b) in wire.iter().enumerate() {
            if let Some(h) = acc.push(std::slice::from_ref(b)) {
                produced.push(i);
                assert_eq!(h, sample());
            }
        }
        // Completes exactly once, on the final byte.
        assert_eq!(produced, vec![HANDSHAKE_LEN - 1]);
    }

    #[test]
    fn every_split_point_completes_once() {
        let wire = sample().encode();
        for split in 1..HANDSHAKE_LEN {
            let mut acc = HandshakeAccumulator::new();
            assert!(acc.push(&wire[..split]).is_none(), "split at {split}");
            assert!(acc.push(&wire[split..]).is_some(), "split at {split}");
            assert!(acc.push(&[]).is_none());
        }
    }

    #[test]
    fn remainder_preserved() {
        let mut wire = sample().encode().to_vec();
        wire.extend_from_slice(b"video-stream-bytes");
        let mut acc = HandshakeAccumulator::new();
        assert!(acc.push(&wire).is_some());
        assert_eq!(&acc.into_remainder()[..], b"video-stream-bytes");
    }

    #[test]
    fn garbage_name_field_is_truncated() {
        // No NUL anywhere in the name field.
        let mut wire = [0xffu8; HANDSHAKE_LEN];
        wire[DEVICE_NAME_FIELD_LEN + 4..DEVICE_NAME_FIELD_LEN + 8]
            .copy_from_slice(&640u32.to_be_bytes());
        wire[DEVICE_NAME_FIELD_LEN + 8..DEVICE_NAME_FIELD_LEN + 12]
            .copy_from_slice(&480u32.to_be_bytes());
        let header = HandshakeHeader::parse(&wire);
        // Forced NUL at byte 63 bounds the name; dimensions still parse.
        assert_eq!(header.width, 640);
        assert_eq!(header.height, 480);
        assert_eq!(header.device_name.chars().count(), DEVICE_NAME_FIELD_LEN - 1);
    }
}
