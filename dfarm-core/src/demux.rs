//! Access-unit demuxing off the video socket.
//!
//! After the handshake header, the agent streams access units with a
//! 12-byte frame-meta header:
//!
//! ```text
//! pts:  u64 be   presentation timestamp; top bits carry packet flags
//! len:  u32 be   payload length
//! ```
//!
//! A CONFIG unit carries codec parameter-set data. It is never decoded
//! on its own: the demuxer holds it and concatenates it with the next
//! payload unit, so the decoder always sees parameter sets prefixed to
//! the first frame data.

use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder as FrameDecoder;

use crate::error::FarmError;

// ── Constants ────────────────────────────────────────────────────

/// Frame-meta header length on the wire.
pub const AU_HEADER_LEN: usize = 12;

/// Upper bound on a single access unit's payload.
pub const MAX_AU_SIZE: usize = 8 * 1024 * 1024;

bitflags! {
    /// Flag bits carried in the top of the pts field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u64 {
        /// Parameter-set (configuration) data, not a frame.
        const CONFIG = 1 << 63;
        /// Decodable without reference to earlier frames.
        const KEY_FRAME = 1 << 62;
    }
}

/// Mask selecting the pts value below the flag bits.
const PTS_MASK: u64 = PacketFlags::all().bits() ^ u64::MAX;

// ── AccessUnit ───────────────────────────────────────────────────

/// One compressed video payload unit handed to the decoder.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// Presentation timestamp in microseconds (flags stripped).
    pub pts: u64,
    pub flags: PacketFlags,
    pub data: Bytes,
}

impl AccessUnit {
    /// Whether parameter-set data is prefixed to (or is) the payload.
    pub fn is_config(&self) -> bool {
        self.flags.contains(PacketFlags::CONFIG)
    }

    /// Serialize with the frame-meta header (agent side / tests).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AU_HEADER_LEN + self.data.len());
        out.extend_from_slice(&(self.pts | self.flags.bits()).to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

// ── AccessUnitCodec ──────────────────────────────────────────────

/// `tokio_util` codec producing [`AccessUnit`]s from the video stream.
///
/// Stateful: a CONFIG unit is buffered and merged into the next
/// payload unit rather than emitted.
#[derive(Debug, Default)]
pub struct AccessUnitCodec {
    pending_config: Option<Bytes>,
}

impl AccessUnitCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameDecoder for AccessUnitCodec {
    type Item = AccessUnit;
    type Error = FarmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<AccessUnit>, FarmError> {
        loop {
            if src.len() < AU_HEADER_LEN {
                return Ok(None);
            }

            let pts_and_flags = u64::from_be_bytes(src[0..8].try_into().expect("slice of 8"));
            let len = u32::from_be_bytes(src[8..12].try_into().expect("slice of 4")) as usize;
            if len > MAX_AU_SIZE {
                return Err(FarmError::PacketTooLarge {
                    size: len,
                    max: MAX_AU_SIZE,
                });
            }
            if src.len() < AU_HEADER_LEN + len {
                src.reserve(AU_HEADER_LEN + len - src.len());
                return Ok(None);
            }

            src.advance(AU_HEADER_LEN);
            let payload = src.split_to(len).freeze();
            let flags = PacketFlags::from_bits_truncate(pts_and_flags);
            let pts = pts_and_flags & PTS_MASK;

            if flags.contains(PacketFlags::CONFIG) {
                // Hold parameter sets for the next payload unit.
                self.pending_config = Some(payload);
                continue;
            }

            let (flags, data) = match self.pending_config.take() {
                Some(config) => {
                    let mut merged = BytesMut::with_capacity(config.len() + payload.len());
                    merged.extend_from_slice(&config);
                    merged.extend_from_slice(&payload);
                    (flags | PacketFlags::CONFIG, merged.freeze())
                }
                None => (flags, payload),
            };

            return Ok(Some(AccessUnit { pts, flags, data }));
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn au(pts: u64, flags: PacketFlags, data: &[u8]) -> AccessUnit {
        AccessUnit {
            pts,
            flags,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn plain_unit_roundtrip() {
        let mut codec = AccessUnitCodec::new();
        let mut buf = BytesMut::from(&au(42, PacketFlags::KEY_FRAME, b"frame").encode()[..]);

        let out = codec.decode(&mut buf).unwrap().expect("one unit");
        assert_eq!(out.pts, 42);
        assert!(out.flags.contains(PacketFlags::KEY_FRAME));
        assert!(!out.is_config());
        assert_eq!(&out.data[..], b"frame");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_header_waits() {
        let mut codec = AccessUnitCodec::new();
        let wire = au(1, PacketFlags::empty(), b"abc").encode();

        let mut buf = BytesMut::from(&wire[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&wire[5..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn config_merged_with_next_payload() {
        let mut codec = AccessUnitCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&au(0, PacketFlags::CONFIG, b"PPPP").encode());
        buf.extend_from_slice(&au(7, PacketFlags::KEY_FRAME, b"frame").encode());

        // The config unit alone produces nothing.
        let out = codec.decode(&mut buf).unwrap().expect("merged unit");
        assert_eq!(out.pts, 7);
        assert!(out.is_config());
        assert!(out.flags.contains(PacketFlags::KEY_FRAME));
        assert_eq!(&out.data[..], b"PPPPframe");
        assert!(buf.is_empty());
    }

    #[test]
    fn config_alone_emits_nothing() {
        let mut codec = AccessUnitCodec::new();
        let mut buf = BytesMut::from(&au(0, PacketFlags::CONFIG, b"PP").encode()[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_unit_rejected() {
        let mut codec = AccessUnitCodec::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&0u64.to_be_bytes());
        wire.extend_from_slice(&((MAX_AU_SIZE as u32) + 1).to_be_bytes());
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FarmError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn pts_flag_bits_are_stripped() {
        let mut codec = AccessUnitCodec::new();
        let mut buf = BytesMut::from(&au(123_456, PacketFlags::KEY_FRAME, b"x").encode()[..]);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.pts, 123_456);
    }
}
