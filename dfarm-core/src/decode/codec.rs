//! Codec backends for the decode pipeline.
//!
//! Hardware acceleration is described declaratively: an ordered list
//! of [`HardwareAccelerator`] descriptors (decoder name + required
//! device node) that the pipeline iterates generically. When no
//! accelerator opens, the software decoder takes over with low-delay
//! flags.
//!
//! The payload codec is zstd: a CONFIG access unit carries a
//! parameter set (big-endian width and height); payload units carry a
//! zstd-compressed YUV420P frame (Y, U, V planes concatenated).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

use crate::decode::frame::VideoFrame;
use crate::demux::AccessUnit;
use crate::error::FarmError;

// ── Errors ───────────────────────────────────────────────────────

/// Codec-level results. `NeedMoreInput` is the drain-loop sentinel,
/// not a failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No decoded frame is available; feed more input.
    #[error("need more input")]
    NeedMoreInput,

    /// The codec could not be opened.
    #[error("open: {0}")]
    Open(String),

    /// Decoding failed. Fatal for the session's pipeline.
    #[error("decode: {0}")]
    Decode(String),
}

impl From<CodecError> for FarmError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Open(msg) => FarmError::CodecOpen(msg),
            CodecError::NeedMoreInput | CodecError::Decode(_) => FarmError::Decode(e.to_string()),
        }
    }
}

// ── Process-wide open/close serialization ────────────────────────

/// Lock serializing codec open/close across every session.
///
/// The underlying codec library's initialization tables are not safe
/// for concurrent mutation; all open and close calls, for any
/// session, must hold this lock. Decode calls themselves are
/// per-context and do not take it.
pub fn codec_init_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

// ── Decoder seam ─────────────────────────────────────────────────

/// Tuning flags applied when a codec is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Internal worker threads. Kept minimal for latency.
    pub thread_count: u32,
    /// No frame delay inside the codec.
    pub low_delay: bool,
    /// Favor speed over conformance.
    pub fast: bool,
}

impl DecoderConfig {
    /// Low-latency profile used for every session decoder.
    pub fn low_latency() -> Self {
        Self {
            thread_count: 2,
            low_delay: true,
            fast: true,
        }
    }
}

/// An open codec context.
///
/// All calls for one session must come from the single thread that
/// owns the context; the session's worker task is that thread.
pub trait Decoder: Send {
    /// Submit one compressed access unit.
    fn send_packet(&mut self, unit: &AccessUnit) -> Result<(), CodecError>;

    /// Drain the next decoded frame into `out`.
    ///
    /// Returns `Err(CodecError::NeedMoreInput)` once no further frame
    /// is available for the input submitted so far.
    fn receive_frame(&mut self, out: &mut VideoFrame) -> Result<(), CodecError>;

    /// The tuning flags this context was opened with.
    fn config(&self) -> DecoderConfig;
}

// ── Hardware accelerator descriptors ─────────────────────────────

/// Accelerator families, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceleratorKind {
    Vaapi,
    Qsv,
    Cuda,
}

/// A candidate hardware decoder: pure data, iterated generically.
#[derive(Debug, Clone)]
pub struct HardwareAccelerator {
    /// Name of the accelerated decoder variant.
    pub decoder_name: &'static str,
    pub kind: AcceleratorKind,
    /// Device node that must exist for the accelerator to open.
    pub device_node: PathBuf,
}

/// The fixed candidate list, in priority order: VAAPI first (best on
/// Linux/Intel), then QSV, then CUDA/NVDEC.
pub fn hardware_candidates() -> Vec<HardwareAccelerator> {
    vec![
        HardwareAccelerator {
            decoder_name: "farm_vaapi",
            kind: AcceleratorKind::Vaapi,
            device_node: PathBuf::from("/dev/dri/renderD128"),
        },
        HardwareAccelerator {
            decoder_name: "farm_qsv",
            kind: AcceleratorKind::Qsv,
            device_node: PathBuf::from("/dev/dri/renderD128"),
        },
        HardwareAccelerator {
            decoder_name: "farm_cuvid",
            kind: AcceleratorKind::Cuda,
            device_node: PathBuf::from("/dev/nvidia0"),
        },
    ]
}

/// Handle to an accelerator device. Its existence implies the device
/// context was created successfully.
#[derive(Debug)]
pub struct AcceleratorContext {
    node: PathBuf,
    kind: AcceleratorKind,
}

impl AcceleratorContext {
    pub fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    pub fn node(&self) -> &Path {
        &self.node
    }
}

impl HardwareAccelerator {
    /// Create a device context for this accelerator.
    ///
    /// Fails when the device node is absent, which moves the pipeline
    /// on to the next candidate.
    pub fn create_device_context(&self) -> Result<AcceleratorContext, CodecError> {
        if !self.device_node.exists() {
            return Err(CodecError::Open(format!(
                "{}: device node {} not present",
                self.decoder_name,
                self.device_node.display()
            )));
        }
        Ok(AcceleratorContext {
            node: self.device_node.clone(),
            kind: self.kind,
        })
    }
}

// ── Parameter sets ───────────────────────────────────────────────

/// Length of the parameter-set payload: BE width + BE height.
pub const PARAM_SET_LEN: usize = 8;

/// Encode a parameter set (agent side / tests).
pub fn encode_param_set(width: u32, height: u32) -> [u8; PARAM_SET_LEN] {
    let mut buf = [0u8; PARAM_SET_LEN];
    buf[..4].copy_from_slice(&width.to_be_bytes());
    buf[4..].copy_from_slice(&height.to_be_bytes());
    buf
}

// ── ZstdDecoder ──────────────────────────────────────────────────

/// The zstd payload decoder. Serves as the software codec and as the
/// decode stage behind every hardware accelerator context.
#[derive(Debug)]
pub struct ZstdDecoder {
    config: DecoderConfig,
    dims: Option<(u32, u32)>,
    /// Compressed frame data submitted but not yet drained.
    queued: Option<bytes::Bytes>,
}

impl ZstdDecoder {
    /// Open a decoder context with the given tuning flags.
    ///
    /// Callers must hold [`codec_init_lock`].
    pub fn open(config: DecoderConfig) -> Result<Self, CodecError> {
        Ok(Self {
            config,
            dims: None,
            queued: None,
        })
    }

    fn expected_payload(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        w * h + 2 * (cw * ch)
    }
}

impl Decoder for ZstdDecoder {
    fn send_packet(&mut self, unit: &AccessUnit) -> Result<(), CodecError> {
        let mut data = unit.data.clone();

        if unit.is_config() {
            if data.len() < PARAM_SET_LEN {
                return Err(CodecError::Decode("truncated parameter set".into()));
            }
            let width = u32::from_be_bytes(data[..4].try_into().expect("slice of 4"));
            let height = u32::from_be_bytes(data[4..8].try_into().expect("slice of 4"));
            if width == 0 || height == 0 {
                return Err(CodecError::Decode("zero-sized parameter set".into()));
            }
            self.dims = Some((width, height));
            data = data.slice(PARAM_SET_LEN..);
        }

        if !data.is_empty() {
            self.queued = Some(data);
        }
        Ok(())
    }

    fn receive_frame(&mut self, out: &mut VideoFrame) -> Result<(), CodecError> {
        let Some((width, height)) = self.dims else {
            self.queued = None;
            return Err(CodecError::NeedMoreInput);
        };
        let Some(data) = self.queued.take() else {
            return Err(CodecError::NeedMoreInput);
        };

        let pixels =
            zstd::decode_all(&data[..]).map_err(|e| CodecError::Decode(e.to_string()))?;
        let expected = Self::expected_payload(width, height);
        if pixels.len() != expected {
            return Err(CodecError::Decode(format!(
                "frame payload {} bytes, expected {expected}",
                pixels.len()
            )));
        }

        out.reset_for(width, height);
        let y_len = out.planes[0].len();
        let c_len = out.planes[1].len();
        out.planes[0].copy_from_slice(&pixels[..y_len]);
        out.planes[1].copy_from_slice(&pixels[y_len..y_len + c_len]);
        out.planes[2].copy_from_slice(&pixels[y_len + c_len..]);
        Ok(())
    }

    fn config(&self) -> DecoderConfig {
        self.config
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::PacketFlags;
    use bytes::Bytes;

    pub(crate) fn frame_unit(pts: u64, width: u32, height: u32, fill: u8) -> AccessUnit {
        let pixels = vec![fill; ZstdDecoder::expected_payload(width, height)];
        AccessUnit {
            pts,
            flags: PacketFlags::KEY_FRAME,
            data: Bytes::from(zstd::encode_all(&pixels[..], 0).unwrap()),
        }
    }

    fn config_unit(width: u32, height: u32) -> AccessUnit {
        AccessUnit {
            pts: 0,
            flags: PacketFlags::CONFIG,
            data: Bytes::copy_from_slice(&encode_param_set(width, height)),
        }
    }

    #[test]
    fn config_then_frame_decodes() {
        let mut dec = ZstdDecoder::open(DecoderConfig::low_latency()).unwrap();
        dec.send_packet(&config_unit(16, 8)).unwrap();

        let mut out = VideoFrame::empty();
        assert!(matches!(
            dec.receive_frame(&mut out),
            Err(CodecError::NeedMoreInput)
        ));

        dec.send_packet(&frame_unit(1, 16, 8, 0x42)).unwrap();
        dec.receive_frame(&mut out).unwrap();
        assert_eq!(out.width, 16);
        assert_eq!(out.height, 8);
        assert!(out.planes[0].iter().all(|&b| b == 0x42));
        // Drained.
        assert!(matches!(
            dec.receive_frame(&mut out),
            Err(CodecError::NeedMoreInput)
        ));
    }

    #[test]
    fn concatenated_config_and_frame() {
        // Parameter set prefixed to the first payload, as the demuxer
        // delivers it.
        let mut merged = encode_param_set(4, 4).to_vec();
        merged.extend_from_slice(&frame_unit(1, 4, 4, 9).data);
        let unit = AccessUnit {
            pts: 1,
            flags: PacketFlags::CONFIG | PacketFlags::KEY_FRAME,
            data: Bytes::from(merged),
        };

        let mut dec = ZstdDecoder::open(DecoderConfig::low_latency()).unwrap();
        dec.send_packet(&unit).unwrap();
        let mut out = VideoFrame::empty();
        dec.receive_frame(&mut out).unwrap();
        assert_eq!((out.width, out.height), (4, 4));
    }

    #[test]
    fn wrong_payload_size_is_fatal() {
        let mut dec = ZstdDecoder::open(DecoderConfig::low_latency()).unwrap();
        dec.send_packet(&config_unit(16, 16)).unwrap();
        // Frame encoded for different dimensions.
        dec.send_packet(&frame_unit(1, 8, 8, 0)).unwrap();
        let mut out = VideoFrame::empty();
        assert!(matches!(
            dec.receive_frame(&mut out),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn garbage_payload_is_fatal() {
        let mut dec = ZstdDecoder::open(DecoderConfig::low_latency()).unwrap();
        dec.send_packet(&config_unit(4, 4)).unwrap();
        dec.send_packet(&AccessUnit {
            pts: 1,
            flags: PacketFlags::empty(),
            data: Bytes::from_static(b"not zstd"),
        })
        .unwrap();
        let mut out = VideoFrame::empty();
        assert!(matches!(
            dec.receive_frame(&mut out),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn missing_device_node_fails_candidate() {
        let candidate = HardwareAccelerator {
            decoder_name: "farm_vaapi",
            kind: AcceleratorKind::Vaapi,
            device_node: PathBuf::from("/nonexistent/renderD999"),
        };
        assert!(matches!(
            candidate.create_device_context(),
            Err(CodecError::Open(_))
        ));
    }

    #[test]
    fn candidate_order_is_fixed() {
        let names: Vec<_> = hardware_candidates()
            .iter()
            .map(|c| c.decoder_name)
            .collect();
        assert_eq!(names, vec!["farm_vaapi", "farm_qsv", "farm_cuvid"]);
    }
}
