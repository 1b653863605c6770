//! The per-session decode pipeline.
//!
//! Owns one codec context, feeds it compressed access units, and
//! writes each decoded frame into the session's [`FrameSlot`]. Open
//! order: every hardware candidate in its declared order, then the
//! software decoder; the first success wins.
//!
//! All calls on one pipeline must come from the session's single
//! worker task — codec contexts are not migration-safe.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::decode::codec::{
    codec_init_lock, hardware_candidates, AcceleratorContext, CodecError, Decoder, DecoderConfig,
    HardwareAccelerator, ZstdDecoder,
};
use crate::decode::frame::VideoFrame;
use crate::decode::frame_slot::FrameSlot;
use crate::demux::AccessUnit;
use crate::error::FarmError;

// ── CodecHandle ──────────────────────────────────────────────────

/// Which backend won the open race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    Hardware,
    Software,
}

/// An open codec. Its existence implies the codec is open.
struct CodecHandle {
    mode: CodecMode,
    decoder: Box<dyn Decoder>,
    /// Device context, hardware mode only.
    accel: Option<AcceleratorContext>,
    /// Staging frame for accelerator output, hardware mode only.
    accel_frame: Option<VideoFrame>,
}

// ── DecodePipeline ───────────────────────────────────────────────

type FrameReadyFn = Box<dyn FnMut() + Send>;

/// Compressed access units in, decoded frames into the slot.
pub struct DecodePipeline {
    slot: Arc<FrameSlot>,
    handle: Option<CodecHandle>,
    candidates: Vec<HardwareAccelerator>,
    /// Invoked after each offer that was not skipped.
    on_frame_ready: Option<FrameReadyFn>,
    /// Reused decode target, swapped with the slot's recycled buffer.
    scratch: VideoFrame,
}

impl DecodePipeline {
    pub fn new(slot: Arc<FrameSlot>) -> Self {
        Self {
            slot,
            handle: None,
            candidates: hardware_candidates(),
            on_frame_ready: None,
            scratch: VideoFrame::empty(),
        }
    }

    /// Replace the hardware candidate list (tests, exotic hosts).
    pub fn with_candidates(mut self, candidates: Vec<HardwareAccelerator>) -> Self {
        self.candidates = candidates;
        self
    }

    /// Register the ready-notification hook. At most one notification
    /// is outstanding at a time: offers that replace an unconsumed
    /// frame do not fire it.
    pub fn set_frame_ready(&mut self, f: impl FnMut() + Send + 'static) {
        self.on_frame_ready = Some(Box::new(f));
    }

    /// The backend in use, if open.
    pub fn mode(&self) -> Option<CodecMode> {
        self.handle.as_ref().map(|h| h.mode)
    }

    /// The tuning flags of the open decoder, if any.
    pub fn decoder_config(&self) -> Option<DecoderConfig> {
        self.handle.as_ref().map(|h| h.decoder.config())
    }

    /// Open a codec: hardware candidates in declared order, first
    /// success wins; software fallback after all of them fail.
    ///
    /// Open and close are serialized process-wide across all sessions
    /// by [`codec_init_lock`] — the codec library's init tables are
    /// not safe for concurrent mutation.
    pub fn open(&mut self) -> Result<CodecMode, FarmError> {
        if self.handle.is_some() {
            return Err(FarmError::ProtocolViolation("codec already open"));
        }

        let _init = codec_init_lock().lock().expect("codec init lock");

        for candidate in &self.candidates {
            let accel = match candidate.create_device_context() {
                Ok(ctx) => ctx,
                Err(e) => {
                    debug!(decoder = candidate.decoder_name, %e, "hardware candidate unavailable");
                    continue;
                }
            };
            match ZstdDecoder::open(DecoderConfig::low_latency()) {
                Ok(decoder) => {
                    info!(decoder = candidate.decoder_name, "opened hardware decoder");
                    self.handle = Some(CodecHandle {
                        mode: CodecMode::Hardware,
                        decoder: Box::new(decoder),
                        accel: Some(accel),
                        accel_frame: Some(VideoFrame::empty()),
                    });
                    return Ok(CodecMode::Hardware);
                }
                Err(e) => {
                    debug!(decoder = candidate.decoder_name, %e, "hardware open failed");
                }
            }
        }

        warn!("all hardware decoders failed, falling back to software");
        let decoder = ZstdDecoder::open(DecoderConfig::low_latency())
            .map_err(|e| FarmError::CodecOpen(e.to_string()))?;
        info!("using software decoder (CPU fallback)");
        self.handle = Some(CodecHandle {
            mode: CodecMode::Software,
            decoder: Box::new(decoder),
            accel: None,
            accel_frame: None,
        });
        Ok(CodecMode::Software)
    }

    /// Submit one access unit and drain every decoded frame it yields
    /// into the slot.
    ///
    /// Any codec result other than "need more input" is fatal for this
    /// session and surfaces as an error.
    pub fn push(&mut self, unit: &AccessUnit) -> Result<(), FarmError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or(FarmError::ProtocolViolation("codec not open"))?;

        handle
            .decoder
            .send_packet(unit)
            .map_err(FarmError::from)?;

        loop {
            let received = match handle.mode {
                CodecMode::Hardware => {
                    let staging = handle.accel_frame.as_mut().expect("hardware staging frame");
                    match handle.decoder.receive_frame(staging) {
                        Ok(()) => {
                            // Accelerator memory → host memory before use.
                            self.scratch.copy_from(staging);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                CodecMode::Software => handle.decoder.receive_frame(&mut self.scratch),
            };

            match received {
                Ok(()) => {
                    let mut frame = self.slot.take_decoding_frame();
                    std::mem::swap(&mut frame, &mut self.scratch);
                    let skipped = self.slot.offer(frame);
                    if !skipped {
                        if let Some(cb) = self.on_frame_ready.as_mut() {
                            cb();
                        }
                    }
                }
                Err(CodecError::NeedMoreInput) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Close the codec.
    ///
    /// Interrupts the slot first so no consumer stays blocked on a
    /// torn-down producer, then frees the context under the
    /// process-wide init lock. Safe to call when never opened.
    pub fn close(&mut self) {
        self.slot.interrupt();
        if let Some(handle) = self.handle.take() {
            let _init = codec_init_lock().lock().expect("codec init lock");
            drop(handle.accel);
            drop(handle.decoder);
            debug!("codec closed");
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ────────────────────────────────────────────────────────
