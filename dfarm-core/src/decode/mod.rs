//! Decode pipeline and frame handoff.
//!
//! One [`DecodePipeline`] per session turns compressed access units
//! into decoded frames; a [`FrameSlot`] hands each frame to the
//! consumer with a skip-under-backpressure policy.

pub mod codec;
pub mod frame;
pub mod frame_slot;
pub mod pipeline;

pub use codec::{
    codec_init_lock, hardware_candidates, AcceleratorKind, CodecError, Decoder, DecoderConfig,
    HardwareAccelerator, ZstdDecoder,
};
pub use frame::VideoFrame;
pub use frame_slot::FrameSlot;
pub use pipeline::{CodecMode, DecodePipeline};
