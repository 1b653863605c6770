//! # dfarm-core
//!
//! Core library for the dfarm Android mirroring farm.
//!
//! This crate contains:
//! - **Session**: `SessionProtocol` bring-up (agent push, tunnel
//!   setup with forward fallback, launch, socket wait, handshake)
//! - **Handshake**: the fixed 76-byte device greeting
//! - **Demux**: `AccessUnitCodec` framing of the video stream via
//!   `tokio_util`
//! - **Decode**: `DecodePipeline` with hardware-accelerator probing,
//!   software fallback, and the single-slot `FrameSlot` handoff
//! - **Pool**: `ConnectionPool` with reuse, idle eviction, and
//!   fleet-wide quality tiers
//! - **Device**: one mirrored device, tying session, stream worker,
//!   control channel, and frame fan-out together
//! - **Bridge**: `BridgeClient` abstraction over the adb transport
//! - **Error**: `FarmError` — typed, `thiserror`-based error hierarchy

pub mod bridge;
pub mod control;
pub mod decode;
pub mod demux;
pub mod device;
pub mod error;
pub mod handshake;
pub mod pool;
pub mod quality;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bridge::{AdbBridge, AgentProcess, BridgeClient};
pub use control::{ControlChannel, DeviceMessage, MAX_DEVICE_MSG_SIZE};
pub use decode::{
    CodecMode, DecodePipeline, Decoder, DecoderConfig, FrameSlot, HardwareAccelerator, VideoFrame,
};
pub use demux::{AccessUnit, AccessUnitCodec, PacketFlags, AU_HEADER_LEN, MAX_AU_SIZE};
pub use device::{Device, DeviceInfo, FrameObserver, SubscriptionId};
pub use error::FarmError;
pub use handshake::{HandshakeAccumulator, HandshakeHeader, HANDSHAKE_LEN};
pub use pool::{ConnectionPool, PoolConfig};
pub use quality::{QualityProfile, QualityTier};
pub use session::{
    OrientationLock, SessionParams, SessionPhase, SessionProtocol, SessionReady, TunnelMode,
};
