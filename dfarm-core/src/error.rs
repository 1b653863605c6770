//! Domain-specific error types for the dfarm core.
//!
//! All fallible operations return `Result<T, FarmError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the device-farm core.
#[derive(Debug, Error)]
pub enum FarmError {
    // ── Session bring-up ─────────────────────────────────────────
    /// A bridge call (push/reverse/forward) failed.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Pushing the agent payload onto the device failed.
    #[error("agent push failed: {0}")]
    AgentPush(String),

    /// Spawning the remote agent process failed.
    #[error("agent launch failed: {0}")]
    AgentLaunch(String),

    /// No inbound socket arrived within the accept budget.
    #[error("accept timed out after {ticks} ticks")]
    AcceptTimeout { ticks: u32 },

    /// The outbound dial budget was exhausted.
    #[error("connect timed out after {attempts} attempts")]
    ConnectTimeout { attempts: u32 },

    /// An operation violated the session phase machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The handshake header carried invalid content.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),

    // ── Decode ───────────────────────────────────────────────────
    /// No codec (hardware candidates, then software) could be opened.
    #[error("codec open failed: {0}")]
    CodecOpen(String),

    /// A decode call returned an error other than "need more input".
    #[error("decode error: {0}")]
    Decode(String),

    /// An access unit exceeded the configured maximum size.
    #[error("access unit too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    // ── Pool ─────────────────────────────────────────────────────
    /// The pool is at capacity and nothing is idle to evict.
    #[error("connection pool exhausted: capacity {capacity}")]
    PoolExhausted { capacity: usize },

    // ── Connection ───────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization ────────────────────────────────────────────
    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for FarmError {
    fn from(s: String) -> Self {
        FarmError::Other(s)
    }
}

impl From<&str> for FarmError {
    fn from(s: &str) -> Self {
        FarmError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FarmError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FarmError::ChannelClosed
    }
}
