//! Control socket plumbing.
//!
//! Host-to-device traffic is an opaque passthrough: callers hand
//! pre-encoded injection payloads to [`ControlChannel::send_raw`].
//! Device-to-host messages have a small typed vocabulary, currently
//! just clipboard updates, framed as type byte + u32 length + body.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FarmError;

/// Upper bound on one device message body.
pub const MAX_DEVICE_MSG_SIZE: usize = 1 << 18;

const MSG_TYPE_CLIPBOARD: u8 = 0;
const MSG_HEADER_LEN: usize = 5;

// ── DeviceMessage ────────────────────────────────────────────────

/// A message sent by the device agent on the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// The device clipboard changed.
    Clipboard(String),
}

impl DeviceMessage {
    /// Try to parse one message from the front of `buf`.
    ///
    /// Returns the message and the number of bytes it consumed, or
    /// `None` when `buf` does not yet hold a complete message.
    pub fn deserialize(buf: &[u8]) -> Result<Option<(Self, usize)>, FarmError> {
        if buf.len() < MSG_HEADER_LEN {
            return Ok(None);
        }
        let msg_type = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_DEVICE_MSG_SIZE {
            return Err(FarmError::PacketTooLarge {
                size: len,
                max: MAX_DEVICE_MSG_SIZE,
            });
        }
        if buf.len() < MSG_HEADER_LEN + len {
            return Ok(None);
        }
        let body = &buf[MSG_HEADER_LEN..MSG_HEADER_LEN + len];
        let message = match msg_type {
            MSG_TYPE_CLIPBOARD => {
                let text = String::from_utf8(body.to_vec())?;
                Self::Clipboard(text)
            }
            _ => {
                return Err(FarmError::ProtocolViolation(
                    "unknown device message type",
                ))
            }
        };
        Ok(Some((message, MSG_HEADER_LEN + len)))
    }

    /// Encode this message in its wire frame.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Clipboard(text) => {
                let mut out = Vec::with_capacity(MSG_HEADER_LEN + text.len());
                out.push(MSG_TYPE_CLIPBOARD);
                out.extend_from_slice(&(text.len() as u32).to_be_bytes());
                out.extend_from_slice(text.as_bytes());
                out
            }
        }
    }
}

// ── ControlChannel ───────────────────────────────────────────────

/// The session's control socket, split into an opaque writer and a
/// background reader that surfaces typed device messages.
pub struct ControlChannel {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl ControlChannel {
    /// Take ownership of the control socket and start parsing the
    /// device-to-host direction, calling `on_message` per message.
    pub fn start<F>(stream: TcpStream, on_message: F) -> Self
    where
        F: Fn(DeviceMessage) + Send + 'static,
    {
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                match read_half.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!("control socket closed by device");
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "control socket read failed");
                        return;
                    }
                }
                loop {
                    match DeviceMessage::deserialize(&buf) {
                        Ok(Some((message, consumed))) => {
                            buf.advance(consumed);
                            on_message(message);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "malformed device message, dropping channel");
                            return;
                        }
                    }
                }
            }
        });
        Self { writer, reader }
    }

    /// Forward a pre-encoded injection payload to the device.
    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<(), FarmError> {
        self.writer.write_all(payload).await?;
        Ok(())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ── Tests ────────────────────────────────────────────────────────
