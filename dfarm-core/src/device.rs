//! One mirrored device.
//!
//! `Device` ties the pieces together: session bring-up, the video
//! demux/decode worker, the control channel, and frame fan-out to
//! subscribers. Teardown is idempotent and always interrupts the
//! frame slot before anything else so no consumer stays blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeClient;
use crate::control::{ControlChannel, DeviceMessage};
use crate::decode::{DecodePipeline, FrameSlot, VideoFrame};
use crate::demux::AccessUnitCodec;
use crate::error::FarmError;
use crate::session::{SessionParams, SessionProtocol};

/// Handle returned by [`Device::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-frame observer. Called on the decode worker, so keep it cheap.
pub type FrameObserver = Box<dyn Fn(&VideoFrame) + Send + Sync>;

/// Facts learned from the session handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub width: u32,
    pub height: u32,
}

// ── Device ───────────────────────────────────────────────────────

pub struct Device {
    params: SessionParams,
    slot: Arc<FrameSlot>,
    /// Level-triggered: once cancelled, the worker exits even if it
    /// had not been polled when teardown started. Replaced with a
    /// fresh token on every connect.
    shutdown: Mutex<CancellationToken>,
    connected: AtomicBool,
    first_frame_seen: AtomicBool,
    info: Mutex<Option<DeviceInfo>>,
    subscribers: Arc<Mutex<HashMap<SubscriptionId, FrameObserver>>>,
    next_subscription: AtomicU64,
    last_clipboard: Arc<Mutex<Option<String>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    session: tokio::sync::Mutex<Option<SessionProtocol>>,
    control: tokio::sync::Mutex<Option<ControlChannel>>,
}

impl Device {
    pub fn new(params: SessionParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            slot: Arc::new(FrameSlot::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            connected: AtomicBool::new(false),
            first_frame_seen: AtomicBool::new(false),
            info: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(1),
            last_clipboard: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
            control: tokio::sync::Mutex::new(None),
        })
    }

    pub fn serial(&self) -> &str {
        &self.params.serial
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Handshake facts, once connected.
    pub fn info(&self) -> Option<DeviceInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Most recent clipboard text reported by the agent.
    pub fn last_clipboard(&self) -> Option<String> {
        self.last_clipboard
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Bring the session up and start the decode worker.
    ///
    /// Connecting an already-connected device is a no-op that
    /// returns the existing handshake info. Concurrent connects on
    /// one device are serialized: exactly one performs bring-up, the
    /// rest wait and get the winner's handshake info.
    pub async fn connect(
        self: &Arc<Self>,
        bridge: Arc<dyn BridgeClient>,
    ) -> Result<DeviceInfo, FarmError> {
        // The session slot doubles as the connect mutex; held for the
        // whole bring-up so a racing caller cannot start a second one.
        let mut session_slot = self.session.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return self
                .info()
                .ok_or(FarmError::ProtocolViolation("connected without handshake"));
        }

        let mut session = SessionProtocol::new(self.params.clone(), bridge);
        let ready = session.establish().await?;

        let device_info = DeviceInfo {
            device_name: ready.device_name,
            width: ready.width,
            height: ready.height,
        };
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(device_info.clone());

        if let Some(control_stream) = ready.control {
            let serial = self.params.serial.clone();
            let clipboard = self.last_clipboard.clone();
            let channel = ControlChannel::start(control_stream, move |message| match message {
                DeviceMessage::Clipboard(text) => {
                    debug!(serial = %serial, len = text.len(), "clipboard update");
                    *clipboard.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
                }
            });
            *self.control.lock().await = Some(channel);
        }
        *session_slot = Some(session);

        // Seed the demuxer with the stream bytes that arrived glued
        // to the handshake.
        // `FramedRead` only decodes its buffer after a successful
        // read from the underlying IO, so a buffer-seeded remainder
        // would sit undecoded until new socket bytes arrive; chaining
        // it ahead of the stream makes it part of the read path.
        let framed = FramedRead::new(
            AsyncReadExt::chain(std::io::Cursor::new(ready.video_remainder), ready.video),
            AccessUnitCodec::new(),
        );

        let shutdown = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = shutdown.clone();

        let worker = tokio::spawn(Self::stream_worker(
            Arc::downgrade(self),
            self.params.serial.clone(),
            self.slot.clone(),
            shutdown,
            framed,
        ));
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(worker);

        self.connected.store(true, Ordering::SeqCst);
        Ok(device_info)
    }

    /// Tear the session down. Safe to call repeatedly.
    ///
    /// Order: interrupt the frame slot so no consumer stays blocked,
    /// signal the worker, kill the agent and close the transport,
    /// and only then join the worker, which frees the codec context
    /// on its way out.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.slot.interrupt();
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();

        if let Some(mut session) = self.session.lock().await.take() {
            session.stop().await;
        }

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            if let Err(err) = handle.await {
                debug!(serial = %self.params.serial, error = %err, "stream worker join failed");
            }
        }
        self.control.lock().await.take();
        info!(serial = %self.params.serial, "device disconnected");
    }

    // ── Frames ───────────────────────────────────────────────────

    /// Register a frame observer. Observers run on the decode worker
    /// in registration order.
    pub fn subscribe(&self, observer: FrameObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, observer);
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    /// Latest rendered frame without consuming the pending flag.
    pub fn peek_frame(&self) -> Option<Arc<VideoFrame>> {
        self.slot.peek()
    }

    pub fn frame_slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    // ── Control ──────────────────────────────────────────────────

    /// Forward a pre-encoded injection payload on the control socket.
    pub async fn send_control(&self, payload: &[u8]) -> Result<(), FarmError> {
        match self.control.lock().await.as_mut() {
            Some(channel) => channel.send_raw(payload).await,
            None => Err(FarmError::ChannelClosed),
        }
    }

    // ── Worker ───────────────────────────────────────────────────

    async fn stream_worker(
        device: Weak<Device>,
        serial: String,
        slot: Arc<FrameSlot>,
        shutdown: CancellationToken,
        mut framed: FramedRead<
            tokio::io::Chain<std::io::Cursor<bytes::Bytes>, tokio::net::TcpStream>,
            AccessUnitCodec,
        >,
    ) {
        let mut pipeline = DecodePipeline::new(slot);
        {
            let device = device.clone();
            pipeline.set_frame_ready(move || {
                if let Some(device) = device.upgrade() {
                    device.dispatch_frame();
                }
            });
        }
        match pipeline.open() {
            Ok(mode) => debug!(serial = %serial, ?mode, "decode pipeline open"),
            Err(err) => {
                warn!(serial = %serial, error = %err, "decode pipeline failed to open");
                return;
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                item = framed.next() => match item {
                    Some(Ok(unit)) => {
                        if let Err(err) = pipeline.push(&unit) {
                            warn!(serial = %serial, error = %err, "decode failed, stopping stream");
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(serial = %serial, error = %err, "video stream error");
                        break;
                    }
                    None => {
                        debug!(serial = %serial, "video stream ended");
                        break;
                    }
                },
            }
        }
        pipeline.close();
    }

    fn dispatch_frame(&self) {
        let Some(frame) = self.slot.consume_rendered() else {
            return;
        };
        if !self.first_frame_seen.swap(true, Ordering::SeqCst) {
            info!(
                serial = %self.params.serial,
                width = frame.width,
                height = frame.height,
                "first frame decoded"
            );
        }
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for observer in subscribers.values() {
            observer(&frame);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("serial", &self.params.serial)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn device() -> Arc<Device> {
        Device::new(SessionParams::new(
            "unit-device",
            27999,
            PathBuf::from("/tmp/agent.jar"),
        ))
    }

    #[test]
    fn subscriptions_get_distinct_ids() {
        let device = device();
        let a = device.subscribe(Box::new(|_| {}));
        let b = device.subscribe(Box::new(|_| {}));
        assert_ne!(a, b);
        assert!(device.unsubscribe(a));
        assert!(!device.unsubscribe(a));
        assert!(device.unsubscribe(b));
    }

    #[test]
    fn dispatch_reaches_all_subscribers() {
        let device = device();
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            device.subscribe(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut frame = VideoFrame::empty();
        frame.reset_for(64, 64);
        assert!(!device.slot.offer(frame));
        device.dispatch_frame();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // Pending flag consumed: a second dispatch is a no-op.
        device.dispatch_frame();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_no_op() {
        let device = device();
        device.disconnect().await;
        device.disconnect().await;
        assert!(!device.is_connected());
    }

    #[tokio::test]
    async fn control_without_channel_reports_closed() {
        let device = device();
        let err = device.send_control(&[0]).await.unwrap_err();
        assert!(matches!(err, FarmError::ChannelClosed));
    }
}
