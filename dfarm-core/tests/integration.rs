//! Integration tests — full session bring-up against an in-process
//! fake device agent over localhost TCP, plus pool lifecycle
//! scenarios end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dfarm_core::decode::codec::encode_param_set;
use dfarm_core::{
    AccessUnit, AgentProcess, BridgeClient, Device, DeviceMessage, FarmError, HandshakeHeader,
    PacketFlags, PoolConfig, ConnectionPool, SessionParams,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;

// ── Fake device agent ────────────────────────────────────────────

const FRAME_W: u32 = 32;
const FRAME_H: u32 = 16;

fn frame_payload(fill: u8) -> Bytes {
    let raw = vec![fill; (FRAME_W * FRAME_H) as usize + 2 * ((FRAME_W / 2) * (FRAME_H / 2)) as usize];
    Bytes::from(zstd::encode_all(&raw[..], 0).unwrap())
}

/// Plays the device role: dials the reverse listener, sends the
/// handshake, a parameter set, `frames` video frames, then a
/// clipboard update on the control socket.
async fn fake_agent(port: u16, frames: u32) {
    let mut video = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let header = HandshakeHeader {
        device_name: "Fake Pixel".into(),
        codec_id: 0,
        width: FRAME_W,
        height: FRAME_H,
    };
    video.write_all(&header.encode()).await.unwrap();

    let config = AccessUnit {
        pts: 0,
        flags: PacketFlags::CONFIG,
        data: Bytes::copy_from_slice(&encode_param_set(FRAME_W, FRAME_H)),
    };
    video.write_all(&config.encode()).await.unwrap();
    for i in 0..frames {
        let unit = AccessUnit {
            pts: (i as u64 + 1) * 16_000,
            flags: if i == 0 {
                PacketFlags::KEY_FRAME
            } else {
                PacketFlags::empty()
            },
            data: frame_payload(i as u8 + 1),
        };
        video.write_all(&unit.encode()).await.unwrap();
    }

    let mut control = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    control
        .write_all(&DeviceMessage::Clipboard("from-device".into()).serialize())
        .await
        .unwrap();

    // Keep both sockets open until the host tears the session down.
    tokio::time::sleep(Duration::from_secs(10)).await;
    drop(video);
    drop(control);
}

// ── Fake bridge ──────────────────────────────────────────────────

struct FakeAgentHandle {
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl AgentProcess for FakeAgentHandle {
    async fn kill(&mut self) -> Result<(), FarmError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Bridge whose `launch` spawns the fake agent against whatever port
/// the reverse tunnel registered for that serial.
struct FakeBridge {
    ports: Mutex<HashMap<String, u16>>,
    frames: u32,
    fail_push: bool,
    pushes: AtomicU32,
    killed: Arc<AtomicBool>,
}

impl FakeBridge {
    fn new(frames: u32) -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(HashMap::new()),
            frames,
            fail_push: false,
            pushes: AtomicU32::new(0),
            killed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl BridgeClient for FakeBridge {
    async fn push(&self, serial: &str, _local: &Path, _remote: &str) -> Result<(), FarmError> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_push {
            return Err(FarmError::AgentPush(format!("{serial}: device offline")));
        }
        Ok(())
    }

    async fn reverse(
        &self,
        serial: &str,
        _socket_name: &str,
        local_port: u16,
    ) -> Result<(), FarmError> {
        self.ports
            .lock()
            .unwrap()
            .insert(serial.to_string(), local_port);
        Ok(())
    }

    async fn reverse_remove(&self, _serial: &str, _socket_name: &str) -> Result<(), FarmError> {
        Ok(())
    }

    async fn forward(
        &self,
        _serial: &str,
        _local_port: u16,
        _socket_name: &str,
    ) -> Result<(), FarmError> {
        Ok(())
    }

    async fn forward_remove(&self, _serial: &str, _local_port: u16) -> Result<(), FarmError> {
        Ok(())
    }

    async fn launch(
        &self,
        serial: &str,
        _args: Vec<String>,
    ) -> Result<Box<dyn AgentProcess>, FarmError> {
        let port = *self
            .ports
            .lock()
            .unwrap()
            .get(serial)
            .expect("reverse before launch");
        let frames = self.frames;
        tokio::spawn(fake_agent(port, frames));
        Ok(Box::new(FakeAgentHandle {
            killed: self.killed.clone(),
        }))
    }
}

fn params(serial: &str, port: u16) -> SessionParams {
    SessionParams::new(serial, port, PathBuf::from("/tmp/dfarm-agent.jar"))
}

// ── Session end to end ───────────────────────────────────────────

#[tokio::test]
async fn test_session_streams_frames_to_subscribers() {
    let bridge = FakeBridge::new(3);
    let device = Device::new(params("itest-stream", 40110));

    let frames_seen = Arc::new(AtomicU32::new(0));
    let done = Arc::new(Notify::new());
    {
        let frames_seen = frames_seen.clone();
        let done = done.clone();
        device.subscribe(Box::new(move |frame| {
            assert_eq!(frame.width, FRAME_W);
            assert_eq!(frame.height, FRAME_H);
            if frames_seen.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                done.notify_one();
            }
        }));
    }

    let info = device.connect(bridge).await.unwrap();
    assert_eq!(info.device_name, "Fake Pixel");
    assert_eq!(info.width, FRAME_W);
    assert_eq!(info.height, FRAME_H);

    tokio::time::timeout(Duration::from_secs(5), done.notified())
        .await
        .expect("frames did not arrive");
    assert_eq!(frames_seen.load(Ordering::SeqCst), 3);

    // First frame was the key frame, filled with 1s; the latest
    // rendered frame is the last one, filled with 3s.
    let latest = device.peek_frame().expect("rendered frame");
    assert!(latest.planes[0].iter().all(|&b| b == 3));

    // Clipboard update arrived on the control socket.
    tokio::time::timeout(Duration::from_secs(5), async {
        while device.last_clipboard().is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("clipboard never arrived");
    assert_eq!(device.last_clipboard().as_deref(), Some("from-device"));

    device.disconnect().await;
    assert!(!device.is_connected());
    // Teardown is idempotent.
    device.disconnect().await;
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let bridge = FakeBridge::new(1);
    let device = Device::new(params("itest-reconnect", 40111));

    let first = device.connect(bridge.clone()).await.unwrap();
    let second = device.connect(bridge).await.unwrap();
    assert_eq!(first, second);

    device.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_connects_share_one_bring_up() {
    let bridge = FakeBridge::new(1);
    let device = Device::new(params("itest-race", 40112));

    // Both callers race on a fresh device; only one may run bring-up.
    let (first, second) = tokio::join!(
        device.connect(bridge.clone()),
        device.connect(bridge.clone()),
    );
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first, second);
    assert_eq!(bridge.pushes.load(Ordering::SeqCst), 1);

    device.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_returns_while_stream_is_quiet() {
    // Zero frames after the handshake: the worker sits blocked on the
    // video socket with nothing arriving when teardown starts.
    let bridge = FakeBridge::new(0);
    let device = Device::new(params("itest-quiet", 40113));

    device.connect(bridge.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(3), device.disconnect())
        .await
        .expect("disconnect hung on an idle stream");
    assert!(!device.is_connected());
    // The agent was killed as part of teardown, before the worker was
    // reaped.
    assert!(bridge.killed.load(Ordering::SeqCst));
}

// ── Pool end to end ──────────────────────────────────────────────

#[tokio::test]
async fn test_pool_reuses_live_session() {
    let bridge = FakeBridge::new(1);
    let pool = ConnectionPool::new(PoolConfig::default());

    let (first, info) = pool
        .acquire_connected(params("itest-pool-a", 40120), bridge.clone())
        .await
        .unwrap();
    assert_eq!(info.device_name, "Fake Pixel");
    pool.release("itest-pool-a");

    // Second acquire hands the live session back without a fresh
    // bring-up (the fake bridge would panic on a second launch for
    // an unknown port, so reuse is observable).
    let (second, _) = pool
        .acquire_connected(params("itest-pool-a", 40120), bridge)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.usage_count("itest-pool-a"), Some(2));

    pool.remove("itest-pool-a").await;
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_pool_eviction_disconnects_the_evicted_session() {
    let bridge = FakeBridge::new(1);
    let pool = ConnectionPool::new(PoolConfig {
        max_sessions: 1,
        ..PoolConfig::default()
    });

    let (old, _) = pool
        .acquire_connected(params("itest-evict-a", 40130), bridge.clone())
        .await
        .unwrap();
    pool.release("itest-evict-a");

    let (new, _) = pool
        .acquire_connected(params("itest-evict-b", 40131), bridge)
        .await
        .unwrap();
    assert!(new.is_connected());
    assert_eq!(pool.len(), 1);
    assert!(pool.usage_count("itest-evict-a").is_none());
    // Eviction tears the old session down before acquire returns.
    assert!(!old.is_connected());

    pool.remove("itest-evict-b").await;
}

#[tokio::test]
async fn test_failed_bring_up_leaves_no_pool_entry() {
    let bridge = Arc::new(FakeBridge {
        ports: Mutex::new(HashMap::new()),
        frames: 0,
        fail_push: true,
        pushes: AtomicU32::new(0),
        killed: Arc::new(AtomicBool::new(false)),
    });
    let pool = ConnectionPool::new(PoolConfig::default());

    let err = pool
        .acquire_connected(params("itest-fail", 40140), bridge)
        .await
        .unwrap_err();
    assert!(matches!(err, FarmError::AgentPush(_)));
    assert!(pool.is_empty());
}
