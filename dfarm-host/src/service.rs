//! Farm host service core logic.
//!
//! Brings up a session for every configured serial through the
//! connection pool, keeps a per-device frame counter for periodic
//! stats, and tears the whole fleet down on stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use dfarm_core::{AdbBridge, BridgeClient, ConnectionPool, Device};

use crate::config::HostConfig;

/// Cadence of the fleet stats log line.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

// ── FarmService ──────────────────────────────────────────────────

/// The top-level farm host service.
///
/// Owns the pool and the bridge; every configured device is checked
/// out of the pool at startup and returned on shutdown.
pub struct FarmService {
    config: HostConfig,
    pool: Arc<ConnectionPool>,
    bridge: Arc<dyn BridgeClient>,
    running: Arc<AtomicBool>,
}

struct MirroredDevice {
    device: Arc<Device>,
    frames: Arc<AtomicU64>,
}

impl FarmService {
    pub fn new(config: HostConfig) -> Self {
        let pool = ConnectionPool::new(config.pool.clone());
        let bridge: Arc<dyn BridgeClient> =
            Arc::new(AdbBridge::new(config.farm.adb_path.clone()));
        Self {
            config,
            pool,
            bridge,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle used to stop the service from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the fleet until stopped.
    ///
    /// 1. Starts the pool's background reaper.
    /// 2. Brings up one session per configured serial.
    /// 3. Logs fleet stats on a fixed cadence.
    /// 4. Disconnects every device when `running` flips to `false`.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let reaper = self.pool.spawn_cleanup();

        let mut fleet = Vec::new();
        for (index, serial) in self.config.farm.serials.iter().enumerate() {
            let params = self.config.session_params(serial, index);
            match self
                .pool
                .acquire_connected(params, self.bridge.clone())
                .await
            {
                Ok((device, device_info)) => {
                    info!(
                        serial = %serial,
                        name = %device_info.device_name,
                        width = device_info.width,
                        height = device_info.height,
                        tier = %self.pool.current_tier(),
                        "device mirroring"
                    );
                    let frames = Arc::new(AtomicU64::new(0));
                    {
                        let frames = frames.clone();
                        device.subscribe(Box::new(move |_| {
                            frames.fetch_add(1, Ordering::Relaxed);
                        }));
                    }
                    fleet.push(MirroredDevice { device, frames });
                }
                Err(err) => {
                    error!(serial = %serial, error = %err, "bring-up failed, skipping device");
                }
            }
        }
        if fleet.is_empty() {
            info!("no devices mirroring; waiting for shutdown");
        }

        let mut stats = interval(STATS_INTERVAL);
        stats.tick().await; // immediate first tick
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = stats.tick() => {
                    for entry in &fleet {
                        info!(
                            serial = entry.device.serial(),
                            frames = entry.frames.load(Ordering::Relaxed),
                            connected = entry.device.is_connected(),
                            "device stats"
                        );
                    }
                    info!(
                        sessions = self.pool.len(),
                        active = self.pool.active_count(),
                        tier = %self.pool.current_tier(),
                        "pool stats"
                    );
                }
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        info!("shutting down fleet");
        for entry in &fleet {
            self.pool.release(entry.device.serial());
            self.pool.remove(entry.device.serial()).await;
        }
        reaper.abort();
        Ok(())
    }

    async fn wait_for_stop(running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}
