//! Resource-bounded device pool.
//!
//! The pool caps concurrent sessions, hands existing sessions back
//! instead of duplicating them, evicts the longest-idle session to
//! make room, and reaps sessions that sit idle past a timeout. The
//! fleet-wide quality tier is stamped onto every session it creates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::BridgeClient;
use crate::device::{Device, DeviceInfo};
use crate::error::FarmError;
use crate::quality::QualityTier;
use crate::session::SessionParams;

// ── PoolConfig ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard cap on pooled sessions, live or idle.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle sessions older than this are reaped by cleanup.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Cadence of the background cleanup task.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_max_sessions() -> usize {
    16
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_ms: default_idle_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

// ── ConnectionPool ───────────────────────────────────────────────

struct PooledEntry {
    device: Arc<Device>,
    in_use: bool,
    usage_count: u64,
    last_used: Instant,
}

/// Keyed by device serial.
pub struct ConnectionPool {
    config: PoolConfig,
    entries: Mutex<HashMap<String, PooledEntry>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out the device for `params.serial`, creating it if the
    /// pool has never seen that serial.
    ///
    /// An existing session is returned as-is, in use or not; callers
    /// on one serial are expected to coordinate among themselves.
    /// A brand-new session gets the current fleet quality tier
    /// stamped onto its parameters. When the pool is full, the
    /// longest-idle session is evicted and torn down to make room;
    /// if every slot is in use the call is refused.
    pub async fn acquire(&self, mut params: SessionParams) -> Result<Arc<Device>, FarmError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get_mut(&params.serial) {
            entry.in_use = true;
            entry.usage_count += 1;
            entry.last_used = Instant::now();
            debug!(serial = %params.serial, uses = entry.usage_count, "pool hit");
            return Ok(entry.device.clone());
        }

        let mut evicted = None;
        if entries.len() >= self.config.max_sessions {
            let oldest_idle = entries
                .iter()
                .filter(|(_, e)| !e.in_use)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(serial, _)| serial.clone());
            match oldest_idle {
                Some(serial) => {
                    if let Some(entry) = entries.remove(&serial) {
                        info!(evicted = %serial, for_serial = %params.serial, "pool full, evicting idle session");
                        evicted = Some(entry.device);
                    }
                }
                None => {
                    return Err(FarmError::PoolExhausted {
                        capacity: self.config.max_sessions,
                    });
                }
            }
        }

        self.tier_for_count(entries.len() + 1)
            .profile()
            .apply_to(&mut params);
        let serial = params.serial.clone();
        let device = Device::new(params);
        entries.insert(
            serial,
            PooledEntry {
                device: device.clone(),
                in_use: true,
                usage_count: 1,
                last_used: Instant::now(),
            },
        );
        drop(entries);

        // Teardown happens with the lock released.
        if let Some(old) = evicted {
            old.disconnect().await;
        }
        Ok(device)
    }

    /// [`acquire`](Self::acquire) plus session bring-up. Reused
    /// sessions skip bring-up entirely.
    pub async fn acquire_connected(
        &self,
        params: SessionParams,
        bridge: Arc<dyn BridgeClient>,
    ) -> Result<(Arc<Device>, DeviceInfo), FarmError> {
        let serial = params.serial.clone();
        let device = self.acquire(params).await?;
        match device.connect(bridge).await {
            Ok(info) => Ok((device, info)),
            Err(err) => {
                // A session that never came up has no reuse value.
                self.entries
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&serial);
                Err(err)
            }
        }
    }

    /// Return a session to the idle set. Unknown serials are ignored.
    pub fn release(&self, serial: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(serial) {
            entry.in_use = false;
            entry.last_used = Instant::now();
            debug!(serial, "session released to pool");
        }
    }

    /// Drop a session from the pool and tear it down.
    pub async fn remove(&self, serial: &str) -> bool {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(serial);
        match entry {
            Some(entry) => {
                entry.device.disconnect().await;
                info!(serial, "session removed from pool");
                true
            }
            None => false,
        }
    }

    /// Reap idle sessions older than the configured timeout.
    pub async fn cleanup(&self) -> usize {
        let timeout = self.config.idle_timeout();
        let expired: Vec<Arc<Device>> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| !e.in_use && e.last_used.elapsed() >= timeout)
                .map(|(serial, _)| serial.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|serial| entries.remove(&serial))
                .map(|e| e.device)
                .collect()
        };
        let reaped = expired.len();
        for device in expired {
            debug!(serial = device.serial(), "idle timeout, reaping session");
            device.disconnect().await;
        }
        reaped
    }

    /// Background reaper on the configured cadence.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { return };
                let reaped = pool.cleanup().await;
                if reaped > 0 {
                    info!(reaped, "pool cleanup pass");
                }
            }
        })
    }

    // ── Counters ─────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.in_use)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.len() - self.active_count()
    }

    pub fn usage_count(&self, serial: &str) -> Option<u64> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(serial)
            .map(|e| e.usage_count)
    }

    /// Quality tier new sessions currently receive.
    pub fn current_tier(&self) -> QualityTier {
        self.tier_for_count(self.len())
    }

    fn tier_for_count(&self, count: usize) -> QualityTier {
        QualityTier::for_device_count(count)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_sessions", &self.config.max_sessions)
            .field("len", &self.len())
            .field("active", &self.active_count())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
