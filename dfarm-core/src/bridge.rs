//! Debug-bridge client seam.
//!
//! The session protocol talks to devices through [`BridgeClient`]:
//! pushing the agent payload, managing reverse/forward tunnels, and
//! launching the remote agent process. [`AdbBridge`] is the real
//! implementation over the `adb` binary; tests substitute their own.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::FarmError;

// ── AgentProcess ─────────────────────────────────────────────────

/// Handle to a launched on-device agent process.
#[async_trait]
pub trait AgentProcess: Send {
    /// Kill the remote process. Failure is ignored by teardown paths.
    async fn kill(&mut self) -> Result<(), FarmError>;
}

// ── BridgeClient ─────────────────────────────────────────────────

/// Asynchronous debug-bridge operations used during session bring-up.
#[async_trait]
pub trait BridgeClient: Send + Sync {
    /// Copy the agent payload onto the device.
    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), FarmError>;

    /// Ask the device to dial back into `local_port` under `socket_name`.
    async fn reverse(&self, serial: &str, socket_name: &str, local_port: u16)
        -> Result<(), FarmError>;

    async fn reverse_remove(&self, serial: &str, socket_name: &str) -> Result<(), FarmError>;

    /// Forward `local_port` on the host to the device's `socket_name`.
    async fn forward(&self, serial: &str, local_port: u16, socket_name: &str)
        -> Result<(), FarmError>;

    async fn forward_remove(&self, serial: &str, local_port: u16) -> Result<(), FarmError>;

    /// Spawn the remote agent process with the given shell arguments.
    async fn launch(
        &self,
        serial: &str,
        args: Vec<String>,
    ) -> Result<Box<dyn AgentProcess>, FarmError>;
}

// ── AdbBridge ────────────────────────────────────────────────────

/// Bridge implementation shelling out to the `adb` binary.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    /// Run one adb command to completion and map failure to a tunnel
    /// error carrying stderr.
    async fn run(&self, serial: &str, args: &[&str]) -> Result<(), FarmError> {
        debug!(serial, ?args, "adb");
        let output = Command::new(&self.adb_path)
            .arg("-s")
            .arg(serial)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FarmError::Tunnel(format!(
                "adb {} failed: {}",
                args.first().copied().unwrap_or("?"),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl BridgeClient for AdbBridge {
    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), FarmError> {
        let local = local.to_string_lossy();
        self.run(serial, &["push", &local, remote])
            .await
            .map_err(|e| FarmError::AgentPush(e.to_string()))
    }

    async fn reverse(
        &self,
        serial: &str,
        socket_name: &str,
        local_port: u16,
    ) -> Result<(), FarmError> {
        let local = format!("localabstract:{socket_name}");
        let remote = format!("tcp:{local_port}");
        self.run(serial, &["reverse", &local, &remote]).await
    }

    async fn reverse_remove(&self, serial: &str, socket_name: &str) -> Result<(), FarmError> {
        let local = format!("localabstract:{socket_name}");
        self.run(serial, &["reverse", "--remove", &local]).await
    }

    async fn forward(
        &self,
        serial: &str,
        local_port: u16,
        socket_name: &str,
    ) -> Result<(), FarmError> {
        let local = format!("tcp:{local_port}");
        let remote = format!("localabstract:{socket_name}");
        self.run(serial, &["forward", &local, &remote]).await
    }

    async fn forward_remove(&self, serial: &str, local_port: u16) -> Result<(), FarmError> {
        let local = format!("tcp:{local_port}");
        self.run(serial, &["forward", "--remove", &local]).await
    }

    async fn launch(
        &self,
        serial: &str,
        args: Vec<String>,
    ) -> Result<Box<dyn AgentProcess>, FarmError> {
        debug!(serial, ?args, "adb launch");
        let child = Command::new(&self.adb_path)
            .arg("-s")
            .arg(serial)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FarmError::AgentLaunch(e.to_string()))?;
        Ok(Box::new(AdbAgentProcess { child }))
    }
}

/// The agent as an adb shell child process. The shell command blocks
/// for the agent's lifetime; killing the child kills the agent.
struct AdbAgentProcess {
    child: Child,
}

#[async_trait]
impl AgentProcess for AdbAgentProcess {
    async fn kill(&mut self) -> Result<(), FarmError> {
        self.child.kill().await?;
        Ok(())
    }
}
