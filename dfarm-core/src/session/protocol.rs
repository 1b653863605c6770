//! Session bring-up orchestration.
//!
//! Drives one device from `Idle` to `Running`: push the agent, set
//! up the tunnel (reverse with a one-shot forward fallback), launch
//! the agent, then wait for the video and control sockets under a
//! tick-based budget. The whole attempt restarts at most once after
//! a connection timeout.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::{AgentProcess, BridgeClient};
use crate::error::FarmError;
use crate::handshake::HandshakeAccumulator;
use crate::session::params::SessionParams;
use crate::session::phase::{SessionPhase, TunnelMode};

// ── Timing budgets ───────────────────────────────────────────────

/// One accept-poll tick while waiting for the device to dial in.
pub const ACCEPT_TICK: Duration = Duration::from_secs(1);

/// Default accept budget, in ticks.
pub const DEFAULT_ACCEPT_TICKS: u32 = 30;

/// Delay between dial attempts in forward mode.
pub const CONNECT_TICK: Duration = Duration::from_millis(300);

/// Dial attempts before the forward connection is declared dead.
pub const MAX_CONNECT_ATTEMPTS: u32 = 30;

/// How many times a timed-out bring-up is retried from the top.
pub const MAX_RESTARTS: u32 = 1;

// ── SessionReady ─────────────────────────────────────────────────

/// Everything a running session hands to the streaming layer.
pub struct SessionReady {
    pub device_name: String,
    /// Initial frame width from the handshake.
    pub width: u32,
    /// Initial frame height from the handshake.
    pub height: u32,
    /// Video socket, positioned right after the handshake.
    pub video: TcpStream,
    /// Stream bytes that arrived in the same reads as the handshake.
    pub video_remainder: Bytes,
    /// Control socket, when the session requested one.
    pub control: Option<TcpStream>,
}

impl std::fmt::Debug for SessionReady {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReady")
            .field("device_name", &self.device_name)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("control", &self.control.is_some())
            .finish()
    }
}

// ── SessionProtocol ──────────────────────────────────────────────

/// One device's bring-up state machine.
pub struct SessionProtocol {
    params: SessionParams,
    bridge: Arc<dyn BridgeClient>,
    phase: SessionPhase,
    /// Mode the tunnel actually ended up in.
    tunnel_forward: bool,
    /// A bridge tunnel rule is installed and must be removed.
    tunnel_enabled: bool,
    restart_count: u32,
    accept_ticks: u32,
    agent: Option<Box<dyn AgentProcess>>,
    listener: Option<TcpListener>,
}

impl SessionProtocol {
    pub fn new(params: SessionParams, bridge: Arc<dyn BridgeClient>) -> Self {
        Self {
            params,
            bridge,
            phase: SessionPhase::default(),
            tunnel_forward: false,
            tunnel_enabled: false,
            restart_count: 0,
            accept_ticks: DEFAULT_ACCEPT_TICKS,
            agent: None,
            listener: None,
        }
    }

    /// Override the accept budget. Mostly useful to shorten tests.
    pub fn with_accept_budget(mut self, ticks: u32) -> Self {
        self.accept_ticks = ticks;
        self
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn tunnel_forward(&self) -> bool {
        self.tunnel_forward
    }

    /// Run bring-up to completion, restarting once on a connection
    /// timeout. Any other failure is fatal for the session.
    pub async fn establish(&mut self) -> Result<SessionReady, FarmError> {
        loop {
            match self.bring_up().await {
                Ok(ready) => {
                    info!(
                        serial = %self.params.serial,
                        device = %ready.device_name,
                        width = ready.width,
                        height = ready.height,
                        forward = self.tunnel_forward,
                        "session established"
                    );
                    return Ok(ready);
                }
                Err(err @ (FarmError::AcceptTimeout { .. } | FarmError::ConnectTimeout { .. }))
                    if self.restart_count < MAX_RESTARTS =>
                {
                    self.restart_count += 1;
                    warn!(
                        serial = %self.params.serial,
                        error = %err,
                        restart = self.restart_count,
                        "bring-up timed out, restarting"
                    );
                    self.teardown_attempt().await;
                    self.phase.retreat_for_restart()?;
                }
                Err(err) => {
                    self.teardown_attempt().await;
                    self.phase.fail();
                    return Err(err);
                }
            }
        }
    }

    /// Idempotent teardown: kill the agent and remove any tunnel.
    pub async fn stop(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.teardown_attempt().await;
        let _ = self.phase.stop();
        debug!(serial = %self.params.serial, "session stopped");
    }

    // ── One attempt ──────────────────────────────────────────────

    async fn bring_up(&mut self) -> Result<SessionReady, FarmError> {
        self.phase.begin_push()?;
        self.bridge
            .push(
                &self.params.serial,
                &self.params.agent_local_path,
                &self.params.agent_remote_path,
            )
            .await?;

        self.establish_tunnel().await?;

        self.phase.begin_launch()?;
        let args = self.params.launch_args(self.tunnel_forward);
        match self.bridge.launch(&self.params.serial, args).await {
            Ok(agent) => self.agent = Some(agent),
            Err(err) => {
                self.remove_tunnel().await;
                return Err(err);
            }
        }

        self.phase.begin_await()?;
        let (mut video, control) = if self.tunnel_forward {
            self.dial_with_budget().await?
        } else {
            let video = self.accept_with_budget().await?;
            let control = if self.params.control {
                Some(self.accept_with_budget().await?)
            } else {
                None
            };
            (video, control)
        };

        // The handshake leads the video stream in both modes.
        let (header, remainder) = self.read_handshake(&mut video).await?;

        // Both halves must be up before the session counts as live.
        let video_ready = true;
        let control_ready = control.is_some() || !self.params.control;
        if !video_ready || !control_ready {
            return Err(FarmError::ProtocolViolation(
                "session sockets incomplete after bring-up",
            ));
        }
        self.phase.complete()?;

        // The tunnel rule has served its purpose once both sockets
        // are connected.
        self.remove_tunnel().await;
        self.listener = None;

        Ok(SessionReady {
            device_name: header.device_name,
            width: header.width,
            height: header.height,
            video,
            video_remainder: remainder,
            control,
        })
    }

    async fn establish_tunnel(&mut self) -> Result<(), FarmError> {
        self.tunnel_forward = !self.params.use_reverse;
        let socket_name = self.params.socket_name();

        if !self.tunnel_forward {
            self.phase.begin_tunnel(TunnelMode::Reverse)?;
            match self
                .bridge
                .reverse(&self.params.serial, &socket_name, self.params.local_port)
                .await
            {
                Ok(()) => {
                    self.tunnel_enabled = true;
                    match TcpListener::bind((Ipv4Addr::LOCALHOST, self.params.local_port)).await {
                        Ok(listener) => {
                            self.listener = Some(listener);
                            return Ok(());
                        }
                        Err(err) => {
                            // A dead listener makes the reverse rule
                            // useless, so take it down before failing.
                            self.remove_tunnel().await;
                            return Err(err.into());
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        serial = %self.params.serial,
                        error = %err,
                        "reverse tunnel refused, falling back to forward"
                    );
                    self.phase.fallback_to_forward()?;
                    self.tunnel_forward = true;
                }
            }
        } else {
            self.phase.begin_tunnel(TunnelMode::Forward)?;
        }

        self.bridge
            .forward(&self.params.serial, self.params.local_port, &socket_name)
            .await?;
        self.tunnel_enabled = true;
        Ok(())
    }

    /// Reverse mode: poll the listener once per tick until the
    /// device dials in or the budget runs out.
    async fn accept_with_budget(&self) -> Result<TcpStream, FarmError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or(FarmError::ProtocolViolation("no listener for reverse accept"))?;
        for tick in 0..self.accept_ticks {
            match timeout(ACCEPT_TICK, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!(%peer, tick, "device connected");
                    return Ok(stream);
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => continue,
            }
        }
        Err(FarmError::AcceptTimeout {
            ticks: self.accept_ticks,
        })
    }

    /// Forward mode: dial both sockets, retrying on a fixed cadence
    /// while the agent finishes binding its end.
    async fn dial_with_budget(&self) -> Result<(TcpStream, Option<TcpStream>), FarmError> {
        let addr = (Ipv4Addr::LOCALHOST, self.params.local_port);
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_TICK).await;
            let mut video = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(attempt, error = %err, "dial attempt failed");
                    continue;
                }
            };
            // The agent answers the first socket with one placeholder
            // byte so a half-open tunnel is detected immediately.
            let mut dummy = [0u8; 1];
            video.read_exact(&mut dummy).await?;

            let control = if self.params.control {
                Some(TcpStream::connect(addr).await?)
            } else {
                None
            };
            return Ok((video, control));
        }
        Err(FarmError::ConnectTimeout {
            attempts: MAX_CONNECT_ATTEMPTS,
        })
    }

    async fn read_handshake(
        &self,
        video: &mut TcpStream,
    ) -> Result<(crate::handshake::HandshakeHeader, Bytes), FarmError> {
        let budget = ACCEPT_TICK * self.accept_ticks.max(1);
        let read = async {
            let mut acc = HandshakeAccumulator::new();
            let mut buf = [0u8; 256];
            loop {
                let n = video.read(&mut buf).await?;
                if n == 0 {
                    return Err(FarmError::InvalidHandshake(
                        "stream closed before handshake completed",
                    ));
                }
                if let Some(header) = acc.push(&buf[..n]) {
                    return Ok((header, acc.into_remainder()));
                }
            }
        };
        // A device that connects but never completes the handshake is
        // indistinguishable from one that never connected; classify
        // both as an accept timeout so the restart policy applies.
        timeout(budget, read)
            .await
            .map_err(|_| FarmError::AcceptTimeout {
                ticks: self.accept_ticks,
            })?
    }

    async fn teardown_attempt(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            if let Err(err) = agent.kill().await {
                debug!(serial = %self.params.serial, error = %err, "agent kill failed");
            }
        }
        self.remove_tunnel().await;
        self.listener = None;
    }

    async fn remove_tunnel(&mut self) {
        if !self.tunnel_enabled {
            return;
        }
        let result = if self.tunnel_forward {
            self.bridge
                .forward_remove(&self.params.serial, self.params.local_port)
                .await
        } else {
            self.bridge
                .reverse_remove(&self.params.serial, &self.params.socket_name())
                .await
        };
        if let Err(err) = result {
            debug!(serial = %self.params.serial, error = %err, "tunnel removal failed");
        }
        self.tunnel_enabled = false;
    }
}

// ── Tests ────────────────────────────────────────────────────────
