//! Session bring-up phase machine.
//!
//! Phases advance monotonically with two sanctioned retreats: the
//! reverse→forward tunnel fallback (once) and the bounded restart
//! loop after connect-budget exhaustion. Transitions return `Result`
//! instead of panicking.

use std::time::Instant;

use crate::error::FarmError;

// ── TunnelMode ───────────────────────────────────────────────────

/// Direction of the initial listen/dial during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Host listens, device dials in. Tried first.
    Reverse,
    /// Host dials the device's listening socket. Fallback.
    Forward,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reverse => write!(f, "reverse"),
            Self::Forward => write!(f, "forward"),
        }
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

/// The current phase of a device session.
///
/// ```text
/// Idle ─► PushAgent ─► EstablishTunnel ─► LaunchAgent ─► AwaitConnection ─► Running
///              │     (reverse ─► forward)      │                │              │
///              │                               ▼                ▼              ▼
///              └────────────────────────────► Failed ◄── (restart ► PushAgent) Stopped
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No bring-up attempted yet. Initial state.
    #[default]
    Idle,

    /// Copying the agent payload onto the device.
    PushAgent,

    /// Establishing the bridge tunnel in the given mode.
    EstablishTunnel { mode: TunnelMode },

    /// Spawning the remote agent process.
    LaunchAgent,

    /// Waiting for the video and control sockets.
    AwaitConnection,

    /// Both sockets up, handshake parsed; the session streams.
    Running { since: Instant },

    /// Torn down deliberately. Terminal.
    Stopped,

    /// Bring-up or streaming failed. Terminal.
    Failed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::PushAgent => write!(f, "PushAgent"),
            Self::EstablishTunnel { mode } => write!(f, "EstablishTunnel({mode})"),
            Self::LaunchAgent => write!(f, "LaunchAgent"),
            Self::AwaitConnection => write!(f, "AwaitConnection"),
            Self::Running { .. } => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// How long the session has been running, if it is.
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Running { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`. Also the restart target (see
    /// [`retreat_for_restart`](Self::retreat_for_restart)).
    pub fn begin_push(&mut self) -> Result<(), FarmError> {
        match self {
            Self::Idle => {
                *self = Self::PushAgent;
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "cannot push agent: not in Idle state",
            )),
        }
    }

    /// Valid from: `PushAgent`.
    pub fn begin_tunnel(&mut self, mode: TunnelMode) -> Result<(), FarmError> {
        match self {
            Self::PushAgent => {
                *self = Self::EstablishTunnel { mode };
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "cannot establish tunnel: not in PushAgent state",
            )),
        }
    }

    /// The single sanctioned reverse→forward fallback.
    ///
    /// Valid from: `EstablishTunnel(Reverse)`.
    pub fn fallback_to_forward(&mut self) -> Result<(), FarmError> {
        match self {
            Self::EstablishTunnel {
                mode: TunnelMode::Reverse,
            } => {
                *self = Self::EstablishTunnel {
                    mode: TunnelMode::Forward,
                };
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "tunnel fallback only applies to reverse mode",
            )),
        }
    }

    /// Valid from: `EstablishTunnel`.
    pub fn begin_launch(&mut self) -> Result<(), FarmError> {
        match self {
            Self::EstablishTunnel { .. } => {
                *self = Self::LaunchAgent;
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "cannot launch agent: tunnel not established",
            )),
        }
    }

    /// Valid from: `LaunchAgent`.
    pub fn begin_await(&mut self) -> Result<(), FarmError> {
        match self {
            Self::LaunchAgent => {
                *self = Self::AwaitConnection;
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "cannot await connection: agent not launched",
            )),
        }
    }

    /// Valid from: `AwaitConnection`, and only once both completion
    /// signals hold (the caller's two-phase barrier).
    pub fn complete(&mut self) -> Result<(), FarmError> {
        match self {
            Self::AwaitConnection => {
                *self = Self::Running {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "cannot run: not awaiting connection",
            )),
        }
    }

    /// The bounded restart retreat: back to `Idle` so the next
    /// attempt starts from the push step.
    ///
    /// Valid from: `AwaitConnection`.
    pub fn retreat_for_restart(&mut self) -> Result<(), FarmError> {
        match self {
            Self::AwaitConnection => {
                *self = Self::Idle;
                Ok(())
            }
            _ => Err(FarmError::ProtocolViolation(
                "restart only applies while awaiting connection",
            )),
        }
    }

    /// Deliberate teardown. Valid from any non-terminal state.
    pub fn stop(&mut self) -> Result<(), FarmError> {
        match self {
            Self::Stopped | Self::Failed => Err(FarmError::ProtocolViolation(
                "session already terminal",
            )),
            _ => {
                *self = Self::Stopped;
                Ok(())
            }
        }
    }

    /// Record failure regardless of current state.
    pub fn fail(&mut self) {
        *self = Self::Failed;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = SessionPhase::default();
        phase.begin_push().unwrap();
        phase.begin_tunnel(TunnelMode::Reverse).unwrap();
        phase.begin_launch().unwrap();
        phase.begin_await().unwrap();
        phase.complete().unwrap();
        assert!(phase.is_running());
        assert!(phase.running_duration().is_some());

        phase.stop().unwrap();
        assert!(phase.is_terminal());
    }

    #[test]
    fn reverse_falls_back_to_forward_once() {
        let mut phase = SessionPhase::PushAgent;
        phase.begin_tunnel(TunnelMode::Reverse).unwrap();
        phase.fallback_to_forward().unwrap();
        assert_eq!(
            phase,
            SessionPhase::EstablishTunnel {
                mode: TunnelMode::Forward
            }
        );
        // Already in forward mode: no second fallback.
        assert!(phase.fallback_to_forward().is_err());
    }

    #[test]
    fn restart_retreats_to_idle() {
        let mut phase = SessionPhase::AwaitConnection;
        phase.retreat_for_restart().unwrap();
        assert_eq!(phase, SessionPhase::Idle);
        phase.begin_push().unwrap();
    }

    #[test]
    fn cannot_run_before_awaiting() {
        let mut phase = SessionPhase::LaunchAgent;
        assert!(phase.complete().is_err());
    }

    #[test]
    fn cannot_push_twice() {
        let mut phase = SessionPhase::PushAgent;
        assert!(phase.begin_push().is_err());
    }

    #[test]
    fn stop_is_rejected_when_terminal() {
        let mut phase = SessionPhase::Stopped;
        assert!(phase.stop().is_err());
        let mut phase = SessionPhase::Failed;
        assert!(phase.stop().is_err());
    }

    #[test]
    fn fail_from_any_state() {
        let mut phase = SessionPhase::Running {
            since: Instant::now(),
        };
        phase.fail();
        assert_eq!(phase, SessionPhase::Failed);
    }

    #[test]
    fn display_format() {
        assert_eq!(SessionPhase::Idle.to_string(), "Idle");
        assert_eq!(
            SessionPhase::EstablishTunnel {
                mode: TunnelMode::Forward
            }
            .to_string(),
            "EstablishTunnel(forward)"
        );
    }
}
