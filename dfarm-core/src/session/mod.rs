//! Device session bring-up: parameters, phase machine, and the
//! protocol driver that takes a device from idle to streaming.

pub mod params;
pub mod phase;
pub mod protocol;

pub use params::{OrientationLock, SessionParams};
pub use phase::{SessionPhase, TunnelMode};
pub use protocol::{
    SessionProtocol, SessionReady, ACCEPT_TICK, CONNECT_TICK, DEFAULT_ACCEPT_TICKS,
    MAX_CONNECT_ATTEMPTS, MAX_RESTARTS,
};
