//! Per-session launch parameters.
//!
//! The agent is started with a positional argument vector; every
//! tunable is an explicit `key=value` token, and tokens matching
//! the agent's built-in default are omitted so the command line
//! stays short on common configurations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lock policy for the device's video orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationLock {
    /// Follow device rotation.
    #[default]
    Unlocked,
    /// Freeze at the orientation current when the agent starts.
    LockInitial,
    /// Freeze at a fixed orientation, 0..=3 quarter turns.
    LockExact(u8),
}

/// Everything needed to bring one device session up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    /// Device serial the bridge addresses.
    pub serial: String,

    /// Host-side TCP port for the tunnel.
    pub local_port: u16,

    /// Agent payload on the host filesystem.
    pub agent_local_path: PathBuf,

    /// Where the payload lands on the device.
    #[serde(default = "default_agent_remote_path")]
    pub agent_remote_path: String,

    /// Version string passed to the agent; the handshake negotiates
    /// nothing beyond it.
    #[serde(default = "default_agent_version")]
    pub agent_version: String,

    /// Longest-side cap in pixels, 0 = native.
    #[serde(default)]
    pub max_size: u16,

    /// Video bit rate in bits per second.
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    /// Frame-rate cap, 0 = encoder default.
    #[serde(default)]
    pub max_fps: u16,

    #[serde(default)]
    pub orientation: OrientationLock,

    /// Raw codec option string forwarded verbatim.
    #[serde(default)]
    pub codec_options: String,

    /// Explicit encoder selection, empty = agent picks.
    #[serde(default)]
    pub encoder_name: String,

    /// Keep the device awake while the session runs.
    #[serde(default)]
    pub stay_awake: bool,

    /// Whether the control socket carries input injection.
    #[serde(default = "default_true")]
    pub control: bool,

    /// Try the reverse tunnel first.
    #[serde(default = "default_true")]
    pub use_reverse: bool,

    /// Session-scoped id, disambiguates concurrent tunnels on one
    /// device. Rendered as 8 lowercase hex digits.
    #[serde(default)]
    pub scid: u32,
}

fn default_agent_remote_path() -> String {
    "/data/local/tmp/dfarm-agent.jar".into()
}

fn default_agent_version() -> String {
    "1.0".into()
}

fn default_bit_rate() -> u32 {
    8_000_000
}

fn default_true() -> bool {
    true
}

impl SessionParams {
    /// Minimal parameter set for `serial`, everything else default.
    pub fn new(serial: impl Into<String>, local_port: u16, agent_local_path: PathBuf) -> Self {
        Self {
            serial: serial.into(),
            local_port,
            agent_local_path,
            agent_remote_path: default_agent_remote_path(),
            agent_version: default_agent_version(),
            max_size: 0,
            bit_rate: default_bit_rate(),
            max_fps: 0,
            orientation: OrientationLock::default(),
            codec_options: String::new(),
            encoder_name: String::new(),
            stay_awake: false,
            control: true,
            use_reverse: true,
            scid: 0,
        }
    }

    /// Abstract socket name the tunnel binds on the device side.
    pub fn socket_name(&self) -> String {
        format!("dfarm_{:08x}", self.scid)
    }

    /// The full argument vector for launching the agent through the
    /// bridge shell. Tokens equal to the agent default are omitted.
    pub fn launch_args(&self, tunnel_forward: bool) -> Vec<String> {
        let mut args = vec![
            "shell".into(),
            format!("CLASSPATH={}", self.agent_remote_path),
            "app_process".into(),
            "/".into(),
            "com.dfarm.Agent".into(),
            self.agent_version.clone(),
            format!("video_bit_rate={}", self.bit_rate),
        ];
        if self.max_size != 0 {
            args.push(format!("max_size={}", self.max_size));
        }
        if self.max_fps != 0 {
            args.push(format!("max_fps={}", self.max_fps));
        }
        match self.orientation {
            OrientationLock::Unlocked => {}
            OrientationLock::LockInitial => args.push("lock_video_orientation=-1".into()),
            OrientationLock::LockExact(turns) => {
                args.push(format!("lock_video_orientation={turns}"))
            }
        }
        if tunnel_forward {
            args.push("tunnel_forward=true".into());
        }
        if !self.control {
            args.push("control=false".into());
        }
        if self.stay_awake {
            args.push("stay_awake=true".into());
        }
        if !self.codec_options.is_empty() {
            args.push(format!("codec_options={}", self.codec_options));
        }
        if !self.encoder_name.is_empty() {
            args.push(format!("encoder_name={}", self.encoder_name));
        }
        if self.scid != 0 {
            args.push(format!("scid={:08x}", self.scid));
        }
        args.push("audio=false".into());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SessionParams {
        SessionParams::new("emulator-5554", 27183, PathBuf::from("/opt/dfarm/agent.jar"))
    }

    #[test]
    fn socket_name_is_hex_scid() {
        let mut p = base();
        assert_eq!(p.socket_name(), "dfarm_00000000");
        p.scid = 0xdead_beef;
        assert_eq!(p.socket_name(), "dfarm_deadbeef");
    }

    #[test]
    fn default_launch_args_are_minimal() {
        let args = base().launch_args(false);
        assert_eq!(
            args,
            vec![
                "shell",
                "CLASSPATH=/data/local/tmp/dfarm-agent.jar",
                "app_process",
                "/",
                "com.dfarm.Agent",
                "1.0",
                "video_bit_rate=8000000",
                "audio=false",
            ]
        );
    }

    #[test]
    fn non_default_tunables_appear() {
        let mut p = base();
        p.max_size = 1080;
        p.max_fps = 60;
        p.orientation = OrientationLock::LockExact(1);
        p.stay_awake = true;
        p.control = false;
        p.codec_options = "profile=1".into();
        p.encoder_name = "OMX.qcom.video.encoder.avc".into();
        p.scid = 0x1234;
        let args = p.launch_args(true);
        assert!(args.contains(&"max_size=1080".to_string()));
        assert!(args.contains(&"max_fps=60".to_string()));
        assert!(args.contains(&"lock_video_orientation=1".to_string()));
        assert!(args.contains(&"tunnel_forward=true".to_string()));
        assert!(args.contains(&"control=false".to_string()));
        assert!(args.contains(&"stay_awake=true".to_string()));
        assert!(args.contains(&"codec_options=profile=1".to_string()));
        assert!(args.contains(&"encoder_name=OMX.qcom.video.encoder.avc".to_string()));
        assert!(args.contains(&"scid=00001234".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("audio=false"));
    }

    #[test]
    fn lock_initial_orientation_token() {
        let mut p = base();
        p.orientation = OrientationLock::LockInitial;
        assert!(p
            .launch_args(false)
            .contains(&"lock_video_orientation=-1".to_string()));
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let p: SessionParams = toml::from_str(
            r#"
            serial = "emulator-5554"
            local_port = 27183
            agent_local_path = "/opt/dfarm/agent.jar"
            "#,
        )
        .unwrap();
        assert_eq!(p.bit_rate, 8_000_000);
        assert!(p.control);
        assert!(p.use_reverse);
        assert_eq!(p.orientation, OrientationLock::Unlocked);
    }
}
