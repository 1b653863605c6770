//! Fleet-wide quality tiers.
//!
//! Encoding parameters degrade in steps as the number of live
//! sessions grows, so a big fleet trades per-device fidelity for
//! aggregate throughput.

use serde::{Deserialize, Serialize};

use crate::session::SessionParams;

/// Discrete quality level, picked from the live session count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Ultra,
    High,
    Medium,
    Low,
    Minimal,
}

impl QualityTier {
    /// Tier for a fleet of `device_count` live sessions.
    pub fn for_device_count(device_count: usize) -> Self {
        match device_count {
            0..=5 => Self::Ultra,
            6..=20 => Self::High,
            21..=50 => Self::Medium,
            51..=100 => Self::Low,
            _ => Self::Minimal,
        }
    }

    pub fn profile(self) -> QualityProfile {
        match self {
            Self::Ultra => QualityProfile {
                max_size: 1080,
                bit_rate: 8_000_000,
                max_fps: 60,
                label: "ultra",
            },
            Self::High => QualityProfile {
                max_size: 720,
                bit_rate: 4_000_000,
                max_fps: 30,
                label: "high",
            },
            Self::Medium => QualityProfile {
                max_size: 480,
                bit_rate: 2_000_000,
                max_fps: 30,
                label: "medium",
            },
            Self::Low => QualityProfile {
                max_size: 360,
                bit_rate: 1_000_000,
                max_fps: 15,
                label: "low",
            },
            Self::Minimal => QualityProfile {
                max_size: 240,
                bit_rate: 500_000,
                max_fps: 10,
                label: "minimal",
            },
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.profile().label)
    }
}

/// Concrete encoding parameters for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    /// Longest-side cap in pixels.
    pub max_size: u16,
    /// Bits per second.
    pub bit_rate: u32,
    /// Frame-rate cap.
    pub max_fps: u16,
    pub label: &'static str,
}

impl QualityProfile {
    /// Profile for a fleet of `device_count` live sessions.
    pub fn optimal(device_count: usize) -> Self {
        QualityTier::for_device_count(device_count).profile()
    }

    /// Stamp this profile onto a session's launch parameters.
    pub fn apply_to(&self, params: &mut SessionParams) {
        params.max_size = self.max_size;
        params.bit_rate = self.bit_rate;
        params.max_fps = self.max_fps;
    }
}
