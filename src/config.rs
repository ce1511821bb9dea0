// Defaults, topics, robot parameter file
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hexapod::{LegPosition, StrideTuning};
use crate::servo::frame::BROADCAST_ID;
use crate::servo::transport::{DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS};
use crate::servo::lx16a::MAX_POSITION;
use crate::servo::{LimitError, ServoSpec};

// Zenoh topics
pub const TOPIC_CMD_GAIT: &str = "hexapod/cmd/gait"; // gait commands
pub const TOPIC_STATUS: &str = "hexapod/state/status"; // servo fault report
pub const TOPIC_HEALTH: &str = "hexapod/state/health"; // health status

// Status poll frequency
pub const STATUS_HZ: u64 = 1;

// Serial port of the servo bus adapter
pub const SERVO_PORT: &str = "/dev/ttyUSB0";

// Robot parameter file (leg_ids + leg_angles JSON document)
pub const DEFAULT_CONFIG_PATH: &str = "servo_params.json";

// Depth of the command queue feeding the control thread
pub const COMMAND_QUEUE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid parameter file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No servo ids for leg {0}")]
    MissingLeg(LegPosition),

    #[error("Servo id {0} used more than once")]
    DuplicateId(u8),

    #[error("Servo id {0} is not addressable")]
    InvalidId(u8),

    #[error("No angles for servo {0}")]
    MissingAngles(u8),

    #[error("Servo {id}: {source}")]
    Limits {
        id: u8,
        #[source]
        source: LimitError,
    },

    #[error("Stride {field} must be within 0..=1000, got {value}")]
    StrideOutOfRange { field: &'static str, value: i32 },

    #[error("Arc sign of leg {leg} must be 1 or -1, got {value}")]
    InvalidArcSign { leg: LegPosition, value: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
    /// Round-trip deadline for reads
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: SERVO_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Travel time sent with every move
    pub move_time_ms: u64,
    /// Settle time after every gait phase
    pub dwell_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            move_time_ms: 400,
            dwell_ms: 500,
        }
    }
}

impl MotionConfig {
    pub fn move_time(&self) -> Duration {
        Duration::from_millis(self.move_time_ms)
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }
}

/// Robot parameter file
///
/// `leg_angles` is keyed by the servo id as a string and holds
/// `[min, max, home]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub leg_ids: BTreeMap<LegPosition, [u8; 3]>,
    pub leg_angles: BTreeMap<String, [i32; 3]>,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub stride: StrideTuning,
}

impl RobotConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    /// Check the document describes a complete, addressable robot
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.leg_specs()?;
        for (field, value) in [
            ("arc", self.stride.arc),
            ("z", self.stride.z),
            ("stretch", self.stride.stretch),
        ] {
            if !(0..=MAX_POSITION as i32).contains(&value) {
                return Err(ConfigError::StrideOutOfRange { field, value });
            }
        }
        for leg in LegPosition::ALL {
            let value = self.stride.arc_signs.get(leg);
            if !matches!(value, 1 | -1) {
                return Err(ConfigError::InvalidArcSign { leg, value });
            }
        }
        Ok(())
    }

    /// Servo parameters per leg in `LegPosition::ALL` order
    pub fn leg_specs(&self) -> Result<[[ServoSpec; 3]; 6], ConfigError> {
        let mut seen = BTreeSet::new();
        let mut leg = |position| self.leg_spec(position, &mut seen);
        let [fl, fr, ml, mr, rl, rr] = LegPosition::ALL;
        Ok([leg(fl)?, leg(fr)?, leg(ml)?, leg(mr)?, leg(rl)?, leg(rr)?])
    }

    fn leg_spec(
        &self,
        position: LegPosition,
        seen: &mut BTreeSet<u8>,
    ) -> Result<[ServoSpec; 3], ConfigError> {
        let [arc, lift_a, lift_b] = *self
            .leg_ids
            .get(&position)
            .ok_or(ConfigError::MissingLeg(position))?;
        let mut servo = |id| self.servo_spec(id, seen);
        Ok([servo(arc)?, servo(lift_a)?, servo(lift_b)?])
    }

    fn servo_spec(&self, id: u8, seen: &mut BTreeSet<u8>) -> Result<ServoSpec, ConfigError> {
        if id >= BROADCAST_ID {
            return Err(ConfigError::InvalidId(id));
        }
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId(id));
        }
        let [min, max, home] = *self
            .leg_angles
            .get(&id.to_string())
            .ok_or(ConfigError::MissingAngles(id))?;
        ServoSpec::new(id, min, max, home).map_err(|source| ConfigError::Limits { id, source })
    }
}

impl std::str::FromStr for RobotConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: RobotConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}
