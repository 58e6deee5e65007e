// Timeouts, topics, robot geometry and tuning
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::drive::kinematics::GeometryLayout;
use crate::error::{DriveError, Result};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Control period matching LOOP_HZ, seconds
pub const LOOP_PERIOD_S: f64 = 1.0 / LOOP_HZ as f64;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "swerve/cmd/drive"; // drive requests
pub const TOPIC_CMD_POSE: &str = "swerve/cmd/pose"; // pose reset / seed
pub const TOPIC_VISION: &str = "swerve/vision/pose"; // vision samples
pub const TOPIC_VISION_ORIENTATION: &str = "swerve/vision/orientation"; // heading hint, degrees
pub const TOPIC_STATE_DRIVE: &str = "swerve/state/drive"; // telemetry
pub const TOPIC_HEALTH: &str = "swerve/state/health"; // health status

// Geometry: 26in x 26in square frame
pub const TRACK_WIDTH_X_M: f64 = 26.0 * 0.0254;
pub const TRACK_WIDTH_Y_M: f64 = 26.0 * 0.0254;

// 14.5 ft/s free speed
pub const MAX_LINEAR_SPEED_MPS: f64 = 14.5 * 0.3048;

pub const WHEEL_RADIUS_M: f64 = 2.0 * 0.0254;

// Vision trust gates
pub const VISION_MAX_YAW_RATE_DEG_S: f64 = 720.0;
pub const VISION_STD_DEVS: [f64; 3] = [0.7, 0.7, 999_999.0];
pub const ODOMETRY_STD_DEVS: [f64; 3] = [0.1, 0.1, 0.1];

// Pose history kept for latency-compensated vision fusion
pub const POSE_HISTORY_S: f64 = 1.5;

// Accepted ranges for loaded configs
pub const MIN_LOOP_PERIOD_S: f64 = 0.001;
pub const MAX_LOOP_PERIOD_S: f64 = 1.0;
pub const MAX_POSE_HISTORY_S: f64 = 60.0;

/// Drive tuning, loadable from JSON. Missing fields take the defaults above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub loop_period_s: f64,
    pub track_width_x_m: f64,
    pub track_width_y_m: f64,
    pub max_linear_speed_mps: f64,
    pub wheel_radius_m: f64,
    /// Drive feedforward: volts = ks * sign(v) + kv * v (v in wheel rad/s)
    pub drive_ks: f64,
    pub drive_kv: f64,
    pub drive_kp: f64,
    pub turn_kp: f64,
    pub vision_max_yaw_rate_deg_s: f64,
    /// Vision std devs for x (m), y (m), heading (rad)
    pub vision_std_devs: [f64; 3],
    pub odometry_std_devs: [f64; 3],
    pub pose_history_s: f64,
    pub orient_tolerance_deg: f64,
    /// Fiducial ids accepted from the vision source
    pub valid_tag_ids: Vec<u32>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            loop_period_s: LOOP_PERIOD_S,
            track_width_x_m: TRACK_WIDTH_X_M,
            track_width_y_m: TRACK_WIDTH_Y_M,
            max_linear_speed_mps: MAX_LINEAR_SPEED_MPS,
            wheel_radius_m: WHEEL_RADIUS_M,
            drive_ks: 0.1,
            drive_kv: 0.13,
            drive_kp: 0.05,
            turn_kp: 7.0,
            vision_max_yaw_rate_deg_s: VISION_MAX_YAW_RATE_DEG_S,
            vision_std_devs: VISION_STD_DEVS,
            odometry_std_devs: ODOMETRY_STD_DEVS,
            pose_history_s: POSE_HISTORY_S,
            orient_tolerance_deg: 2.0,
            valid_tag_ids: (1..=16).collect(),
        }
    }
}

impl DriveConfig {
    pub fn layout(&self) -> GeometryLayout {
        GeometryLayout::new(self.track_width_x_m, self.track_width_y_m)
    }

    pub fn drive_base_radius(&self) -> f64 {
        self.layout().drive_base_radius()
    }

    /// Spin rate at which the outer wheels reach max linear speed
    pub fn max_angular_speed(&self) -> f64 {
        self.max_linear_speed_mps / self.drive_base_radius()
    }

    /// Load and validate
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the drive cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("loop_period_s", self.loop_period_s),
            ("track_width_x_m", self.track_width_x_m),
            ("track_width_y_m", self.track_width_y_m),
            ("max_linear_speed_mps", self.max_linear_speed_mps),
            ("wheel_radius_m", self.wheel_radius_m),
            ("vision_max_yaw_rate_deg_s", self.vision_max_yaw_rate_deg_s),
            ("pose_history_s", self.pose_history_s),
            ("orient_tolerance_deg", self.orient_tolerance_deg),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(DriveError::InvalidConfig(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }

        let gains = [
            ("drive_ks", self.drive_ks),
            ("drive_kv", self.drive_kv),
            ("drive_kp", self.drive_kp),
            ("turn_kp", self.turn_kp),
        ];
        let mut std_devs = self.vision_std_devs.into_iter().chain(self.odometry_std_devs);
        if gains.iter().any(|(_, g)| !(g.is_finite() && *g >= 0.0))
            || std_devs.any(|s| !(s.is_finite() && s >= 0.0))
        {
            return Err(DriveError::InvalidConfig(
                "gains and std devs must be finite and non-negative".to_string(),
            ));
        }

        if !(MIN_LOOP_PERIOD_S..=MAX_LOOP_PERIOD_S).contains(&self.loop_period_s) {
            return Err(DriveError::InvalidConfig(format!(
                "loop_period_s must be within {}..={}s, got {}",
                MIN_LOOP_PERIOD_S, MAX_LOOP_PERIOD_S, self.loop_period_s
            )));
        }
        if self.pose_history_s > MAX_POSE_HISTORY_S {
            return Err(DriveError::InvalidConfig(format!(
                "pose_history_s must be at most {}s, got {}",
                MAX_POSE_HISTORY_S, self.pose_history_s
            )));
        }
        Ok(())
    }

    /// Load from `path`, falling back to defaults (with a warning) on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::load(path).unwrap_or_else(|e| {
                warn!("{}; using default drive config", e);
                Self::default()
            }),
            None => Self::default(),
        }
    }
}

/// Chassis parameters handed through to the trajectory follower
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub mass_kg: f64,
    pub moi_kg_m2: f64,
    pub wheel_cof: f64,
    pub max_drive_velocity_mps: f64,
}

impl PlannerConfig {
    /// Zero-capability config used when nothing valid was loaded
    pub const fn zero() -> Self {
        Self {
            mass_kg: 0.0,
            moi_kg_m2: 0.0,
            wheel_cof: 0.0,
            max_drive_velocity_mps: 0.0,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn load_or_zero(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::load(path).unwrap_or_else(|e| {
                warn!("{}; planner gets a zero-capability config", e);
                Self::zero()
            }),
            None => {
                info!("No planner config given; planner gets a zero-capability config");
                Self::zero()
            }
        }
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|source| DriveError::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| DriveError::ConfigParse {
        path: path.to_path_buf(),
        source,
    })
}
