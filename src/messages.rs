// Message types on the zenoh bus

use serde::{Deserialize, Serialize};

use crate::drive::Drive;
use crate::drive::geometry::{ChassisSpeeds, Pose2d};
use crate::drive::io::FiducialTarget;
use crate::drive::kinematics::{MODULE_COUNT, ModuleState};
use crate::drive::landmark::AllianceSource;

// Request from teleop/planner -> runtime
// Tagged by "mode", e.g. {"mode":"velocity","vx":1.0,"vy":0.0,"omega":0.0}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DriveRequest {
    /// Robot-relative chassis velocity, m/s and rad/s
    Velocity { vx: f64, vy: f64, omega: f64 },
    Stop,
    StopX,
    /// Steer modules to these angles (FL, FR, BL, BR), radians
    Orient { angles: [f64; MODULE_COUNT] },
    /// Point every wheel along the drive circle
    OrientCircle,
    CharacterizeFf,
    CharacterizeWheelRadius,
    ResetGyro,
}

impl DriveRequest {
    /// Requests that keep running across cycles until replaced
    pub fn is_continuous(&self) -> bool {
        matches!(
            self,
            DriveRequest::Velocity { .. } | DriveRequest::CharacterizeFf | DriveRequest::CharacterizeWheelRadius
        )
    }
}

// Pose seed from planner/operator -> runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseReset {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl From<PoseReset> for Pose2d {
    fn from(reset: PoseReset) -> Self {
        Pose2d::new(reset.x, reset.y, reset.heading)
    }
}

// Vision sample from the camera pipeline -> runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionMessage {
    pub pose: Pose2d,
    /// Capture-to-publish latency, seconds
    #[serde(default)]
    pub latency_s: f64,
    pub tag_count: u32,
    #[serde(default)]
    pub fiducials: Vec<FiducialTarget>,
}

/// Telemetry published by runtime every cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveTelemetry {
    pub timestamp: f64,
    pub enabled: bool,
    pub pose: Pose2d,
    pub measured_speeds: ChassisSpeeds,
    pub measured_states: [ModuleState; MODULE_COUNT],
    /// Empty while disabled
    pub setpoint_states: Vec<ModuleState>,
    pub optimized_states: Vec<ModuleState>,
    pub gyro_connected: bool,
    pub drive_disconnected: [bool; MODULE_COUNT],
    pub turn_disconnected: [bool; MODULE_COUNT],
    pub vision_accepted: bool,
    pub orienting: bool,
    pub speaker_distance_m: f64,
    pub speaker_bearing_deg: f64,
    pub closest_tag: Option<u32>,
}

impl DriveTelemetry {
    pub fn capture(drive: &Drive, alliance: &dyn AllianceSource) -> Self {
        let enabled = drive.is_enabled();
        let setpoint_states = if enabled {
            drive.setpoint().module_states.to_vec()
        } else {
            Vec::new()
        };
        Self {
            timestamp: drive.now(),
            enabled,
            pose: drive.pose(),
            measured_speeds: drive.measured_chassis_speeds(),
            measured_states: drive.module_states(),
            setpoint_states,
            optimized_states: drive.optimized_states().map(|s| s.to_vec()).unwrap_or_default(),
            gyro_connected: drive.gyro_connected(),
            drive_disconnected: drive.drive_disconnected(),
            turn_disconnected: drive.turn_disconnected(),
            vision_accepted: drive.vision_accepted(),
            orienting: drive.is_orienting(),
            speaker_distance_m: drive.distance_from_speaker(alliance),
            speaker_bearing_deg: drive.bearing_from_speaker_deg(alliance),
            closest_tag: drive.closest_tag().map(|t| t.id),
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// Commands flowing but a gyro or actuator is disconnected
    Degraded,
}
