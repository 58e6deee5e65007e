// Hardware capability traits for the drive
//
// Each actuator/sensor role is a trait; concrete adapters (simulation, vendor
// drivers) are picked at construction and the drive only sees the trait.
// `update_inputs` fills a snapshot in place: an adapter that fails to read
// leaves the previous values alone, so stale telemetry is held.

use serde::{Deserialize, Serialize};

use super::geometry::Pose2d;

/// Raw telemetry from one swerve module, in radians, volts and amps
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleIoInputs {
    /// Wheel rotation (after gearing) since power-on
    pub drive_position_rad: f64,
    pub drive_velocity_rad_per_sec: f64,
    pub drive_applied_volts: f64,
    pub drive_current_amps: f64,

    /// Absolute steer encoder, offset-corrected
    pub turn_absolute_position: f64,
    /// Relative steer encoder, zero at power-on
    pub turn_position: f64,
    pub turn_velocity_rad_per_sec: f64,
    pub turn_applied_volts: f64,
    pub turn_current_amps: f64,

    pub drive_connected: bool,
    pub turn_connected: bool,
}

/// Drive + steer actuators and encoders of one module
pub trait ModuleIo: Send {
    fn update_inputs(&mut self, inputs: &mut ModuleIoInputs);

    fn set_drive_voltage(&mut self, volts: f64);

    fn set_turn_voltage(&mut self, volts: f64);

    fn set_drive_brake_mode(&mut self, _enable: bool) {}

    fn set_turn_brake_mode(&mut self, _enable: bool) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GyroIoInputs {
    pub connected: bool,
    /// Yaw in radians, CCW positive
    pub yaw: f64,
    pub yaw_velocity_rad_per_sec: f64,
}

pub trait GyroIo: Send {
    fn update_inputs(&mut self, inputs: &mut GyroIoInputs);

    /// Re-zero the yaw
    fn reset(&mut self);
}

/// One fiducial seen by the camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiducialTarget {
    pub id: u32,
    /// Horizontal offset from the crosshair, degrees
    pub tx: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisionIoInputs {
    pub pose: Pose2d,
    /// Capture time on the drive clock, seconds
    pub capture_timestamp: f64,
    /// Number of fiducials used for `pose`
    pub detection_count: u32,
    pub fiducials: Vec<FiducialTarget>,
}

pub trait VisionIo: Send {
    fn update_inputs(&mut self, inputs: &mut VisionIoInputs);

    /// Heading hint for sources that solve pose with a known yaw
    fn set_robot_orientation(&mut self, _heading_deg: f64) {}
}

/// Gyro placeholder for robots without one; heading falls back to odometry
#[derive(Debug, Default)]
pub struct NoGyro;

impl GyroIo for NoGyro {
    fn update_inputs(&mut self, inputs: &mut GyroIoInputs) {
        inputs.connected = false;
    }

    fn reset(&mut self) {}
}

/// Vision placeholder that never reports detections
#[derive(Debug, Default)]
pub struct NoVision;

impl VisionIo for NoVision {
    fn update_inputs(&mut self, inputs: &mut VisionIoInputs) {
        inputs.detection_count = 0;
        inputs.fiducials.clear();
    }
}
