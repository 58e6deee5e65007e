// Swerve inverse/forward kinematics for the four-module base
// Converts chassis velocities (vx, vy, omega) to per-module speed + angle, and
// recovers the best-fit chassis motion from measured module deltas.

use nalgebra::{SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use super::geometry::{ChassisSpeeds, Translation2d, Twist2d, wrap_angle};
use crate::error::DriveError;

/// Number of swerve modules, ordered FL, FR, BL, BR everywhere
pub const MODULE_COUNT: usize = 4;

/// Commanded or measured instantaneous motion of one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    /// Wheel surface speed in m/s (signed)
    pub speed: f64,
    /// Steer angle in radians
    pub angle: f64,
}

impl ModuleState {
    pub fn new(speed: f64, angle: f64) -> Self {
        Self {
            speed,
            angle: wrap_angle(angle),
        }
    }

    /// Pick the cheaper of `angle` and `angle + π` relative to `current`.
    ///
    /// Flipping the steer by half a turn while reversing the wheel gives the
    /// same ground motion, so a target more than 90° away is never chased.
    pub fn optimize(&self, current: f64) -> ModuleState {
        let delta = wrap_angle(self.angle - current);
        if delta.abs() > std::f64::consts::FRAC_PI_2 {
            ModuleState::new(-self.speed, self.angle + std::f64::consts::PI)
        } else {
            ModuleState::new(self.speed, self.angle)
        }
    }
}

/// Cumulative wheel travel and steer angle of one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModulePosition {
    /// Meters travelled since the module was zeroed
    pub distance: f64,
    /// Steer angle in radians
    pub angle: f64,
}

impl ModulePosition {
    pub fn new(distance: f64, angle: f64) -> Self {
        Self {
            distance,
            angle: wrap_angle(angle),
        }
    }
}

/// Fixed module offsets from the robot center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeometryLayout {
    pub track_width_x: f64,
    pub track_width_y: f64,
}

impl GeometryLayout {
    pub fn new(track_width_x: f64, track_width_y: f64) -> Self {
        Self {
            track_width_x,
            track_width_y,
        }
    }

    /// Module offsets as [FL, FR, BL, BR]
    pub fn module_translations(&self) -> [Translation2d; MODULE_COUNT] {
        let hx = self.track_width_x / 2.0;
        let hy = self.track_width_y / 2.0;
        [
            Translation2d::new(hx, hy),
            Translation2d::new(hx, -hy),
            Translation2d::new(-hx, hy),
            Translation2d::new(-hx, -hy),
        ]
    }

    /// Distance from the center of rotation to each module
    pub fn drive_base_radius(&self) -> f64 {
        (self.track_width_x / 2.0).hypot(self.track_width_y / 2.0)
    }
}

/// Stateless geometry transform, plus the angles held while stationary
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    translations: [Translation2d; MODULE_COUNT],
    // Rows [1, 0, -y], [0, 1, x] per module
    inverse: SMatrix<f64, 8, 3>,
    // Least-squares pseudo-inverse of `inverse`
    forward: SMatrix<f64, 3, 8>,
    // Angles reported for a zero-velocity request
    headings: [f64; MODULE_COUNT],
}

impl SwerveKinematics {
    pub fn new(layout: &GeometryLayout) -> Result<Self, DriveError> {
        Self::from_translations(layout.module_translations())
    }

    pub fn from_translations(translations: [Translation2d; MODULE_COUNT]) -> Result<Self, DriveError> {
        let mut inverse = SMatrix::<f64, 8, 3>::zeros();
        for (i, t) in translations.iter().enumerate() {
            inverse[(i * 2, 0)] = 1.0;
            inverse[(i * 2, 2)] = -t.y;
            inverse[(i * 2 + 1, 1)] = 1.0;
            inverse[(i * 2 + 1, 2)] = t.x;
        }

        let normal = inverse.transpose() * inverse;
        let normal_inv = normal.try_inverse().ok_or_else(|| {
            DriveError::InvalidGeometry(format!(
                "module offsets {:?} do not constrain rotation",
                translations
            ))
        })?;
        let forward = normal_inv * inverse.transpose();

        Ok(Self {
            translations,
            inverse,
            forward,
            headings: [0.0; MODULE_COUNT],
        })
    }

    pub fn translations(&self) -> &[Translation2d; MODULE_COUNT] {
        &self.translations
    }

    /// Override the angles reported for the next zero-velocity request
    pub fn reset_headings(&mut self, headings: [f64; MODULE_COUNT]) {
        self.headings = headings.map(wrap_angle);
    }

    /// Convert a chassis velocity to the four module states.
    ///
    /// A zero request keeps every module at its last commanded angle, so
    /// wheels never snap back to 0 rad when the robot stops.
    pub fn to_module_states(&mut self, speeds: &ChassisSpeeds) -> [ModuleState; MODULE_COUNT] {
        if speeds.is_zero() {
            return self.headings.map(|angle| ModuleState::new(0.0, angle));
        }

        let chassis = Vector3::new(speeds.vx, speeds.vy, speeds.omega);
        let module_vectors: SVector<f64, 8> = self.inverse * chassis;

        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (i, state) in states.iter_mut().enumerate() {
            let x = module_vectors[i * 2];
            let y = module_vectors[i * 2 + 1];
            let speed = x.hypot(y);
            // A module sitting on the center of rotation has no direction of its own
            let angle = if speed > 1e-9 { y.atan2(x) } else { self.headings[i] };
            *state = ModuleState::new(speed, angle);
            self.headings[i] = state.angle;
        }
        states
    }

    /// Best-fit chassis velocity for measured module states
    pub fn to_chassis_speeds(&self, states: &[ModuleState; MODULE_COUNT]) -> ChassisSpeeds {
        let mut measured = SVector::<f64, 8>::zeros();
        for (i, state) in states.iter().enumerate() {
            measured[i * 2] = state.speed * state.angle.cos();
            measured[i * 2 + 1] = state.speed * state.angle.sin();
        }
        let chassis = self.forward * measured;
        ChassisSpeeds::new(chassis[0], chassis[1], chassis[2])
    }

    /// Best-fit rigid-body motion explaining the module travel between two samples
    pub fn to_twist(
        &self,
        start: &[ModulePosition; MODULE_COUNT],
        end: &[ModulePosition; MODULE_COUNT],
    ) -> Twist2d {
        let mut deltas = SVector::<f64, 8>::zeros();
        for i in 0..MODULE_COUNT {
            let distance = end[i].distance - start[i].distance;
            deltas[i * 2] = distance * end[i].angle.cos();
            deltas[i * 2 + 1] = distance * end[i].angle.sin();
        }
        let twist = self.forward * deltas;
        Twist2d::new(twist[0], twist[1], twist[2])
    }
}

/// Scale all speeds uniformly so the fastest module stays within `max_speed`.
///
/// Angles and speed ratios are untouched, which preserves the direction and
/// curvature of the chassis motion.
pub fn desaturate(states: &mut [ModuleState; MODULE_COUNT], max_speed: f64) {
    let fastest = states.iter().map(|s| s.speed.abs()).fold(0.0f64, f64::max);

    if fastest > max_speed && fastest > 0.0 {
        let scale = max_speed / fastest;
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }
}
