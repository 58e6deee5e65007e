// Planar geometry for the swerve base
//
// Field frame: x forward (away from blue wall), y left, CCW-positive heading.
// Robot frame: x forward, y left.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Threshold below which arc integration falls back to its Taylor expansion
const SMALL_ANGLE: f64 = 1e-9;

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI { PI } else { wrapped }
}

/// Shortest signed rotation taking `from` to `to`
pub fn angle_delta(from: f64, to: f64) -> f64 {
    wrap_angle(to - from)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Translation2d {
    pub x: f64,
    pub y: f64,
}

impl Translation2d {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Direction of this vector from the origin, radians
    pub fn angle(&self) -> f64 {
        self.y.atan2(self.x)
    }

    pub fn rotate_by(&self, angle: f64) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    pub fn distance(&self, other: &Translation2d) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Incremental rigid-body motion along an arc, expressed in the starting frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

impl Twist2d {
    pub const fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        Self { dx, dy, dtheta }
    }
}

/// Field-relative robot pose
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2d {
    pub x: f64,
    pub y: f64,
    /// Heading in radians, kept in (-π, π]
    pub heading: f64,
}

impl Pose2d {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: wrap_angle(heading),
        }
    }

    pub fn translation(&self) -> Translation2d {
        Translation2d::new(self.x, self.y)
    }

    /// Apply `other` as a transform expressed in this pose's frame
    pub fn transform_by(&self, other: &Pose2d) -> Pose2d {
        let offset = other.translation().rotate_by(self.heading);
        Pose2d::new(
            self.x + offset.x,
            self.y + offset.y,
            self.heading + other.heading,
        )
    }

    /// Express this pose in the frame of `origin`
    pub fn relative_to(&self, origin: &Pose2d) -> Pose2d {
        let offset = Translation2d::new(self.x - origin.x, self.y - origin.y).rotate_by(-origin.heading);
        Pose2d::new(offset.x, offset.y, self.heading - origin.heading)
    }

    /// Integrate a twist along its constant-curvature arc
    pub fn exp(&self, twist: &Twist2d) -> Pose2d {
        let (sin_theta, cos_theta) = twist.dtheta.sin_cos();
        let (s, c) = if twist.dtheta.abs() < SMALL_ANGLE {
            (
                1.0 - twist.dtheta * twist.dtheta / 6.0,
                0.5 * twist.dtheta,
            )
        } else {
            (sin_theta / twist.dtheta, (1.0 - cos_theta) / twist.dtheta)
        };

        let delta = Pose2d {
            x: twist.dx * s - twist.dy * c,
            y: twist.dx * c + twist.dy * s,
            heading: twist.dtheta,
        };
        self.transform_by(&delta)
    }

    /// Twist that carries this pose onto `end` along a single arc
    pub fn log(&self, end: &Pose2d) -> Twist2d {
        let transform = end.relative_to(self);
        let dtheta = transform.heading;
        let half_dtheta = dtheta / 2.0;
        let cos_minus_one = dtheta.cos() - 1.0;

        let half_theta_by_tan = if cos_minus_one.abs() < SMALL_ANGLE {
            1.0 - dtheta * dtheta / 12.0
        } else {
            -(half_dtheta * dtheta.sin()) / cos_minus_one
        };

        Twist2d::new(
            half_theta_by_tan * transform.x + half_dtheta * transform.y,
            -half_dtheta * transform.x + half_theta_by_tan * transform.y,
            dtheta,
        )
    }
}

/// Robot-relative chassis velocity: m/s forward, m/s left, rad/s CCW
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChassisSpeeds {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl ChassisSpeeds {
    pub const fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }

    pub fn is_zero(&self) -> bool {
        self.vx.abs() < 1e-9 && self.vy.abs() < 1e-9 && self.omega.abs() < 1e-9
    }

    /// Compensate for the commanded twist being held for a whole period.
    ///
    /// Finds the speeds that, held constant for `dt`, land the robot on the
    /// pose the naive `v * dt` step would have reached. Without this the
    /// robot skews sideways when translating and rotating at once.
    pub fn discretize(&self, dt: f64) -> ChassisSpeeds {
        if dt <= 0.0 {
            return *self;
        }
        let target = Pose2d {
            x: self.vx * dt,
            y: self.vy * dt,
            heading: self.omega * dt,
        };
        let twist = Pose2d::default().log(&target);
        ChassisSpeeds::new(twist.dx / dt, twist.dy / dt, twist.dtheta / dt)
    }
}
