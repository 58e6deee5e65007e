// Offline system-identification routines
//
// Both routines are stepped once per control cycle by the host while the
// drive runs the matching open-loop entry point. Neither is used in normal
// driving.

use serde::{Deserialize, Serialize};

use super::geometry::angle_delta;
use super::kinematics::MODULE_COUNT;

/// Seconds of zero output before the ramp starts
pub const FF_START_DELAY_S: f64 = 2.0;
/// Voltage ramp rate, volts per second
pub const FF_RAMP_RATE_V_PER_S: f64 = 0.1;

/// Spin rate for wheel-radius characterization, rad/s
pub const WHEEL_RADIUS_MAX_OMEGA: f64 = 0.25;
/// Spin-up rate limit, rad/s^2
pub const WHEEL_RADIUS_RAMP_RATE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedforwardFit {
    /// Static friction voltage
    pub ks: f64,
    /// Volts per wheel rad/s
    pub kv: f64,
    pub r_squared: f64,
}

/// Quasistatic voltage ramp, fitting volts = ks + kv * velocity
#[derive(Debug, Clone)]
pub struct FeedforwardCharacterization {
    start_delay_s: f64,
    ramp_rate: f64,
    elapsed: f64,
    velocities: Vec<f64>,
    volts: Vec<f64>,
}

impl Default for FeedforwardCharacterization {
    fn default() -> Self {
        Self::new(FF_START_DELAY_S, FF_RAMP_RATE_V_PER_S)
    }
}

impl FeedforwardCharacterization {
    pub fn new(start_delay_s: f64, ramp_rate: f64) -> Self {
        Self {
            start_delay_s,
            ramp_rate,
            elapsed: 0.0,
            velocities: Vec::new(),
            volts: Vec::new(),
        }
    }

    /// Advance by `dt` and return the voltage to command this cycle.
    ///
    /// `velocity` is the mean drive wheel speed measured this cycle.
    pub fn step(&mut self, dt: f64, velocity: f64) -> f64 {
        self.elapsed += dt;
        if self.elapsed < self.start_delay_s {
            return 0.0;
        }
        let volts = (self.elapsed - self.start_delay_s) * self.ramp_rate;
        self.velocities.push(velocity);
        self.volts.push(volts);
        volts
    }

    pub fn sample_count(&self) -> usize {
        self.velocities.len()
    }

    /// Least-squares line through the samples; None until the wheels moved
    pub fn fit(&self) -> Option<FeedforwardFit> {
        let n = self.velocities.len() as f64;
        if self.velocities.len() < 2 {
            return None;
        }
        let mean_v = self.velocities.iter().sum::<f64>() / n;
        let mean_u = self.volts.iter().sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        let mut syy = 0.0;
        for (v, u) in self.velocities.iter().zip(&self.volts) {
            sxx += (v - mean_v) * (v - mean_v);
            sxy += (v - mean_v) * (u - mean_u);
            syy += (u - mean_u) * (u - mean_u);
        }
        if sxx < 1e-12 {
            return None;
        }

        let kv = sxy / sxx;
        let ks = mean_u - kv * mean_v;
        let r_squared = if syy < 1e-12 { 1.0 } else { (sxy * sxy) / (sxx * syy) };
        Some(FeedforwardFit { ks, kv, r_squared })
    }
}

/// Spin in place and compare gyro rotation against wheel travel
#[derive(Debug, Clone)]
pub struct WheelRadiusCharacterization {
    drive_base_radius: f64,
    target_omega: f64,
    ramp_rate: f64,
    omega: f64,
    last_yaw: f64,
    accumulated_yaw: f64,
    start_positions: [f64; MODULE_COUNT],
    average_travel: f64,
}

impl WheelRadiusCharacterization {
    /// `positions` are per-module drive wheel rotations in radians
    pub fn new(drive_base_radius: f64, yaw: f64, positions: [f64; MODULE_COUNT]) -> Self {
        Self {
            drive_base_radius,
            target_omega: WHEEL_RADIUS_MAX_OMEGA,
            ramp_rate: WHEEL_RADIUS_RAMP_RATE,
            omega: 0.0,
            last_yaw: yaw,
            accumulated_yaw: 0.0,
            start_positions: positions,
            average_travel: 0.0,
        }
    }

    /// Spin the other way
    pub fn reversed(mut self) -> Self {
        self.target_omega = -self.target_omega;
        self
    }

    /// Advance by `dt` and return the rotation rate to command
    pub fn step(&mut self, dt: f64, yaw: f64, positions: [f64; MODULE_COUNT]) -> f64 {
        self.accumulated_yaw += angle_delta(self.last_yaw, yaw);
        self.last_yaw = yaw;

        self.average_travel = positions
            .iter()
            .zip(&self.start_positions)
            .map(|(now, start)| (now - start).abs())
            .sum::<f64>()
            / MODULE_COUNT as f64;

        let max_change = self.ramp_rate * dt;
        self.omega += (self.target_omega - self.omega).clamp(-max_change, max_change);
        self.omega
    }

    pub fn accumulated_yaw(&self) -> f64 {
        self.accumulated_yaw
    }

    /// Wheel radius implied so far, meters; None before the wheels turned
    pub fn effective_wheel_radius(&self) -> Option<f64> {
        if self.average_travel < 1e-6 {
            return None;
        }
        Some(self.accumulated_yaw.abs() * self.drive_base_radius / self.average_travel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::geometry::wrap_angle;
    use approx::assert_relative_eq;

    #[test]
    fn test_ff_waits_then_ramps() {
        let mut routine = FeedforwardCharacterization::new(0.1, 1.0);
        assert_eq!(routine.step(0.05, 0.0), 0.0);
        assert_eq!(routine.sample_count(), 0);
        routine.step(0.05, 0.0);
        let volts = routine.step(0.05, 0.0);
        assert_relative_eq!(volts, 0.05, epsilon = 1e-9);
        assert!(routine.sample_count() >= 1);
    }

    #[test]
    fn test_ff_fit_recovers_linear_plant() {
        // Plant: v = (u - 0.2) / 0.12 once above static friction
        let (ks, kv) = (0.2, 0.12);
        let mut routine = FeedforwardCharacterization::new(0.0, 1.0);
        let mut velocity = 0.0;
        for _ in 0..400 {
            let volts = routine.step(0.02, velocity);
            velocity = ((volts - ks) / kv).max(0.0);
        }
        // Feed the steady-state relation directly for an exact check
        let mut exact = FeedforwardCharacterization::new(0.0, 1.0);
        for i in 1..=100 {
            let volts = i as f64 * 0.02 + ks;
            exact.velocities.push((volts - ks) / kv);
            exact.volts.push(volts);
        }
        let fit = exact.fit().unwrap();
        assert_relative_eq!(fit.ks, ks, epsilon = 1e-9);
        assert_relative_eq!(fit.kv, kv, epsilon = 1e-9);
        assert_relative_eq!(fit.r_squared, 1.0, epsilon = 1e-9);
        assert!(routine.fit().is_some());
    }

    #[test]
    fn test_ff_fit_needs_motion() {
        let mut routine = FeedforwardCharacterization::new(0.0, 1.0);
        for _ in 0..10 {
            routine.step(0.02, 0.0);
        }
        assert!(routine.fit().is_none());
    }

    #[test]
    fn test_wheel_radius_from_spin() {
        let base_radius = 0.4669;
        let wheel_radius = 0.05;
        let mut routine = WheelRadiusCharacterization::new(base_radius, 3.0, [0.0; MODULE_COUNT]);
        assert!(routine.effective_wheel_radius().is_none());

        // One full turn, crossing the ±π wrap along the way
        let steps = 100;
        for i in 1..=steps {
            let turned = 2.0 * std::f64::consts::PI * i as f64 / steps as f64;
            let wheel_rads = turned * base_radius / wheel_radius;
            routine.step(0.02, wrap_angle(3.0 + turned), [wheel_rads; MODULE_COUNT]);
        }
        assert_relative_eq!(routine.accumulated_yaw(), 2.0 * std::f64::consts::PI, epsilon = 1e-9);
        assert_relative_eq!(routine.effective_wheel_radius().unwrap(), wheel_radius, epsilon = 1e-9);
    }

    #[test]
    fn test_wheel_radius_spin_up_is_rate_limited() {
        let mut routine = WheelRadiusCharacterization::new(0.5, 0.0, [0.0; MODULE_COUNT]).reversed();
        let first = routine.step(0.02, 0.0, [0.0; MODULE_COUNT]);
        assert_relative_eq!(first, -WHEEL_RADIUS_RAMP_RATE * 0.02, epsilon = 1e-12);
        for _ in 0..1000 {
            routine.step(0.02, 0.0, [0.0; MODULE_COUNT]);
        }
        assert_relative_eq!(routine.step(0.02, 0.0, [0.0; MODULE_COUNT]), -WHEEL_RADIUS_MAX_OMEGA, epsilon = 1e-12);
    }
}
