// Swerve drive coordinator
//
// Owns the four modules, the gyro/vision sources, kinematics and the pose
// estimator. The host calls `tick` once per control period; commands issued
// between ticks only set targets, which `tick` pushes to the actuators.

pub mod characterization;
pub mod estimator;
pub mod geometry;
pub mod io;
pub mod kinematics;
pub mod landmark;
pub mod module;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{DriveConfig, PlannerConfig};
use crate::error::Result;
use estimator::PoseEstimator;
use geometry::{ChassisSpeeds, Pose2d, wrap_angle};
use io::{FiducialTarget, GyroIo, GyroIoInputs, ModuleIo, VisionIo, VisionIoInputs};
use kinematics::{MODULE_COUNT, ModulePosition, ModuleState, SwerveKinematics, desaturate};
use landmark::AllianceSource;
use module::{Module, ModuleGains};

/// Last command handed to the modules
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Setpoint {
    pub speeds: ChassisSpeeds,
    /// Desaturated states before per-module optimization
    pub module_states: [ModuleState; MODULE_COUNT],
}

/// Heading source with glitch-free gyro failover.
///
/// While the gyro is connected its yaw (plus a re-anchoring offset) is used;
/// otherwise the odometry twist is integrated from the last good value. On
/// reconnect the offset is recomputed so the heading does not jump.
#[derive(Debug, Clone, Default)]
struct HeadingTracker {
    heading: f64,
    gyro_offset: f64,
    gyro_anchored: bool,
}

impl HeadingTracker {
    fn update(&mut self, gyro: &GyroIoInputs, odometry_dtheta: f64) -> f64 {
        if gyro.connected {
            if !self.gyro_anchored {
                self.gyro_offset = wrap_angle(self.heading - gyro.yaw);
                self.gyro_anchored = true;
            }
            self.heading = wrap_angle(gyro.yaw + self.gyro_offset);
        } else {
            self.gyro_anchored = false;
            self.heading = wrap_angle(self.heading + odometry_dtheta);
        }
        self.heading
    }

    fn reset(&mut self) {
        self.heading = 0.0;
        self.gyro_offset = 0.0;
        self.gyro_anchored = false;
    }
}

pub struct Drive {
    config: DriveConfig,
    planner: PlannerConfig,
    modules: [Module; MODULE_COUNT],
    gyro: Box<dyn GyroIo>,
    gyro_inputs: GyroIoInputs,
    gyro_was_connected: bool,
    vision: Box<dyn VisionIo>,
    vision_inputs: VisionIoInputs,
    vision_accepted: bool,
    kinematics: SwerveKinematics,
    estimator: PoseEstimator,
    heading: HeadingTracker,
    last_positions: [ModulePosition; MODULE_COUNT],
    setpoint: Setpoint,
    optimized_states: Option<[ModuleState; MODULE_COUNT]>,
    orienting: Option<[f64; MODULE_COUNT]>,
    enabled: bool,
    first_cycle: bool,
    rejecting_commands: bool,
    clock: f64,
}

impl Drive {
    pub fn new(
        config: DriveConfig,
        planner: PlannerConfig,
        gyro: Box<dyn GyroIo>,
        vision: Box<dyn VisionIo>,
        module_ios: [Box<dyn ModuleIo>; MODULE_COUNT],
    ) -> Result<Self> {
        config.validate()?;
        let kinematics = SwerveKinematics::new(&config.layout())?;
        let gains = ModuleGains::from(&config);
        let [fl, fr, bl, br] = module_ios;
        let modules = [
            Module::new(fl, 0, gains),
            Module::new(fr, 1, gains),
            Module::new(bl, 2, gains),
            Module::new(br, 3, gains),
        ];
        let estimator = PoseEstimator::new(
            kinematics.clone(),
            0.0,
            [ModulePosition::default(); MODULE_COUNT],
            Pose2d::default(),
            &config,
        );

        info!(
            "Drive ready: max {:.2} m/s, {:.2} rad/s, base radius {:.3} m",
            config.max_linear_speed_mps,
            config.max_angular_speed(),
            config.drive_base_radius()
        );

        Ok(Self {
            config,
            planner,
            modules,
            gyro,
            gyro_inputs: GyroIoInputs::default(),
            gyro_was_connected: true,
            vision,
            vision_inputs: VisionIoInputs::default(),
            vision_accepted: false,
            kinematics,
            estimator,
            heading: HeadingTracker::default(),
            last_positions: [ModulePosition::default(); MODULE_COUNT],
            setpoint: Setpoint::default(),
            optimized_states: None,
            orienting: None,
            enabled: false,
            first_cycle: true,
            rejecting_commands: false,
            clock: 0.0,
        })
    }

    /// One control cycle: read sensors, update the pose, drive the actuators
    pub fn tick(&mut self, dt: f64, enabled: bool) {
        self.clock += dt;
        if enabled != self.enabled {
            info!("Drive {}", if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;

        self.gyro.update_inputs(&mut self.gyro_inputs);
        self.vision.update_inputs(&mut self.vision_inputs);
        for module in self.modules.iter_mut() {
            module.update_inputs();
        }
        self.report_gyro();

        if !enabled {
            for module in self.modules.iter_mut() {
                module.stop();
            }
            self.optimized_states = None;
            self.orienting = None;
        }

        self.update_odometry();
        self.update_orientation();

        for module in self.modules.iter_mut() {
            module.apply_outputs();
        }
    }

    fn report_gyro(&mut self) {
        let connected = self.gyro_inputs.connected;
        if connected != self.gyro_was_connected {
            if connected {
                info!("Gyro reconnected");
            } else {
                warn!("Gyro disconnected, heading from odometry");
            }
            self.gyro_was_connected = connected;
        }
    }

    fn update_odometry(&mut self) {
        let positions = self.module_positions();
        let twist = self.kinematics.to_twist(&self.last_positions, &positions);
        self.last_positions = positions;
        // Boot encoder readings are not motion
        let dtheta = if self.first_cycle { 0.0 } else { twist.dtheta };
        let heading = self.heading.update(&self.gyro_inputs, dtheta);

        if self.first_cycle {
            // Encoders may not start at zero; anchor instead of integrating
            let pose = self.estimator.pose();
            self.estimator.reset_position(heading, positions, pose);
            self.first_cycle = false;
        } else {
            self.estimator.update(self.clock, heading, positions);
        }

        let pose = self.estimator.pose();
        self.vision.set_robot_orientation(pose.heading.to_degrees());

        self.vision_accepted = false;
        if self.vision_trusted() {
            self.vision_accepted = self.estimator.add_vision_measurement(
                self.vision_inputs.pose,
                self.vision_inputs.capture_timestamp,
            );
        }
    }

    /// Skip vision with no detections or while spinning fast
    fn vision_trusted(&self) -> bool {
        if self.vision_inputs.detection_count == 0 {
            return false;
        }
        let yaw_rate = if self.gyro_inputs.connected {
            self.gyro_inputs.yaw_velocity_rad_per_sec
        } else {
            self.measured_chassis_speeds().omega
        };
        yaw_rate.to_degrees().abs() < self.config.vision_max_yaw_rate_deg_s
    }

    fn update_orientation(&mut self) {
        let Some(targets) = self.orienting else {
            return;
        };
        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (i, module) in self.modules.iter_mut().enumerate() {
            module.run_orientation(targets[i]);
            states[i] = ModuleState::new(0.0, module.angle());
        }
        self.setpoint = Setpoint {
            speeds: ChassisSpeeds::default(),
            module_states: states,
        };

        let tolerance = self.config.orient_tolerance_deg.to_radians();
        if self.modules.iter().all(|m| m.at_angle_setpoint(tolerance)) {
            info!("Modules oriented");
            self.orienting = None;
        }
    }

    /// Drive at `speeds` (robot frame): discretize, convert, desaturate, optimize
    pub fn run_velocity(&mut self, speeds: ChassisSpeeds) {
        if !self.enabled {
            debug!("Velocity request ignored while disabled");
            return;
        }
        let speeds = if speeds.is_finite() {
            self.rejecting_commands = false;
            speeds
        } else {
            if !self.rejecting_commands {
                warn!("Non-finite velocity request {:?}, stopping instead", speeds);
                self.rejecting_commands = true;
            }
            ChassisSpeeds::default()
        };
        self.orienting = None;

        let discrete = speeds.discretize(self.config.loop_period_s);
        let mut states = self.kinematics.to_module_states(&discrete);
        desaturate(&mut states, self.config.max_linear_speed_mps);

        let mut optimized = [ModuleState::default(); MODULE_COUNT];
        for (i, module) in self.modules.iter_mut().enumerate() {
            optimized[i] = module.run_setpoint(states[i]);
        }

        self.setpoint = Setpoint {
            speeds,
            module_states: states,
        };
        self.optimized_states = Some(optimized);
    }

    pub fn stop(&mut self) {
        self.run_velocity(ChassisSpeeds::default());
    }

    /// Stop with every wheel pointing away from the center to resist pushing.
    ///
    /// The next nonzero velocity request steers out of the X.
    pub fn stop_with_x(&mut self) {
        let headings = self.kinematics.translations().map(|t| t.angle());
        self.kinematics.reset_headings(headings);
        self.stop();
    }

    /// Steer each module to `angles` with wheels stopped; see `is_orienting`
    pub fn orient_modules(&mut self, angles: [f64; MODULE_COUNT]) {
        if !self.enabled {
            debug!("Orientation request ignored while disabled");
            return;
        }
        self.orienting = Some(angles.map(wrap_angle));
        self.optimized_states = None;
        for (module, angle) in self.modules.iter_mut().zip(angles) {
            module.run_orientation(angle);
        }
    }

    pub fn orient_all(&mut self, angle: f64) {
        self.orient_modules([angle; MODULE_COUNT]);
    }

    /// True until every module is within tolerance of its orientation target
    pub fn is_orienting(&self) -> bool {
        self.orienting.is_some()
    }

    /// Angles that put every wheel tangent to the drive circle
    pub fn circle_orientations(&self) -> [f64; MODULE_COUNT] {
        self.kinematics
            .translations()
            .map(|t| wrap_angle(t.angle() + std::f64::consts::FRAC_PI_2))
    }

    /// Open-loop drive voltage on all modules, for feedforward characterization
    pub fn run_characterization_volts(&mut self, volts: f64) {
        if !self.enabled {
            return;
        }
        self.orienting = None;
        self.optimized_states = None;
        for module in self.modules.iter_mut() {
            module.run_characterization(volts);
        }
    }

    /// Mean drive wheel speed, rad/s
    pub fn characterization_velocity(&self) -> f64 {
        self.modules
            .iter()
            .map(|m| m.characterization_velocity())
            .sum::<f64>()
            / MODULE_COUNT as f64
    }

    /// Per-module drive wheel rotation, rad
    pub fn wheel_radius_characterization_positions(&self) -> [f64; MODULE_COUNT] {
        [0, 1, 2, 3].map(|i| self.modules[i].position_rads())
    }

    /// Spin in place at `omega` rad/s
    pub fn run_wheel_radius_characterization(&mut self, omega: f64) {
        self.run_velocity(ChassisSpeeds::new(0.0, 0.0, omega));
    }

    pub fn pose(&self) -> Pose2d {
        self.estimator.pose()
    }

    pub fn rotation(&self) -> f64 {
        self.pose().heading
    }

    /// Teleport the estimate (operator re-zero, autonomous seed)
    pub fn set_pose(&mut self, pose: Pose2d) {
        info!("Pose reset to ({:.2}, {:.2}, {:.2})", pose.x, pose.y, pose.heading);
        let positions = self.module_positions();
        self.estimator
            .reset_position(self.heading.heading, positions, pose);
    }

    /// Re-zero the gyro; the robot's current direction becomes heading 0
    pub fn reset_gyro(&mut self) {
        self.gyro.reset();
        self.heading.reset();
        let pose = self.pose();
        let positions = self.module_positions();
        self.estimator
            .reset_position(0.0, positions, Pose2d::new(pose.x, pose.y, 0.0));
    }

    /// Heading fed to the estimator (gyro or odometry fallback), radians
    pub fn raw_heading(&self) -> f64 {
        self.heading.heading
    }

    pub fn module_states(&self) -> [ModuleState; MODULE_COUNT] {
        [0, 1, 2, 3].map(|i| self.modules[i].state())
    }

    pub fn module_positions(&self) -> [ModulePosition; MODULE_COUNT] {
        [0, 1, 2, 3].map(|i| self.modules[i].position())
    }

    pub fn modules(&self) -> &[Module; MODULE_COUNT] {
        &self.modules
    }

    /// Robot-relative velocity implied by the measured module states
    pub fn measured_chassis_speeds(&self) -> ChassisSpeeds {
        self.kinematics.to_chassis_speeds(&self.module_states())
    }

    pub fn setpoint(&self) -> &Setpoint {
        &self.setpoint
    }

    /// Optimized states from the last velocity request; None while disabled
    pub fn optimized_states(&self) -> Option<[ModuleState; MODULE_COUNT]> {
        self.optimized_states
    }

    pub fn max_linear_speed(&self) -> f64 {
        self.config.max_linear_speed_mps
    }

    pub fn max_angular_speed(&self) -> f64 {
        self.config.max_angular_speed()
    }

    pub fn drive_disconnected(&self) -> [bool; MODULE_COUNT] {
        [0, 1, 2, 3].map(|i| self.modules[i].drive_disconnected())
    }

    pub fn turn_disconnected(&self) -> [bool; MODULE_COUNT] {
        [0, 1, 2, 3].map(|i| self.modules[i].turn_disconnected())
    }

    pub fn gyro_connected(&self) -> bool {
        self.gyro_inputs.connected
    }

    /// Whether the last cycle applied a vision correction
    pub fn vision_accepted(&self) -> bool {
        self.vision_accepted
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Seconds since the drive started ticking
    pub fn now(&self) -> f64 {
        self.clock
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    /// Chassis parameters for the trajectory follower
    pub fn planner_config(&self) -> &PlannerConfig {
        &self.planner
    }

    pub fn speaker_pose(&self, alliance: &dyn AllianceSource) -> Pose2d {
        landmark::speaker_pose(alliance)
    }

    /// Field-frame direction from the robot to the speaker, radians
    pub fn rotation_to_speaker(&self, alliance: &dyn AllianceSource) -> f64 {
        landmark::rotation_to(&landmark::speaker_pose(alliance), &self.pose())
    }

    pub fn distance_from_speaker(&self, alliance: &dyn AllianceSource) -> f64 {
        landmark::distance_to(&landmark::speaker_pose(alliance), &self.pose())
    }

    /// Speaker bearing in the robot frame, degrees
    pub fn bearing_from_speaker_deg(&self, alliance: &dyn AllianceSource) -> f64 {
        landmark::bearing_deg(&landmark::speaker_pose(alliance), &self.pose())
    }

    /// Closest accepted fiducial in the latest vision frame, by bearing
    pub fn closest_tag(&self) -> Option<FiducialTarget> {
        landmark::closest_tag(&self.vision_inputs.fiducials, &self.config.valid_tag_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::io::{ModuleIoInputs, NoGyro, NoVision};
    use crate::error::DriveError;
    use crate::drive::landmark::{Alliance, FixedAlliance};
    use crate::drive::module::ModuleMode;
    use crate::drive::module::tests::{FakeHardware, FakeModuleIo, connected_at};
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};
    use std::sync::{Arc, Mutex};

    const DT: f64 = 0.02;

    #[derive(Clone, Default)]
    struct FakeGyro(Arc<Mutex<GyroIoInputs>>);

    impl GyroIo for FakeGyro {
        fn update_inputs(&mut self, inputs: &mut GyroIoInputs) {
            *inputs = *self.0.lock().unwrap();
        }

        fn reset(&mut self) {
            self.0.lock().unwrap().yaw = 0.0;
        }
    }

    #[derive(Clone, Default)]
    struct FakeVision(Arc<Mutex<VisionIoInputs>>);

    impl VisionIo for FakeVision {
        fn update_inputs(&mut self, inputs: &mut VisionIoInputs) {
            *inputs = self.0.lock().unwrap().clone();
        }
    }

    struct Rig {
        drive: Drive,
        modules: [Arc<Mutex<FakeHardware>>; MODULE_COUNT],
        gyro: Arc<Mutex<GyroIoInputs>>,
        vision: Arc<Mutex<VisionIoInputs>>,
    }

    impl Rig {
        fn new(angles: [f64; MODULE_COUNT]) -> Self {
            let modules = angles.map(|angle| {
                Arc::new(Mutex::new(FakeHardware {
                    inputs: connected_at(angle),
                    ..Default::default()
                }))
            });
            let gyro = FakeGyro::default();
            gyro.0.lock().unwrap().connected = true;
            let vision = FakeVision::default();
            let ios: [Box<dyn ModuleIo>; MODULE_COUNT] =
                modules.clone().map(|hw| Box::new(FakeModuleIo(hw)) as Box<dyn ModuleIo>);

            let drive = Drive::new(
                DriveConfig::default(),
                PlannerConfig::zero(),
                Box::new(gyro.clone()),
                Box::new(vision.clone()),
                ios,
            )
            .unwrap();
            Self {
                drive,
                modules,
                gyro: gyro.0,
                vision: vision.0,
            }
        }

        fn set_module_inputs(&self, f: impl Fn(usize, &mut ModuleIoInputs)) {
            for (i, hw) in self.modules.iter().enumerate() {
                f(i, &mut hw.lock().unwrap().inputs);
            }
        }

        fn drive_volts(&self) -> [f64; MODULE_COUNT] {
            [0, 1, 2, 3].map(|i| self.modules[i].lock().unwrap().drive_volts)
        }
    }

    fn enabled_rig() -> Rig {
        let mut rig = Rig::new([0.0; MODULE_COUNT]);
        rig.drive.tick(DT, true);
        rig
    }

    #[test]
    fn test_rejects_unusable_config() {
        let config = DriveConfig {
            max_linear_speed_mps: -1.0,
            ..DriveConfig::default()
        };
        let ios: [Box<dyn ModuleIo>; MODULE_COUNT] = [0.0; MODULE_COUNT].map(|angle| {
            Box::new(FakeModuleIo(Arc::new(Mutex::new(FakeHardware {
                inputs: connected_at(angle),
                ..Default::default()
            })))) as Box<dyn ModuleIo>
        });
        let result = Drive::new(
            config,
            PlannerConfig::zero(),
            Box::new(NoGyro),
            Box::new(NoVision),
            ios,
        );
        assert!(matches!(result, Err(DriveError::InvalidConfig(_))));
    }

    #[test]
    fn test_without_gyro_heading_comes_from_odometry() {
        let modules = [0.0; MODULE_COUNT].map(|angle| {
            Arc::new(Mutex::new(FakeHardware {
                inputs: connected_at(angle),
                ..Default::default()
            }))
        });
        let ios: [Box<dyn ModuleIo>; MODULE_COUNT] =
            modules.clone().map(|hw| Box::new(FakeModuleIo(hw)) as Box<dyn ModuleIo>);
        let mut drive = Drive::new(
            DriveConfig::default(),
            PlannerConfig::zero(),
            Box::new(NoGyro),
            Box::new(NoVision),
            ios,
        )
        .unwrap();

        // Nonzero boot encoders, wheels already on the circle
        let tangents = drive.circle_orientations();
        for (i, hw) in modules.iter().enumerate() {
            let mut hw = hw.lock().unwrap();
            hw.inputs.turn_absolute_position = tangents[i];
            hw.inputs.drive_position_rad = 40.0;
        }
        drive.tick(DT, true);
        assert!(!drive.gyro_connected());
        assert_eq!(drive.rotation(), 0.0);
        assert_eq!(drive.raw_heading(), 0.0);

        // Each wheel rolls 0.1 rad of chassis rotation along the circle
        let wheel_rads = 0.1 * drive.config().drive_base_radius() / drive.config().wheel_radius_m;
        for hw in &modules {
            hw.lock().unwrap().inputs.drive_position_rad = 40.0 + wheel_rads;
        }
        drive.tick(DT, true);
        assert_relative_eq!(drive.rotation(), 0.1, epsilon = 1e-9);
        assert_relative_eq!(drive.pose().x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(drive.pose().y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_max_speeds() {
        let rig = enabled_rig();
        assert_relative_eq!(rig.drive.max_linear_speed(), 4.4196, epsilon = 1e-9);
        assert_relative_eq!(
            rig.drive.max_angular_speed(),
            4.4196 / (13.0 * 0.0254 * 2f64.sqrt()),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_forward_request_no_desaturation() {
        let mut rig = enabled_rig();
        rig.drive.run_velocity(ChassisSpeeds::new(1.0, 0.0, 0.0));
        for state in rig.drive.setpoint().module_states {
            assert_relative_eq!(state.speed, 1.0, epsilon = 1e-9);
            assert_relative_eq!(state.angle, 0.0, epsilon = 1e-12);
        }
        for state in rig.drive.optimized_states().unwrap() {
            assert_relative_eq!(state.speed, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_max_spin_request_is_symmetric() {
        let mut rig = enabled_rig();
        let omega = rig.drive.max_angular_speed();
        rig.drive.run_velocity(ChassisSpeeds::new(0.0, 0.0, omega));

        let states = rig.drive.setpoint().module_states;
        let offsets = [FRAC_PI_4, -FRAC_PI_4, 3.0 * FRAC_PI_4, -3.0 * FRAC_PI_4];
        for (state, offset) in states.iter().zip(offsets) {
            assert_relative_eq!(state.speed, states[0].speed, epsilon = 1e-9);
            assert!(state.speed <= rig.drive.max_linear_speed() + 1e-9);
            assert_relative_eq!(wrap_angle(state.angle - offset - FRAC_PI_2), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_oversized_request_is_desaturated() {
        let mut rig = enabled_rig();
        rig.drive.run_velocity(ChassisSpeeds::new(6.0, 3.0, 4.0));
        let max = rig.drive.max_linear_speed();
        let fastest = rig
            .drive
            .setpoint()
            .module_states
            .iter()
            .map(|s| s.speed.abs())
            .fold(0.0, f64::max);
        assert_relative_eq!(fastest, max, epsilon = 1e-9);
    }

    #[test]
    fn test_stop_with_x_then_drive_leaves_x() {
        let x_angles = [FRAC_PI_4, -FRAC_PI_4, 3.0 * FRAC_PI_4, -3.0 * FRAC_PI_4];
        let mut rig = Rig::new([0.0; MODULE_COUNT]);
        rig.drive.tick(DT, true);

        rig.drive.stop_with_x();
        for (state, angle) in rig.drive.setpoint().module_states.iter().zip(x_angles) {
            assert_eq!(state.speed, 0.0);
            assert_relative_eq!(state.angle, angle, epsilon = 1e-12);
        }

        // Wheels reach the X
        rig.set_module_inputs(|i, inputs| inputs.turn_position = x_angles[i]);
        rig.drive.tick(DT, true);

        rig.drive.run_velocity(ChassisSpeeds::new(1.0, 0.0, 0.0));
        for (i, state) in rig.drive.optimized_states().unwrap().iter().enumerate() {
            // Forward or reversed wheel, never still in the X
            assert_relative_eq!(state.angle.sin(), 0.0, epsilon = 1e-9);
            assert_relative_eq!(state.speed * state.angle.cos(), 1.0, epsilon = 1e-9);
            assert!(angle_delta_abs(x_angles[i], state.angle) <= FRAC_PI_2 + 1e-9);
        }
    }

    fn angle_delta_abs(from: f64, to: f64) -> f64 {
        geometry::angle_delta(from, to).abs()
    }

    #[test]
    fn test_disabled_stops_modules_and_ignores_commands() {
        let mut rig = enabled_rig();
        rig.drive.run_velocity(ChassisSpeeds::new(1.0, 0.0, 0.0));
        rig.drive.tick(DT, true);
        assert!(rig.drive_volts().iter().all(|v| *v > 0.0));

        rig.drive.tick(DT, false);
        assert!(rig.drive_volts().iter().all(|v| *v == 0.0));
        assert!(rig.drive.modules().iter().all(|m| m.mode() == ModuleMode::Idle));
        assert!(rig.drive.optimized_states().is_none());

        rig.drive.run_velocity(ChassisSpeeds::new(1.0, 0.0, 0.0));
        rig.drive.tick(DT, false);
        assert!(rig.drive_volts().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_non_finite_request_becomes_stop() {
        let mut rig = enabled_rig();
        rig.drive.run_velocity(ChassisSpeeds::new(f64::NAN, 0.0, 1.0));
        assert_eq!(rig.drive.setpoint().speeds, ChassisSpeeds::default());
        for state in rig.drive.setpoint().module_states {
            assert_eq!(state.speed, 0.0);
            assert!(state.angle.is_finite());
        }
        rig.drive.tick(DT, true);
        assert!(rig.drive_volts().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_first_cycle_does_not_jump_pose() {
        let mut rig = Rig::new([0.0; MODULE_COUNT]);
        rig.set_module_inputs(|_, inputs| inputs.drive_position_rad = 250.0);
        rig.drive.tick(DT, true);
        assert_eq!(rig.drive.pose().x, 0.0);
        assert_eq!(rig.drive.pose().y, 0.0);
    }

    #[test]
    fn test_odometry_follows_wheels() {
        let mut rig = enabled_rig();
        let radius = rig.drive.config().wheel_radius_m;
        // 1 m forward
        rig.set_module_inputs(|_, inputs| inputs.drive_position_rad = 1.0 / radius);
        rig.drive.tick(DT, true);
        assert_relative_eq!(rig.drive.pose().x, 1.0, epsilon = 1e-9);
    }

    /// Spin in place at `omega`, feeding consistent gyro + module telemetry
    fn spin_cycle(rig: &mut Rig, cycle: usize, omega: f64, gyro_connected: bool, gyro_bias: f64) {
        let t = cycle as f64 * DT;
        let base_radius = rig.drive.config().drive_base_radius();
        let wheel_radius = rig.drive.config().wheel_radius_m;
        let tangents = rig.drive.circle_orientations();
        {
            let mut gyro = rig.gyro.lock().unwrap();
            gyro.connected = gyro_connected;
            gyro.yaw = wrap_angle(omega * t + gyro_bias);
            gyro.yaw_velocity_rad_per_sec = omega;
        }
        rig.set_module_inputs(|i, inputs| {
            inputs.turn_position = tangents[i];
            inputs.drive_position_rad = omega * t * base_radius / wheel_radius;
        });
        rig.drive.tick(DT, true);
    }

    #[test]
    fn test_gyro_failover_is_continuous() {
        let mut rig = enabled_rig();
        let omega = 1.0;
        // Seed the steer encoders at the tangent angles
        for cycle in 1..=5 {
            spin_cycle(&mut rig, cycle, omega, true, 0.0);
        }
        let mut last = rig.drive.pose().heading;
        for cycle in 6..=15 {
            spin_cycle(&mut rig, cycle, omega, cycle < 10, 0.0);
            let heading = rig.drive.pose().heading;
            assert_relative_eq!(geometry::angle_delta(last, heading), omega * DT, epsilon = 1e-6);
            last = heading;
        }
        assert!(!rig.drive.gyro_connected());

        // Gyro comes back with a bias; still no jump
        spin_cycle(&mut rig, 16, omega, true, 0.4);
        let heading = rig.drive.pose().heading;
        assert!(geometry::angle_delta(last, heading).abs() < 2.0 * omega * DT);
    }

    #[test]
    fn test_vision_needs_detections_and_slow_spin() {
        let mut rig = enabled_rig();
        rig.drive.tick(DT, true);
        let now = rig.drive.now();
        {
            let mut vision = rig.vision.lock().unwrap();
            vision.pose = Pose2d::new(1.0, 1.0, 0.0);
            vision.capture_timestamp = now;
            vision.detection_count = 0;
        }
        rig.drive.tick(DT, true);
        assert!(!rig.drive.vision_accepted());
        assert_eq!(rig.drive.pose().x, 0.0);

        rig.vision.lock().unwrap().detection_count = 2;
        rig.gyro.lock().unwrap().yaw_velocity_rad_per_sec = 800f64.to_radians();
        rig.drive.tick(DT, true);
        assert!(!rig.drive.vision_accepted());
        assert_eq!(rig.drive.pose().x, 0.0);

        rig.gyro.lock().unwrap().yaw_velocity_rad_per_sec = 0.0;
        rig.drive.tick(DT, true);
        assert!(rig.drive.vision_accepted());
        assert!(rig.drive.pose().x > 0.0);
        // Heading barely trusted
        assert!(rig.drive.pose().heading.abs() < 1e-6);

        // Same frame again: no further change
        let once = rig.drive.pose();
        rig.drive.tick(DT, true);
        assert!(!rig.drive.vision_accepted());
        assert_eq!(rig.drive.pose(), once);
    }

    #[test]
    fn test_orient_modules_completes_within_tolerance() {
        let mut rig = enabled_rig();
        rig.drive.orient_all(0.5);
        rig.drive.tick(DT, true);
        assert!(rig.drive.is_orienting());
        assert!(rig.drive.modules().iter().all(|m| m.mode() == ModuleMode::Orienting));

        rig.set_module_inputs(|_, inputs| inputs.turn_position = 0.5 + 1f64.to_radians());
        rig.drive.tick(DT, true);
        assert!(!rig.drive.is_orienting());
        for state in rig.drive.setpoint().module_states {
            assert_eq!(state.speed, 0.0);
        }
    }

    #[test]
    fn test_velocity_request_cancels_orientation() {
        let mut rig = enabled_rig();
        rig.drive.orient_modules(rig.drive.circle_orientations());
        rig.drive.run_velocity(ChassisSpeeds::new(0.5, 0.0, 0.0));
        assert!(!rig.drive.is_orienting());
    }

    #[test]
    fn test_characterization_volts_reach_drive_motors() {
        let mut rig = enabled_rig();
        rig.drive.run_characterization_volts(3.0);
        rig.set_module_inputs(|i, inputs| inputs.drive_velocity_rad_per_sec = i as f64);
        rig.drive.tick(DT, true);
        assert_eq!(rig.drive_volts(), [3.0; MODULE_COUNT]);
        assert_relative_eq!(rig.drive.characterization_velocity(), 1.5);
    }

    #[test]
    fn test_wheel_radius_characterization_spins() {
        let mut rig = enabled_rig();
        rig.drive.run_wheel_radius_characterization(1.0);
        assert_relative_eq!(rig.drive.setpoint().speeds.omega, 1.0);
        rig.set_module_inputs(|i, inputs| inputs.drive_position_rad = i as f64 * 2.0);
        rig.drive.tick(DT, true);
        assert_eq!(rig.drive.wheel_radius_characterization_positions(), [0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_set_pose_and_reset_gyro() {
        let mut rig = enabled_rig();
        rig.drive.set_pose(Pose2d::new(3.0, 4.0, PI / 3.0));
        assert_eq!(rig.drive.pose(), Pose2d::new(3.0, 4.0, PI / 3.0));

        rig.gyro.lock().unwrap().yaw = 1.0;
        rig.drive.tick(DT, true);
        assert_relative_eq!(rig.drive.rotation(), wrap_angle(PI / 3.0 + 1.0), epsilon = 1e-9);

        rig.drive.reset_gyro();
        assert_eq!(rig.gyro.lock().unwrap().yaw, 0.0);
        rig.drive.tick(DT, true);
        assert_relative_eq!(rig.drive.rotation(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(rig.drive.pose().x, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_connectivity_flags() {
        let mut rig = enabled_rig();
        rig.modules[2].lock().unwrap().inputs.turn_connected = false;
        rig.modules[0].lock().unwrap().inputs.drive_connected = false;
        rig.gyro.lock().unwrap().connected = false;
        rig.drive.tick(DT, true);
        assert_eq!(rig.drive.drive_disconnected(), [true, false, false, false]);
        assert_eq!(rig.drive.turn_disconnected(), [false, false, true, false]);
        assert!(!rig.drive.gyro_connected());
    }

    #[test]
    fn test_speaker_queries_use_injected_alliance() {
        let mut rig = enabled_rig();
        rig.drive.set_pose(Pose2d::new(16.54, 2.54, 0.0));
        let red = FixedAlliance(Some(Alliance::Red));
        assert_relative_eq!(rig.drive.distance_from_speaker(&red), 3.0, epsilon = 1e-9);
        assert_relative_eq!(rig.drive.rotation_to_speaker(&red), FRAC_PI_2, epsilon = 1e-9);

        let blue = FixedAlliance(Some(Alliance::Blue));
        assert_relative_eq!(rig.drive.speaker_pose(&blue).x, 0.0);
        assert!(rig.drive.distance_from_speaker(&blue) > 16.0);
    }

    #[test]
    fn test_closest_tag_from_latest_frame() {
        let mut rig = enabled_rig();
        rig.vision.lock().unwrap().fiducials = vec![
            FiducialTarget { id: 30, tx: -20.0 },
            FiducialTarget { id: 5, tx: 8.0 },
        ];
        rig.drive.tick(DT, true);
        assert_eq!(rig.drive.closest_tag().map(|t| t.id), Some(5));
    }
}
