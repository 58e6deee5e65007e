// 50 Hz loop with watchdog
// The watchdog treats a stale command stream as "disabled": if teleop or the
// planner stops talking, every module is stopped until commands resume.

use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{
    CMD_TIMEOUT, DriveConfig, PlannerConfig, TOPIC_CMD_DRIVE, TOPIC_CMD_POSE, TOPIC_HEALTH,
    TOPIC_STATE_DRIVE, TOPIC_VISION, TOPIC_VISION_ORIENTATION,
};
use crate::drive::Drive;
use crate::drive::characterization::{FeedforwardCharacterization, WheelRadiusCharacterization};
use crate::drive::geometry::{ChassisSpeeds, Pose2d};
use crate::drive::io::{VisionIo, VisionIoInputs};
use crate::drive::landmark::{Alliance, FixedAlliance};
use crate::error::Result;
use crate::messages::{DriveRequest, DriveTelemetry, PoseReset, RuntimeHealth, VisionMessage};
use crate::sim::sim_drivetrain;

/// Startup options assembled by the binary
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub drive: DriveConfig,
    pub planner: PlannerConfig,
    pub alliance: Option<Alliance>,
}

/// Vision source fed by the runtime from the zenoh vision topic
pub struct ChannelVisionIo {
    frames: watch::Receiver<VisionIoInputs>,
    orientation: watch::Sender<f64>,
}

impl VisionIo for ChannelVisionIo {
    fn update_inputs(&mut self, inputs: &mut VisionIoInputs) {
        // No new frame: hold the previous one, the estimator ignores repeats
        if self.frames.has_changed().unwrap_or(false) {
            *inputs = self.frames.borrow_and_update().clone();
        }
    }

    fn set_robot_orientation(&mut self, heading_deg: f64) {
        self.orientation.send_replace(heading_deg);
    }
}

/// Offline identification routine in progress
enum Routine {
    Feedforward(FeedforwardCharacterization),
    /// Waiting for the wheels to line up on the drive circle
    WheelRadiusAlign,
    WheelRadius(WheelRadiusCharacterization),
}

pub struct Runtime {
    drive: Drive,
    alliance: FixedAlliance,
    active_request: Option<DriveRequest>,
    pending_request: Option<DriveRequest>,
    cmd_received_at: Option<Instant>,
    health: RuntimeHealth,
    routine: Option<Routine>,
    vision_frames: watch::Sender<VisionIoInputs>,
    vision_orientation: watch::Receiver<f64>,
}

impl Runtime {
    /// Build the drive on simulated hardware
    pub fn new(options: RuntimeOptions) -> Result<Self> {
        let (modules, gyro) = sim_drivetrain(&options.drive, [0.0; 4])?;
        let (vision_frames, frames) = watch::channel(VisionIoInputs::default());
        let (orientation, vision_orientation) = watch::channel(0.0);
        let vision = ChannelVisionIo { frames, orientation };

        let drive = Drive::new(
            options.drive,
            options.planner,
            Box::new(gyro),
            Box::new(vision),
            modules,
        )?;

        Ok(Self {
            drive,
            alliance: FixedAlliance(options.alliance),
            active_request: None,
            pending_request: None,
            cmd_received_at: None,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
            routine: None,
            vision_frames,
            vision_orientation,
        })
    }

    pub fn drive(&self) -> &Drive {
        &self.drive
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming drive request
    fn on_request(&mut self, request: DriveRequest, now: Instant) {
        self.cmd_received_at = Some(now);
        if request.is_continuous() {
            if self.active_request.as_ref() != Some(&request) {
                info!("Drive request: {:?}", request);
            }
            self.active_request = Some(request);
        } else {
            info!("Drive request: {:?}", request);
            self.active_request = None;
            self.pending_request = Some(request);
        }
    }

    fn on_pose_reset(&mut self, reset: PoseReset) {
        self.drive.set_pose(Pose2d::from(reset));
    }

    /// Hand a vision sample to the drive, stamped on the drive clock
    fn on_vision(&mut self, msg: VisionMessage) {
        let inputs = VisionIoInputs {
            pose: msg.pose,
            capture_timestamp: self.drive.now() - msg.latency_s.max(0.0),
            detection_count: msg.tag_count,
            fiducials: msg.fiducials,
        };
        self.vision_frames.send_replace(inputs);
    }

    /// Watchdog: true while commands are fresh
    fn commands_fresh(&mut self, now: Instant) -> bool {
        match self.cmd_received_at {
            Some(at) if now.saturating_duration_since(at) <= CMD_TIMEOUT => true,
            Some(at) => {
                if self.health != RuntimeHealth::CmdStale {
                    warn!(
                        "Command stale ({:?} old), disabling drive",
                        now.saturating_duration_since(at)
                    );
                }
                false
            }
            None => false,
        }
    }

    /// One control cycle
    fn step(&mut self, dt: f64, now: Instant) {
        let enabled = self.commands_fresh(now);
        self.drive.tick(dt, enabled);

        if !enabled {
            self.finish_routine();
            self.active_request = None;
            self.pending_request = None;
        } else {
            if let Some(request) = self.pending_request.take() {
                self.apply_once(request);
            }
            self.apply_active(dt);
        }

        self.health = if !enabled {
            RuntimeHealth::CmdStale
        } else if self.degraded() {
            RuntimeHealth::Degraded
        } else {
            RuntimeHealth::Ok
        };
    }

    fn degraded(&self) -> bool {
        !self.drive.gyro_connected()
            || self.drive.drive_disconnected().iter().any(|d| *d)
            || self.drive.turn_disconnected().iter().any(|d| *d)
    }

    fn apply_once(&mut self, request: DriveRequest) {
        self.finish_routine();
        match request {
            DriveRequest::Stop => self.drive.stop(),
            DriveRequest::StopX => self.drive.stop_with_x(),
            DriveRequest::Orient { angles } => self.drive.orient_modules(angles),
            DriveRequest::OrientCircle => {
                let angles = self.drive.circle_orientations();
                self.drive.orient_modules(angles);
            }
            DriveRequest::ResetGyro => self.drive.reset_gyro(),
            DriveRequest::Velocity { .. }
            | DriveRequest::CharacterizeFf
            | DriveRequest::CharacterizeWheelRadius => {}
        }
    }

    fn apply_active(&mut self, dt: f64) {
        match self.active_request {
            Some(DriveRequest::Velocity { vx, vy, omega }) => {
                self.finish_routine();
                self.drive.run_velocity(ChassisSpeeds::new(vx, vy, omega));
            }
            Some(DriveRequest::CharacterizeFf) => self.step_feedforward(dt),
            Some(DriveRequest::CharacterizeWheelRadius) => self.step_wheel_radius(dt),
            _ => {}
        }
    }

    fn step_feedforward(&mut self, dt: f64) {
        if !matches!(self.routine, Some(Routine::Feedforward(_))) {
            self.finish_routine();
            info!("Starting feedforward characterization");
            self.routine = Some(Routine::Feedforward(FeedforwardCharacterization::default()));
        }
        let velocity = self.drive.characterization_velocity();
        if let Some(Routine::Feedforward(routine)) = self.routine.as_mut() {
            let volts = routine.step(dt, velocity);
            self.drive.run_characterization_volts(volts);
        }
    }

    fn step_wheel_radius(&mut self, dt: f64) {
        match self.routine.as_mut() {
            Some(Routine::WheelRadiusAlign) => {
                if !self.drive.is_orienting() {
                    info!("Wheels aligned, spinning for wheel radius");
                    self.routine = Some(Routine::WheelRadius(WheelRadiusCharacterization::new(
                        self.drive.config().drive_base_radius(),
                        self.drive.raw_heading(),
                        self.drive.wheel_radius_characterization_positions(),
                    )));
                }
            }
            Some(Routine::WheelRadius(routine)) => {
                let omega = routine.step(
                    dt,
                    self.drive.raw_heading(),
                    self.drive.wheel_radius_characterization_positions(),
                );
                self.drive.run_wheel_radius_characterization(omega);
            }
            _ => {
                self.finish_routine();
                info!("Starting wheel radius characterization");
                let angles = self.drive.circle_orientations();
                self.drive.orient_modules(angles);
                self.routine = Some(Routine::WheelRadiusAlign);
            }
        }
    }

    /// Stop any identification routine and report what it measured
    fn finish_routine(&mut self) {
        match self.routine.take() {
            Some(Routine::Feedforward(routine)) => match routine.fit() {
                Some(fit) => info!(
                    "Feedforward characterization: kS={:.5} kV={:.5} (r²={:.4}, {} samples)",
                    fit.ks,
                    fit.kv,
                    fit.r_squared,
                    routine.sample_count()
                ),
                None => warn!("Feedforward characterization ended without enough motion to fit"),
            },
            Some(Routine::WheelRadius(routine)) => match routine.effective_wheel_radius() {
                Some(radius) => info!(
                    "Wheel radius characterization: {:.4} m ({:.3} in) over {:.2} rad",
                    radius,
                    radius / 0.0254,
                    routine.accumulated_yaw()
                ),
                None => warn!("Wheel radius characterization ended before the wheels turned"),
            },
            Some(Routine::WheelRadiusAlign) | None => {}
        }
    }
}

pub async fn run(options: RuntimeOptions) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let dt = options.drive.loop_period_s;
    if !(dt.is_finite() && dt > 0.0) {
        return Err(format!("Loop period must be positive, got {}s", dt).into());
    }
    let mut runtime = Runtime::new(options)?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_drive = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let sub_pose = session.declare_subscriber(TOPIC_CMD_POSE).await?;
    let sub_vision = session.declare_subscriber(TOPIC_VISION).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE_DRIVE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    let pub_orientation = session.declare_publisher(TOPIC_VISION_ORIENTATION).await?;

    let mut tick = interval(Duration::from_secs_f64(dt));

    info!(
        "Runtime started: {:.0}Hz loop, {}ms watchdog timeout",
        1.0 / dt,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}, {}, {}", TOPIC_CMD_DRIVE, TOPIC_CMD_POSE, TOPIC_VISION);
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_STATE_DRIVE, TOPIC_HEALTH, TOPIC_VISION_ORIENTATION
    );

    let mut publish_failing = false;

    loop {
        tick.tick().await;
        let now = Instant::now();

        // 1. Drain all pending messages (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_drive.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<DriveRequest>(&payload) {
                Ok(request) => runtime.on_request(request, now),
                Err(e) => warn!("Failed to parse drive request: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_pose.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<PoseReset>(&payload) {
                Ok(reset) => runtime.on_pose_reset(reset),
                Err(e) => warn!("Failed to parse pose reset: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_vision.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<VisionMessage>(&payload) {
                Ok(msg) => runtime.on_vision(msg),
                Err(e) => warn!("Failed to parse vision sample: {}", e),
            }
        }

        // 2. Run the drive (includes watchdog logic)
        runtime.step(dt, now);

        // 3. Publish telemetry; failures are logged, never fatal
        let telemetry = DriveTelemetry::capture(&runtime.drive, &runtime.alliance);
        let orientation = *runtime.vision_orientation.borrow();
        let results = [
            pub_state.put(serde_json::to_string(&telemetry)?).await,
            pub_health.put(serde_json::to_string(&runtime.health)?).await,
            pub_orientation.put(orientation.to_string()).await,
        ];
        match results.into_iter().find_map(|r| r.err()) {
            Some(e) if !publish_failing => {
                warn!("Telemetry publish failed: {}", e);
                publish_failing = true;
            }
            Some(_) => {}
            None => publish_failing = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::module::ModuleMode;
    use approx::assert_relative_eq;

    const DT: f64 = 0.02;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeOptions {
            drive: DriveConfig::default(),
            planner: PlannerConfig::zero(),
            alliance: Some(Alliance::Blue),
        })
        .unwrap()
    }

    fn velocity(vx: f64) -> DriveRequest {
        DriveRequest::Velocity {
            vx,
            vy: 0.0,
            omega: 0.0,
        }
    }

    #[test]
    fn test_starts_stale_and_disabled() {
        let mut runtime = runtime();
        runtime.step(DT, Instant::now());
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert!(!runtime.drive().is_enabled());
    }

    #[test]
    fn test_fresh_command_drives() {
        let mut runtime = runtime();
        let start = Instant::now();
        for i in 0..50 {
            let now = start + Duration::from_millis(20 * i);
            runtime.on_request(velocity(1.0), now);
            runtime.step(DT, now);
        }
        assert_eq!(runtime.health(), RuntimeHealth::Ok);
        assert!(runtime.drive().pose().x > 0.3);
    }

    #[test]
    fn test_watchdog_disables_drive() {
        let mut runtime = runtime();
        let start = Instant::now();
        runtime.on_request(velocity(1.0), start);
        runtime.step(DT, start);
        assert!(runtime.drive().optimized_states().is_some());

        runtime.step(DT, start + Duration::from_millis(300));
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert!(runtime.drive().optimized_states().is_none());
        assert!(runtime
            .drive()
            .modules()
            .iter()
            .all(|m| m.mode() == ModuleMode::Idle));
    }

    #[test]
    fn test_one_shot_request_applies_once() {
        let mut runtime = runtime();
        let now = Instant::now();
        runtime.on_request(DriveRequest::StopX, now);
        runtime.step(DT, now);
        assert!(runtime.pending_request.is_none());
        let first = runtime.drive().setpoint().module_states[0];
        assert_relative_eq!(first.angle, std::f64::consts::FRAC_PI_4, epsilon = 1e-12);
        assert_eq!(first.speed, 0.0);
    }

    #[test]
    fn test_pose_reset_teleports() {
        let mut runtime = runtime();
        runtime.on_pose_reset(PoseReset {
            x: 2.0,
            y: 1.0,
            heading: 0.5,
        });
        assert_eq!(runtime.drive().pose(), Pose2d::new(2.0, 1.0, 0.5));
    }

    #[test]
    fn test_vision_stamped_with_latency() {
        let mut runtime = runtime();
        let start = Instant::now();
        for i in 0..10 {
            let now = start + Duration::from_millis(20 * i);
            runtime.on_request(DriveRequest::Stop, now);
            runtime.step(DT, now);
        }
        runtime.on_vision(VisionMessage {
            pose: Pose2d::new(1.0, 0.0, 0.0),
            latency_s: 0.04,
            tag_count: 2,
            fiducials: Vec::new(),
        });
        let stamped = runtime.vision_frames.borrow().capture_timestamp;
        assert_relative_eq!(stamped, runtime.drive().now() - 0.04, epsilon = 1e-12);

        let now = start + Duration::from_millis(200);
        runtime.on_request(DriveRequest::Stop, now);
        runtime.step(DT, now);
        assert!(runtime.drive().vision_accepted());
        assert!(runtime.drive().pose().x > 0.0);
    }

    #[test]
    fn test_feedforward_routine_ramps_and_stops_with_watchdog() {
        let mut runtime = runtime();
        let start = Instant::now();
        // Past the start delay
        for i in 0..150 {
            let now = start + Duration::from_millis(20 * i);
            runtime.on_request(DriveRequest::CharacterizeFf, now);
            runtime.step(DT, now);
        }
        assert!(matches!(runtime.routine, Some(Routine::Feedforward(_))));
        assert!(runtime
            .drive()
            .modules()
            .iter()
            .all(|m| m.mode() == ModuleMode::Characterizing));
        assert!(runtime.drive().characterization_velocity() > 0.0);

        runtime.step(DT, start + Duration::from_secs(10));
        assert!(runtime.routine.is_none());
    }

    #[test]
    fn test_wheel_radius_routine_aligns_then_spins() {
        let mut runtime = runtime();
        let start = Instant::now();
        let now = start;
        runtime.on_request(DriveRequest::CharacterizeWheelRadius, now);
        runtime.step(DT, now);
        assert!(matches!(runtime.routine, Some(Routine::WheelRadiusAlign)));
        assert!(runtime.drive().is_orienting());

        for i in 1..200 {
            let now = start + Duration::from_millis(20 * i);
            runtime.on_request(DriveRequest::CharacterizeWheelRadius, now);
            runtime.step(DT, now);
        }
        assert!(matches!(runtime.routine, Some(Routine::WheelRadius(_))));
        assert!(runtime.drive().setpoint().speeds.omega > 0.0);
    }
}
