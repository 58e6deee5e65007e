// Swerve keyboard teleop over zenoh
//
//   WASD      translate            Z / X   rotate CCW / CW
//   R / F     speed tier up/down   T       toggle field / robot relative
//   SPACE     stop in an X         O       wheels onto the drive circle
//   0         wheels straight      G       re-zero the gyro
//   Q / ESC   quit
//
// Field-relative mode reads the estimated heading from the drive telemetry.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use swerve_zenoh_runtime::config::{TOPIC_CMD_DRIVE, TOPIC_STATE_DRIVE};
use swerve_zenoh_runtime::drive::geometry::Translation2d;
use swerve_zenoh_runtime::messages::{DriveRequest, DriveTelemetry};

const SPEED_TIERS: [(&str, f64, f64); 3] = [
    // label, m/s, deg/s
    ("LOW", 0.5, 45.0),
    ("MED", 1.5, 120.0),
    ("HIGH", 3.0, 270.0),
];
const HOLD_TIMEOUT: Duration = Duration::from_millis(100); // drop a motion key after this long
const POLL: Duration = Duration::from_millis(20); // ~50Hz publish, keeps the watchdog fed

/// Keyboard state: which motion keys are held and how to frame them
struct Teleop {
    tier: usize,
    field_relative: bool,
    // Unit stick in the driver's frame: +x forward, +y left
    stick: Translation2d,
    turn: f64,
    last_motion: Instant,
}

enum KeyAction {
    Continue,
    Send(DriveRequest),
    Quit,
}

impl Teleop {
    fn new() -> Self {
        Self {
            tier: 0,
            field_relative: false,
            stick: Translation2d::default(),
            turn: 0.0,
            last_motion: Instant::now(),
        }
    }

    fn on_key(&mut self, code: KeyCode, now: Instant) -> KeyAction {
        let motion = |teleop: &mut Teleop, stick: Option<Translation2d>, turn: Option<f64>| {
            if let Some(stick) = stick {
                teleop.stick = stick;
            }
            if let Some(turn) = turn {
                teleop.turn = turn;
            }
            teleop.last_motion = now;
            KeyAction::Continue
        };
        match code {
            KeyCode::Char('w') => motion(self, Some(Translation2d::new(1.0, 0.0)), None),
            KeyCode::Char('s') => motion(self, Some(Translation2d::new(-1.0, 0.0)), None),
            KeyCode::Char('a') => motion(self, Some(Translation2d::new(0.0, 1.0)), None),
            KeyCode::Char('d') => motion(self, Some(Translation2d::new(0.0, -1.0)), None),
            KeyCode::Char('z') => motion(self, None, Some(1.0)),
            KeyCode::Char('x') => motion(self, None, Some(-1.0)),

            KeyCode::Char('r') => {
                self.tier = (self.tier + 1).min(SPEED_TIERS.len() - 1);
                info!("Speed: {}", SPEED_TIERS[self.tier].0);
                KeyAction::Continue
            }
            KeyCode::Char('f') => {
                self.tier = self.tier.saturating_sub(1);
                info!("Speed: {}", SPEED_TIERS[self.tier].0);
                KeyAction::Continue
            }
            KeyCode::Char('t') => {
                self.field_relative = !self.field_relative;
                info!(
                    "Driving {}",
                    if self.field_relative { "field relative" } else { "robot relative" }
                );
                KeyAction::Continue
            }

            KeyCode::Char(' ') => KeyAction::Send(DriveRequest::StopX),
            KeyCode::Char('o') => KeyAction::Send(DriveRequest::OrientCircle),
            KeyCode::Char('0') => KeyAction::Send(DriveRequest::Orient { angles: [0.0; 4] }),
            KeyCode::Char('g') => KeyAction::Send(DriveRequest::ResetGyro),

            KeyCode::Char('q') | KeyCode::Esc => KeyAction::Quit,
            _ => KeyAction::Continue,
        }
    }

    /// Velocity request for this cycle; `heading` is the robot's field heading
    fn velocity(&mut self, now: Instant, heading: f64) -> DriveRequest {
        if now.saturating_duration_since(self.last_motion) > HOLD_TIMEOUT {
            self.stick = Translation2d::default();
            self.turn = 0.0;
        }
        let (_, speed, turn_deg) = SPEED_TIERS[self.tier];
        let mut linear = Translation2d::new(self.stick.x * speed, self.stick.y * speed);
        if self.field_relative {
            linear = linear.rotate_by(-heading);
        }
        DriveRequest::Velocity {
            vx: linear.x,
            vy: linear.y,
            omega: (self.turn * turn_deg).to_radians(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_DRIVE).await?;
    let telemetry = session.declare_subscriber(TOPIC_STATE_DRIVE).await?;

    info!("WASD move, Z/X rotate, R/F speed, T field/robot, SPACE x-stop, O circle, 0 straight, G gyro, Q quit");

    enable_raw_mode()?;
    let result = run_teleop(&publisher, &telemetry).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
    telemetry: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut teleop = Teleop::new();
    let mut heading = 0.0;

    loop {
        while let Ok(Some(sample)) = telemetry.try_recv() {
            match serde_json::from_slice::<DriveTelemetry>(&sample.payload().to_bytes()) {
                Ok(state) => heading = state.pose.heading,
                Err(e) => warn!("Failed to parse drive telemetry: {}", e),
            }
        }

        let mut request = None;
        if event::poll(POLL)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if matches!(kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                    match teleop.on_key(code, Instant::now()) {
                        KeyAction::Quit => break,
                        KeyAction::Send(one_shot) => request = Some(one_shot),
                        KeyAction::Continue => {}
                    }
                }
            }
        }

        let request = request.unwrap_or_else(|| teleop.velocity(Instant::now(), heading));
        publisher.put(serde_json::to_string(&request)?).await?;
    }

    Ok(())
}
