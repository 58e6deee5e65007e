// One swerve module: closed-loop drive velocity + steer angle over a ModuleIo
//
// The module converts raw encoder units to meters/radians, picks the cheaper
// steer direction for each target, and turns setpoints into actuator voltages
// once per control cycle.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::geometry::{angle_delta, wrap_angle};
use super::io::{ModuleIo, ModuleIoInputs};
use super::kinematics::{ModulePosition, ModuleState};
use crate::config::DriveConfig;

/// Battery-limited output range of both actuators
pub const MAX_VOLTS: f64 = 12.0;

/// Module labels in FL, FR, BL, BR order
pub const MODULE_NAMES: [&str; 4] = ["FrontLeft", "FrontRight", "BackLeft", "BackRight"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleMode {
    Idle,
    Driving,
    Orienting,
    Characterizing,
}

/// Feedforward / feedback constants shared by all modules
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleGains {
    pub wheel_radius_m: f64,
    pub drive_ks: f64,
    pub drive_kv: f64,
    pub drive_kp: f64,
    pub turn_kp: f64,
}

impl From<&DriveConfig> for ModuleGains {
    fn from(config: &DriveConfig) -> Self {
        Self {
            wheel_radius_m: config.wheel_radius_m,
            drive_ks: config.drive_ks,
            drive_kv: config.drive_kv,
            drive_kp: config.drive_kp,
            turn_kp: config.turn_kp,
        }
    }
}

pub struct Module {
    io: Box<dyn ModuleIo>,
    index: usize,
    gains: ModuleGains,
    inputs: ModuleIoInputs,
    mode: ModuleMode,
    angle_setpoint: Option<f64>,
    speed_setpoint: Option<f64>,
    characterization_volts: f64,
    // Absolute minus relative steer reading, captured once
    turn_relative_offset: Option<f64>,
    drive_was_connected: bool,
    turn_was_connected: bool,
}

impl Module {
    pub fn new(mut io: Box<dyn ModuleIo>, index: usize, gains: ModuleGains) -> Self {
        io.set_drive_brake_mode(true);
        io.set_turn_brake_mode(true);
        Self {
            io,
            index,
            gains,
            inputs: ModuleIoInputs::default(),
            mode: ModuleMode::Idle,
            angle_setpoint: None,
            speed_setpoint: None,
            characterization_volts: 0.0,
            turn_relative_offset: None,
            drive_was_connected: true,
            turn_was_connected: true,
        }
    }

    /// Refresh the telemetry snapshot for this cycle
    pub fn update_inputs(&mut self) {
        self.io.update_inputs(&mut self.inputs);
        self.report_connectivity();

        // Seed the relative steer encoder from the absolute one
        if self.turn_relative_offset.is_none() && self.inputs.turn_connected {
            let offset = self.inputs.turn_absolute_position - self.inputs.turn_position;
            debug!("Module {} steer offset seeded at {:.3} rad", self.index, offset);
            self.turn_relative_offset = Some(offset);
        }
    }

    /// Turn the current setpoints into actuator voltages
    pub fn apply_outputs(&mut self) {
        let turn_error = match self.angle_setpoint {
            Some(target) => {
                let error = angle_delta(self.angle(), target);
                self.io
                    .set_turn_voltage(clamp_volts(self.gains.turn_kp * error));
                error
            }
            None => {
                self.io.set_turn_voltage(0.0);
                0.0
            }
        };

        let drive_volts = match self.mode {
            ModuleMode::Characterizing => self.characterization_volts,
            ModuleMode::Driving | ModuleMode::Orienting => match self.speed_setpoint {
                // Scale down while the wheel still points the wrong way
                Some(speed) => self.drive_volts_for(speed * turn_error.cos()),
                None => 0.0,
            },
            ModuleMode::Idle => 0.0,
        };
        self.io.set_drive_voltage(clamp_volts(drive_volts));
    }

    fn drive_volts_for(&self, speed_mps: f64) -> f64 {
        let velocity = speed_mps / self.gains.wheel_radius_m;
        let static_ff = if velocity.abs() < 1e-6 {
            0.0
        } else {
            self.gains.drive_ks * velocity.signum()
        };
        let feedback = self.gains.drive_kp * (velocity - self.inputs.drive_velocity_rad_per_sec);
        static_ff + self.gains.drive_kv * velocity + feedback
    }

    fn report_connectivity(&mut self) {
        let drive = self.inputs.drive_connected;
        let turn = self.inputs.turn_connected;
        let name = MODULE_NAMES[self.index];

        if drive != self.drive_was_connected {
            if drive {
                info!("Drive motor on {} reconnected", name);
            } else {
                warn!("Drive motor on {} is disconnected", name);
            }
            self.drive_was_connected = drive;
        }
        if turn != self.turn_was_connected {
            if turn {
                info!("Turn motor on {} reconnected", name);
            } else {
                warn!("Turn motor on {} is disconnected", name);
            }
            self.turn_was_connected = turn;
        }
    }

    /// Drive toward `target`, returning the optimized state actually applied
    pub fn run_setpoint(&mut self, target: ModuleState) -> ModuleState {
        let optimized = target.optimize(self.angle());
        self.angle_setpoint = Some(optimized.angle);
        self.speed_setpoint = Some(optimized.speed);
        self.mode = ModuleMode::Driving;
        optimized
    }

    /// Steer to `angle` with the wheel stopped
    pub fn run_orientation(&mut self, angle: f64) -> ModuleState {
        let applied = self.run_setpoint(ModuleState::new(0.0, angle));
        self.mode = ModuleMode::Orienting;
        applied
    }

    /// Open-loop drive voltage; steer holds its last target
    pub fn run_characterization(&mut self, volts: f64) {
        if self.angle_setpoint.is_none() {
            self.angle_setpoint = Some(self.angle());
        }
        self.speed_setpoint = None;
        self.characterization_volts = volts;
        self.mode = ModuleMode::Characterizing;
    }

    /// Zero the drive and hold the steer where it was aimed
    pub fn stop(&mut self) {
        self.speed_setpoint = None;
        self.characterization_volts = 0.0;
        self.mode = ModuleMode::Idle;
    }

    /// Measured steer angle; 0 until the absolute encoder has been read
    pub fn angle(&self) -> f64 {
        match self.turn_relative_offset {
            Some(offset) => wrap_angle(self.inputs.turn_position + offset),
            None => 0.0,
        }
    }

    pub fn position_meters(&self) -> f64 {
        self.inputs.drive_position_rad * self.gains.wheel_radius_m
    }

    pub fn velocity_meters_per_sec(&self) -> f64 {
        self.inputs.drive_velocity_rad_per_sec * self.gains.wheel_radius_m
    }

    pub fn position(&self) -> ModulePosition {
        ModulePosition::new(self.position_meters(), self.angle())
    }

    pub fn state(&self) -> ModuleState {
        ModuleState::new(self.velocity_meters_per_sec(), self.angle())
    }

    /// True when the measured steer angle is within `tolerance` rad of its target
    pub fn at_angle_setpoint(&self, tolerance: f64) -> bool {
        self.angle_setpoint
            .is_some_and(|target| angle_delta(self.angle(), target).abs() <= tolerance)
    }

    /// Drive wheel rotation in radians, for wheel-radius characterization
    pub fn position_rads(&self) -> f64 {
        self.inputs.drive_position_rad
    }

    /// Drive wheel speed in rad/s, for feedforward characterization
    pub fn characterization_velocity(&self) -> f64 {
        self.inputs.drive_velocity_rad_per_sec
    }

    pub fn drive_disconnected(&self) -> bool {
        !self.inputs.drive_connected
    }

    pub fn turn_disconnected(&self) -> bool {
        !self.inputs.turn_connected
    }

    pub fn mode(&self) -> ModuleMode {
        self.mode
    }

    pub fn inputs(&self) -> &ModuleIoInputs {
        &self.inputs
    }
}

fn clamp_volts(volts: f64) -> f64 {
    if volts.is_finite() {
        volts.clamp(-MAX_VOLTS, MAX_VOLTS)
    } else {
        0.0
    }
}
