// Simulated drivetrain hardware
//
// Stands in for the motor controllers and gyro when no robot is attached.
// Each actuator is a first-order velocity response to applied voltage; the
// gyro integrates the yaw rate implied by the simulated wheel states, so
// odometry and heading stay consistent.

use std::sync::{Arc, Mutex};

use crate::config::DriveConfig;
use crate::drive::geometry::wrap_angle;
use crate::drive::io::{GyroIo, GyroIoInputs, ModuleIo, ModuleIoInputs};
use crate::drive::kinematics::{MODULE_COUNT, ModuleState, SwerveKinematics};
use crate::error::Result;

/// Drive wheel rad/s per applied volt at steady state
const DRIVE_RAD_PER_SEC_PER_VOLT: f64 = 1.0 / 0.13;
const DRIVE_TIME_CONSTANT_S: f64 = 0.05;
/// Steer rad/s per applied volt at steady state
const TURN_RAD_PER_SEC_PER_VOLT: f64 = 3.0;
const TURN_TIME_CONSTANT_S: f64 = 0.02;
/// Rough stall-current scale for telemetry, amps per volt of back-EMF gap
const AMPS_PER_VOLT: f64 = 10.0;

#[derive(Debug, Clone, Default)]
struct SimModuleState {
    drive_position_rad: f64,
    drive_velocity: f64,
    drive_volts: f64,
    // Relative steer encoder, zero at boot
    turn_position: f64,
    turn_velocity: f64,
    turn_volts: f64,
    // Steer angle at boot, as read by the absolute encoder
    turn_boot_angle: f64,
}

impl SimModuleState {
    fn step(&mut self, dt: f64) {
        let drive_target = self.drive_volts * DRIVE_RAD_PER_SEC_PER_VOLT;
        self.drive_velocity += (drive_target - self.drive_velocity) * response(dt, DRIVE_TIME_CONSTANT_S);
        self.drive_position_rad += self.drive_velocity * dt;

        let turn_target = self.turn_volts * TURN_RAD_PER_SEC_PER_VOLT;
        self.turn_velocity += (turn_target - self.turn_velocity) * response(dt, TURN_TIME_CONSTANT_S);
        self.turn_position += self.turn_velocity * dt;
    }

    fn turn_absolute_position(&self) -> f64 {
        wrap_angle(self.turn_boot_angle + self.turn_position)
    }
}

/// Fraction of the gap to target closed in one step of `dt`
fn response(dt: f64, time_constant: f64) -> f64 {
    (dt / (time_constant + dt)).clamp(0.0, 1.0)
}

/// One simulated module; advances its model once per `update_inputs`
pub struct SimModuleIo {
    state: Arc<Mutex<SimModuleState>>,
    dt: f64,
}

impl ModuleIo for SimModuleIo {
    fn update_inputs(&mut self, inputs: &mut ModuleIoInputs) {
        let Ok(mut state) = self.state.lock() else {
            inputs.drive_connected = false;
            inputs.turn_connected = false;
            return;
        };
        state.step(self.dt);

        inputs.drive_position_rad = state.drive_position_rad;
        inputs.drive_velocity_rad_per_sec = state.drive_velocity;
        inputs.drive_applied_volts = state.drive_volts;
        inputs.drive_current_amps =
            ((state.drive_volts - state.drive_velocity / DRIVE_RAD_PER_SEC_PER_VOLT) * AMPS_PER_VOLT).abs();
        inputs.turn_absolute_position = state.turn_absolute_position();
        inputs.turn_position = state.turn_position;
        inputs.turn_velocity_rad_per_sec = state.turn_velocity;
        inputs.turn_applied_volts = state.turn_volts;
        inputs.turn_current_amps =
            ((state.turn_volts - state.turn_velocity / TURN_RAD_PER_SEC_PER_VOLT) * AMPS_PER_VOLT).abs();
        inputs.drive_connected = true;
        inputs.turn_connected = true;
    }

    fn set_drive_voltage(&mut self, volts: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.drive_volts = volts;
        }
    }

    fn set_turn_voltage(&mut self, volts: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.turn_volts = volts;
        }
    }
}

/// Gyro reading the rotation the simulated wheels produce
pub struct SimGyro {
    kinematics: SwerveKinematics,
    modules: [Arc<Mutex<SimModuleState>>; MODULE_COUNT],
    wheel_radius: f64,
    dt: f64,
    yaw: f64,
    yaw_velocity: f64,
}

impl SimGyro {
    fn measured_states(&self) -> [ModuleState; MODULE_COUNT] {
        let mut states = [ModuleState::default(); MODULE_COUNT];
        for (state, module) in states.iter_mut().zip(&self.modules) {
            if let Ok(module) = module.lock() {
                *state = ModuleState::new(
                    module.drive_velocity * self.wheel_radius,
                    module.turn_absolute_position(),
                );
            }
        }
        states
    }
}

impl GyroIo for SimGyro {
    fn update_inputs(&mut self, inputs: &mut GyroIoInputs) {
        self.yaw_velocity = self.kinematics.to_chassis_speeds(&self.measured_states()).omega;
        self.yaw = wrap_angle(self.yaw + self.yaw_velocity * self.dt);

        inputs.connected = true;
        inputs.yaw = self.yaw;
        inputs.yaw_velocity_rad_per_sec = self.yaw_velocity;
    }

    fn reset(&mut self) {
        self.yaw = 0.0;
    }
}

/// Four simulated modules (FL, FR, BL, BR) plus a gyro that shares their state.
///
/// `boot_angles` are where each steer sits when the robot powers on.
pub fn sim_drivetrain(
    config: &DriveConfig,
    boot_angles: [f64; MODULE_COUNT],
) -> Result<([Box<dyn ModuleIo>; MODULE_COUNT], SimGyro)> {
    let kinematics = SwerveKinematics::new(&config.layout())?;
    let states = boot_angles.map(|angle| {
        Arc::new(Mutex::new(SimModuleState {
            turn_boot_angle: wrap_angle(angle),
            ..Default::default()
        }))
    });
    let dt = config.loop_period_s;

    let modules = states.clone().map(|state| Box::new(SimModuleIo { state, dt }) as Box<dyn ModuleIo>);
    let gyro = SimGyro {
        kinematics,
        modules: states,
        wheel_radius: config.wheel_radius_m,
        dt,
        yaw: 0.0,
        yaw_velocity: 0.0,
    };
    Ok((modules, gyro))
}
