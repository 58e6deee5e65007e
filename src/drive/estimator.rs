// Pose estimator: wheel odometry fused with latency-compensated vision
//
// Odometry integrates the least-squares module twist every cycle, with the
// heading taken from the drive's heading source. Vision samples are applied
// at their capture time: the buffered pose nearest that time is pulled toward
// the vision pose, and the same rigid correction is carried forward through
// every later buffered pose up to the current one.

use std::collections::VecDeque;
use tracing::debug;

use super::geometry::{Pose2d, Twist2d, angle_delta, wrap_angle};
use super::kinematics::{MODULE_COUNT, ModulePosition, SwerveKinematics};
use crate::config::DriveConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PoseSample {
    timestamp: f64,
    pose: Pose2d,
}

pub struct PoseEstimator {
    kinematics: SwerveKinematics,
    pose: Pose2d,
    last_positions: [ModulePosition; MODULE_COUNT],
    last_heading: f64,
    // Estimated heading minus source heading
    heading_offset: f64,
    history: VecDeque<PoseSample>,
    history_capacity: usize,
    history_window_s: f64,
    // Odometry variance per axis
    state_variance: [f64; 3],
    // Per-axis fraction of a vision residual that gets applied
    vision_gains: [f64; 3],
    last_vision_timestamp: Option<f64>,
}

impl PoseEstimator {
    pub fn new(
        kinematics: SwerveKinematics,
        heading: f64,
        positions: [ModulePosition; MODULE_COUNT],
        initial_pose: Pose2d,
        config: &DriveConfig,
    ) -> Self {
        let history_capacity =
            (config.pose_history_s / config.loop_period_s).ceil().max(1.0) as usize + 1;
        let mut estimator = Self {
            kinematics,
            pose: initial_pose,
            last_positions: positions,
            last_heading: heading,
            heading_offset: wrap_angle(initial_pose.heading - heading),
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            history_window_s: config.pose_history_s,
            state_variance: config.odometry_std_devs.map(|s| s * s),
            vision_gains: [0.0; 3],
            last_vision_timestamp: None,
        };
        estimator.set_vision_std_devs(config.vision_std_devs);
        estimator
    }

    /// Trust per axis (x m, y m, heading rad); larger means less correction
    pub fn set_vision_std_devs(&mut self, std_devs: [f64; 3]) {
        for axis in 0..3 {
            let q = self.state_variance[axis];
            let r = std_devs[axis] * std_devs[axis];
            self.vision_gains[axis] = if q == 0.0 { 0.0 } else { q / (q + (q * r).sqrt()) };
        }
    }

    pub fn vision_gains(&self) -> [f64; 3] {
        self.vision_gains
    }

    pub fn pose(&self) -> Pose2d {
        self.pose
    }

    /// Predict step: integrate module travel since the last call
    pub fn update(
        &mut self,
        timestamp: f64,
        heading: f64,
        positions: [ModulePosition; MODULE_COUNT],
    ) -> Pose2d {
        let mut twist = self.kinematics.to_twist(&self.last_positions, &positions);
        twist.dtheta = angle_delta(self.last_heading, heading);

        let mut next = self.pose.exp(&twist);
        next.heading = wrap_angle(heading + self.heading_offset);

        self.pose = next;
        self.last_positions = positions;
        self.last_heading = heading;
        self.push_sample(timestamp, next);
        next
    }

    fn push_sample(&mut self, timestamp: f64, pose: Pose2d) {
        while self
            .history
            .front()
            .is_some_and(|s| s.timestamp < timestamp - self.history_window_s)
        {
            self.history.pop_front();
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(PoseSample { timestamp, pose });
    }

    /// Correct step. Returns false when the sample was not applied.
    pub fn add_vision_measurement(&mut self, vision_pose: Pose2d, timestamp: f64) -> bool {
        if self.last_vision_timestamp == Some(timestamp) {
            return false;
        }
        let Some(oldest) = self.history.front() else {
            return false;
        };
        if timestamp < oldest.timestamp {
            debug!(
                "Vision sample at {:.3}s predates pose history ({:.3}s), dropped",
                timestamp, oldest.timestamp
            );
            return false;
        }

        let index = self.nearest_sample(timestamp);
        let sample = self.history[index].pose;

        let residual = sample.log(&vision_pose);
        let scaled = Twist2d::new(
            residual.dx * self.vision_gains[0],
            residual.dy * self.vision_gains[1],
            residual.dtheta * self.vision_gains[2],
        );
        let corrected = sample.exp(&scaled);

        for entry in self.history.iter_mut().skip(index) {
            let local = entry.pose.relative_to(&sample);
            entry.pose = corrected.transform_by(&local);
        }

        if let Some(latest) = self.history.back() {
            self.pose = latest.pose;
        }
        self.heading_offset = wrap_angle(self.pose.heading - self.last_heading);
        self.last_vision_timestamp = Some(timestamp);
        true
    }

    fn nearest_sample(&self, timestamp: f64) -> usize {
        let after = self.history.partition_point(|s| s.timestamp < timestamp);
        if after == 0 {
            return 0;
        }
        if after >= self.history.len() {
            return self.history.len() - 1;
        }
        let before_gap = timestamp - self.history[after - 1].timestamp;
        let after_gap = self.history[after].timestamp - timestamp;
        if before_gap <= after_gap { after - 1 } else { after }
    }

    /// Teleport to `pose`, re-anchoring odometry on the current readings
    pub fn reset_position(
        &mut self,
        heading: f64,
        positions: [ModulePosition; MODULE_COUNT],
        pose: Pose2d,
    ) {
        self.pose = pose;
        self.last_positions = positions;
        self.last_heading = heading;
        self.heading_offset = wrap_angle(pose.heading - heading);
        self.history.clear();
        self.last_vision_timestamp = None;
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}
