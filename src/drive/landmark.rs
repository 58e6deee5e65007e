// Alliance context and field landmark queries
//
// The alliance is read through a trait on every query so the host can change
// it (or tests can inject it) without touching drive state.

use serde::{Deserialize, Serialize};

use super::geometry::{Pose2d, Translation2d};
use super::io::FiducialTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Alliance {
    Red,
    Blue,
}

pub trait AllianceSource {
    /// None until the field has assigned an alliance
    fn alliance(&self) -> Option<Alliance>;
}

/// Alliance known up front (CLI flag, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedAlliance(pub Option<Alliance>);

impl AllianceSource for FixedAlliance {
    fn alliance(&self) -> Option<Alliance> {
        self.0
    }
}

/// Speaker opening positions, field frame
pub const RED_SPEAKER: Translation2d = Translation2d::new(16.54, 5.54);
pub const BLUE_SPEAKER: Translation2d = Translation2d::new(0.0, 5.54);

/// Horizontal offset ceiling for the closest-tag search, degrees
const CLOSEST_TAG_CEILING_DEG: f64 = 100.0;

/// Speaker pose for the current alliance; the origin when unknown
pub fn speaker_pose(alliance: &dyn AllianceSource) -> Pose2d {
    match alliance.alliance() {
        Some(Alliance::Red) => Pose2d::new(RED_SPEAKER.x, RED_SPEAKER.y, 0.0),
        Some(Alliance::Blue) => Pose2d::new(BLUE_SPEAKER.x, BLUE_SPEAKER.y, 0.0),
        None => Pose2d::default(),
    }
}

/// Field-frame direction from the robot to `target`, radians
pub fn rotation_to(target: &Pose2d, robot: &Pose2d) -> f64 {
    (target.y - robot.y).atan2(target.x - robot.x)
}

pub fn distance_to(target: &Pose2d, robot: &Pose2d) -> f64 {
    target.translation().distance(&robot.translation())
}

/// Bearing of `target` in the robot frame, degrees.
///
/// Uses atan(y/x), so a target behind the robot reads the same as one in
/// front; zero facing forward on either alliance.
pub fn bearing_deg(target: &Pose2d, robot: &Pose2d) -> f64 {
    let relative = target.relative_to(robot);
    if relative.x == 0.0 && relative.y == 0.0 {
        return 0.0;
    }
    (relative.y / relative.x).atan().to_degrees()
}

/// Tag with the smallest raw horizontal offset among the accepted ids.
///
/// This ranks by camera bearing, not by range.
pub fn closest_tag(targets: &[FiducialTarget], valid_ids: &[u32]) -> Option<FiducialTarget> {
    let mut closest = CLOSEST_TAG_CEILING_DEG;
    let mut found = None;
    for target in targets.iter().filter(|t| valid_ids.contains(&t.id)) {
        if target.tx < closest {
            closest = target.tx;
            found = Some(*target);
        }
    }
    found
}
