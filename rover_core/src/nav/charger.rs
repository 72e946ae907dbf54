//! Charger mounting: the persisted charger pose and the multi-phase
//! docking maneuver.

use crate::core::Core;
use crate::error::RoverResult;
use crate::geom::ang32_to_rad;
use crate::nav::NavCtl;
use crate::pose::Pose;
use crate::state::InfoState;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Approach waypoints along the dock axis, and the final forward push.
pub const CHARGER_FIRST_DIST: i32 = 1000;
pub const CHARGER_SECOND_DIST: i32 = 500;
pub const CHARGER_THIRD_DIST: i32 = 170;

/// The stage-8 hardware-mount watchdog.
const MOUNT_TIMEOUT_S: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargerPose {
    pub first_x: i32,
    pub first_y: i32,
    pub second_x: i32,
    pub second_y: i32,
    pub ang: i32,
    pub fwd: i32,
}

impl ChargerPose {
    /// Derive the approach points from the robot pose while it sits in the
    /// charger.
    pub fn from_dock_pose(p: Pose) -> Self {
        let dir = ang32_to_rad(p.ang);
        let (sin, cos) = dir.sin_cos();
        let back = |dist: i32| {
            (
                p.x - (cos * dist as f64) as i32,
                p.y - (sin * dist as f64) as i32,
            )
        };
        let (first_x, first_y) = back(CHARGER_FIRST_DIST);
        let (second_x, second_y) = back(CHARGER_SECOND_DIST);
        Self {
            first_x,
            first_y,
            second_x,
            second_y,
            ang: p.ang,
            fwd: CHARGER_SECOND_DIST - CHARGER_THIRD_DIST,
        }
    }

    /// One line: `first_x first_y second_x second_y ang fwd`.
    pub fn save(&self, path: &Path) -> RoverResult<()> {
        std::fs::write(
            path,
            format!(
                "{} {} {} {} {} {}\n",
                self.first_x, self.first_y, self.second_x, self.second_y, self.ang, self.fwd
            ),
        )?;
        Ok(())
    }

    pub fn load(path: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(path).ok()?;
        let vals: Vec<i32> = text
            .split_whitespace()
            .filter_map(|t| t.parse().ok())
            .collect();
        if vals.len() != 6 {
            return None;
        }
        Some(Self {
            first_x: vals[0],
            first_y: vals[1],
            second_x: vals[2],
            second_y: vals[3],
            ang: vals[4],
            fwd: vals[5],
        })
    }
}

/// Configure the charger pose from the robot's current (in-dock) position:
/// run a full-strength localization pass first, then derive and persist the
/// approach points.
pub fn configure_here(core: &Core) -> RoverResult<()> {
    let scans = core.lidar_ring.latest();
    if !scans.is_empty() {
        let (da, dx, dy) = core.world.map_lidars(&scans, false, core.state.mapping_2d());
        let id = core.pose.correct(da, dx, dy);
        let _ = core.motion.correct_robot_pos(da, dx, dy, id);
    }
    let p = core.pose.pose();
    let cp = ChargerPose::from_dock_pose(p);
    cp.save(&core.config.charger_pos_file())?;
    info!(
        "charger pose configured at ang={}, first ({}, {}), second ({}, {})",
        cp.ang, cp.first_x, cp.first_y, cp.second_x, cp.second_y
    );
    core.nav.lock().charger_pose = Some(cp);
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct ChargerFsm {
    stage: u8,
    entered_at: Instant,
}

impl Default for ChargerFsm {
    fn default() -> Self {
        Self {
            stage: 0,
            entered_at: Instant::now(),
        }
    }
}

impl ChargerFsm {
    pub fn is_active(&self) -> bool {
        self.stage != 0
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub fn reset(&mut self) {
        self.stage = 0;
    }

    pub fn start(&mut self) {
        self.stage = 1;
        self.entered_at = Instant::now();
    }

    /// Jump to a stage, restarting its timer.
    pub fn advance(&mut self, to: u8) {
        self.stage = to;
        self.entered_at = Instant::now();
    }

    fn elapsed_s(&self) -> f64 {
        self.entered_at.elapsed().as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChargerAction {
    /// Route to the first approach point; the caller blocks on routing.
    RouteTo(i32, i32),
}

pub(crate) fn tick(core: &Core, nav: &mut NavCtl) -> Option<ChargerAction> {
    let stage = nav.charger.stage();
    if stage == 0 {
        return None;
    }
    let Some(cp) = nav.charger_pose else {
        warn!("charger mount requested without a configured charger pose");
        nav.charger.reset();
        return None;
    };
    let p = core.pose.pose();

    match stage {
        1 => {
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);
            return Some(ChargerAction::RouteTo(cp.first_x, cp.first_y));
        }
        2 => {
            if !nav.follow_route && !nav.recovery.is_active() {
                if p.dist_to(cp.first_x, cp.first_y) > 300 {
                    info!("not at the first approach point, driving there again");
                    nav.charger.advance(1);
                } else {
                    core.send_info(InfoState::Think);
                    info!("at first approach point, turning to dock angle");
                    let _ = core.motion.turn_and_go_abs_rel(cp.ang, 0, 23, true);
                    nav.charger.advance(3);
                }
            }
        }
        3 if nav.charger.elapsed_s() > 2.5 => {
            core.send_info(InfoState::Think);
            info!("localizing against the map before the final approach");
            let scans = core.lidar_ring.latest();
            if !scans.is_empty() {
                let (da, dx, dy) = core.world.map_lidars(&scans, false, core.state.mapping_2d());
                let id = core.pose.correct(da, dx, dy);
                let _ = core.motion.correct_robot_pos(da, dx, dy, id);
            }
            core.lidar_ignore_over
                .store(false, std::sync::atomic::Ordering::Relaxed);
            nav.charger.advance(4);
        }
        4 => {
            let corrected_seen = core
                .lidar_ignore_over
                .load(std::sync::atomic::Ordering::Relaxed);
            if corrected_seen && nav.charger.elapsed_s() > 3.0 {
                info!("going to the second approach point");
                core.send_info(InfoState::Fwd);
                let _ = core.motion.move_to(cp.second_x, cp.second_y, 0, 0x7F, 20, 1);
                nav.charger.advance(5);
            }
        }
        5 => {
            let xy = core.motion.xymove();
            if xy.id == 0x7F && xy.remaining < 10 {
                if p.dist_to(cp.second_x, cp.second_y) > 180 {
                    info!("missed the second approach point, starting over");
                    nav.charger.advance(1);
                } else {
                    core.send_info(InfoState::Think);
                    let _ = core.motion.turn_and_go_abs_rel(cp.ang, cp.fwd, 20, true);
                    nav.charger.advance(6);
                }
            }
        }
        6 if nav.charger.elapsed_s() > 3.0 => {
            core.send_info(InfoState::Think);
            let _ = core.motion.turn_and_go_abs_rel(cp.ang, 0, 23, true);
            nav.charger.advance(7);
        }
        7 if nav.charger.elapsed_s() > 1.5 => {
            core.send_info(InfoState::Think);
            info!("requesting hardware charger mount");
            let _ = core.motion.find_charger();
            nav.charger.advance(8);
        }
        8 => {
            let pw = core.motion.power_status();
            if pw.charging || pw.charged {
                core.send_info(InfoState::Charging);
                info!("charging");
                nav.charger.reset();
            } else if nav.charger.elapsed_s() > MOUNT_TIMEOUT_S {
                warn!("not charging after mount attempt, retrying the approach");
                nav.charger.advance(1);
            }
        }
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::deg_to_ang32;

    #[test]
    fn charger_pose_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charger_pos.txt");
        let cp = ChargerPose {
            first_x: 1200,
            first_y: -300,
            second_x: 700,
            second_y: -300,
            ang: 123456,
            fwd: 330,
        };
        cp.save(&path).unwrap();
        assert_eq!(ChargerPose::load(&path), Some(cp));
    }

    #[test]
    fn approach_points_lie_on_dock_axis() {
        let p = Pose::new(deg_to_ang32(0.0), 2000, 500);
        let cp = ChargerPose::from_dock_pose(p);
        assert_eq!(cp.first_x, 2000 - CHARGER_FIRST_DIST);
        assert_eq!(cp.second_x, 2000 - CHARGER_SECOND_DIST);
        assert_eq!(cp.first_y, 500);
        assert_eq!(cp.fwd, CHARGER_SECOND_DIST - CHARGER_THIRD_DIST);
    }

    #[test]
    fn missing_charger_file_is_none() {
        assert_eq!(ChargerPose::load(Path::new("/nonexistent/charger")), None);
    }

    #[test]
    fn mount_watchdog_restarts_at_stage_one() {
        use crate::config::HostConfig;
        use crate::error::RoverResult;
        use crate::motion::{McuLink, McuRequest, McuResponse};
        use crate::routing::GridPlanner;
        use std::time::Duration;

        struct NullMcu;
        impl McuLink for NullMcu {
            fn send(&mut self, _req: &McuRequest) -> RoverResult<()> {
                Ok(())
            }
            fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
                Ok(None)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let cfg = HostConfig {
            data_dir: dir.path().to_path_buf(),
            ..HostConfig::default()
        };
        let core = Core::new(cfg, Box::new(NullMcu), Box::new(GridPlanner::default()));

        let mut nav = core.nav.lock();
        nav.charger_pose = Some(ChargerPose::from_dock_pose(Pose::new(0, 2000, 0)));
        // Stage 8 entered 91 s ago, no charging feedback since.
        nav.charger = ChargerFsm {
            stage: 8,
            entered_at: Instant::now()
                .checked_sub(Duration::from_secs(91))
                .unwrap(),
        };
        let action = tick(&core, &mut nav);
        assert!(action.is_none());
        assert_eq!(nav.charger.stage(), 1);
    }
}
