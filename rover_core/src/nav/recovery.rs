//! Lookaround / creep / reroute recovery, entered when a waypoint becomes
//! unreachable.
//!
//! Stages 1-6 probe the surroundings by turning toward offsets around the
//! waypoint bearing, 7 creeps forward in short jittered steps, 8-11 retry
//! routing from daiju mode, 12 gives up. Transitions are timed from the
//! stage entry timestamp.

use crate::core::Core;
use crate::geom::{ang_to, rad_to_ang32, ANG_1_DEG};
use crate::nav::NavCtl;
use crate::state::CommandSource;
use std::time::Instant;
use tracing::{info, warn};

const LOOKAROUND_TURN_DEG: f64 = 10.0;
const CREEP_AMOUNT_MM: i32 = 100;
const CREEP_BUDGET: u8 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryFsm {
    stage: u8,
    entered_at: Instant,
    creep_cnt: u8,
}

impl Default for RecoveryFsm {
    fn default() -> Self {
        Self {
            stage: 0,
            entered_at: Instant::now(),
            creep_cnt: 0,
        }
    }
}

impl RecoveryFsm {
    pub fn is_active(&self) -> bool {
        self.stage != 0
    }

    pub fn stage(&self) -> u8 {
        self.stage
    }

    pub fn reset(&mut self) {
        self.stage = 0;
    }

    /// Enter at stage 1; the backoff move happens on the next tick.
    pub fn enter(&mut self) {
        self.stage = 1;
        self.entered_at = Instant::now();
    }

    pub(crate) fn advance(&mut self, to: u8) {
        self.stage = to;
        self.entered_at = Instant::now();
    }

    fn elapsed_s(&self) -> f64 {
        self.entered_at.elapsed().as_secs_f64()
    }
}

/// Why the recovery machine wants a reroute; decides what happens on
/// routing failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RerouteSite {
    /// Too many MCU stops on the same waypoint.
    TooManyStops,
    /// Autonomous exploration does not bother clearing the exact route.
    Autonomous,
    /// Lookaround probes exhausted without a feasible turn.
    LookaroundExhausted,
    /// Creep budget spent without line-of-sight.
    CreepExhausted,
    /// One daiju period over.
    Daiju,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryOutcome {
    None,
    Reroute(RerouteSite),
    GiveUp,
}

pub(crate) fn tick(core: &Core, nav: &mut NavCtl) -> RecoveryOutcome {
    let stage = nav.recovery.stage();
    if stage == 0 {
        return RecoveryOutcome::None;
    }
    let Some(wp) = nav.route.get(nav.route_pos).copied() else {
        nav.recovery.reset();
        return RecoveryOutcome::None;
    };
    let p = core.pose.pose();

    match stage {
        1 => {
            nav.follow_route = false;
            nav.start_route = false;
            info!("recovery started; backing off 50 mm");
            let _ = core.motion.turn_and_go_abs_rel(p.ang, -50, 13, true);
            nav.recovery.advance(2);
        }
        2..=5 if nav.recovery.elapsed_s() > 1.0 => {
            if stage == 2
                && core.state.command_source() == CommandSource::Autonomous
                && core.explorer.is_active()
            {
                info!("exploring autonomously; rerouting instead of lookaround");
                return RecoveryOutcome::Reroute(RerouteSite::Autonomous);
            }
            // Probe offsets sweep right of the waypoint bearing, then left.
            let (turn_deg, creep_mm, wiggle_deg) = match stage {
                2 => (-LOOKAROUND_TURN_DEG, 0, -4),
                3 => (-1.8 * LOOKAROUND_TURN_DEG, -20, -4),
                4 => (LOOKAROUND_TURN_DEG, 0, 12),
                _ => (1.8 * LOOKAROUND_TURN_DEG, 0, 4),
            };
            let target = ang_to(p.x, p.y, wp.x, wp.y) + turn_deg.to_radians();
            if core.world.test_robot_turn(p.x, p.y, p.ang, target) {
                let _ = core
                    .motion
                    .turn_and_go_abs_rel(rad_to_ang32(target), creep_mm, 13, true);
            } else {
                let _ = core.motion.turn_and_go_abs_rel(
                    p.ang.wrapping_add(wiggle_deg * ANG_1_DEG),
                    0,
                    13,
                    true,
                );
            }
            if stage == 5 {
                nav.recovery.creep_cnt = 0;
            }
            nav.recovery.advance(stage + 1);
        }
        6 if nav.recovery.elapsed_s() > 1.0 => {
            let target = ang_to(p.x, p.y, wp.x, wp.y);
            if core.world.test_robot_turn(p.x, p.y, p.ang, target) {
                let _ = core
                    .motion
                    .turn_and_go_abs_rel(rad_to_ang32(target), 50, 13, true);
                nav.recovery.advance(7);
            } else {
                info!("cannot turn toward the waypoint, rerouting");
                return RecoveryOutcome::Reroute(RerouteSite::LookaroundExhausted);
            }
        }
        7 if nav.recovery.elapsed_s() > 2.5 => {
            let dist = p.dist_to(wp.x, wp.y);
            if dist > 300 && nav.recovery.creep_cnt < CREEP_BUDGET {
                let ang = ang_to(p.x, p.y, wp.x, wp.y);
                let dest_x = p.x + (CREEP_AMOUNT_MM as f64 * ang.cos()) as i32;
                let dest_y = p.y + (CREEP_AMOUNT_MM as f64 * ang.sin()) as i32;
                if core.world.direct_route_hitcnt(p.x, p.y, dest_x, dest_y) < 1 {
                    // Alternate a small heading jitter between creeps.
                    let jitter = if nav.recovery.creep_cnt & 1 == 1 { 5 } else { -5 };
                    let _ = core.motion.turn_and_go_abs_rel(
                        rad_to_ang32(ang).wrapping_add(jitter * ANG_1_DEG),
                        CREEP_AMOUNT_MM,
                        15,
                        true,
                    );
                } else {
                    // Blocked: burn the budget so the next pass reroutes.
                    nav.recovery.creep_cnt = 98;
                }
                nav.recovery.creep_cnt += 1;
                nav.recovery.advance(7);
            } else {
                info!(
                    "creeped enough (dist {dist} mm, {} creeps), rerouting",
                    nav.recovery.creep_cnt
                );
                return RecoveryOutcome::Reroute(RerouteSite::CreepExhausted);
            }
        }
        8..=11 if nav.recovery.elapsed_s() > 5.0 => {
            info!("daijued enough, retrying routing");
            let _ = core.motion.daiju_mode(false);
            return RecoveryOutcome::Reroute(RerouteSite::Daiju);
        }
        12 => {
            warn!("recovery exhausted, giving up the route");
            let _ = core.motion.daiju_mode(false);
            nav.recovery.reset();
            nav.follow_route = false;
            nav.finished_or_notfound = true;
            return RecoveryOutcome::GiveUp;
        }
        _ => {}
    }
    RecoveryOutcome::None
}
