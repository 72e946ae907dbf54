//! The navigation worker: waypoint following, recovery and charger
//! mounting, interleaved on one scheduler tick.

pub mod charger;
mod obstacle;
pub mod recovery;

pub use charger::{ChargerFsm, ChargerPose};
pub use recovery::RecoveryFsm;

use crate::core::Core;
use crate::geom::dist_sq;
use crate::proto::RouteStatus;
use crate::routing::Waypoint;
use crate::state::InfoState;
use charger::ChargerAction;
use recovery::{RecoveryOutcome, RerouteSite};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// MCU stops 1..=7 on one waypoint enter recovery; the 8th goes straight to
/// rerouting.
const MAX_MICRONAVI_RETRIES: u32 = 7;

/// Waypoints may only be skipped when within this distance of the robot.
const SKIP_RADIUS_MM: i64 = 800;

const OBSTACLE_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const POSE_FRESHNESS_LIMIT: Duration = Duration::from_millis(200);

/// Mutable navigation state, all replaced or read under one lock so the
/// route buffer and `route_pos` are always observed consistently.
#[derive(Debug)]
pub struct NavCtl {
    pub route: Vec<Waypoint>,
    pub route_pos: usize,
    pub follow_route: bool,
    pub start_route: bool,
    pub finished_or_notfound: bool,
    /// Move-id generation in 1..=7; 0 is reserved for steer maneuvers.
    pub id_cnt: u8,
    pub micronavi_stops: u32,
    pub maneuver_cnt: u32,
    pub recovery: RecoveryFsm,
    pub charger: ChargerFsm,
    pub charger_pose: Option<ChargerPose>,
    pub live_obstacle_checking: bool,
    pub last_obstacle_check: Instant,
}

impl Default for NavCtl {
    fn default() -> Self {
        Self {
            route: Vec::new(),
            route_pos: 0,
            follow_route: false,
            start_route: false,
            finished_or_notfound: false,
            id_cnt: 1,
            micronavi_stops: 0,
            maneuver_cnt: 0,
            recovery: RecoveryFsm::default(),
            charger: ChargerFsm::default(),
            charger_pose: None,
            live_obstacle_checking: true,
            last_obstacle_check: Instant::now(),
        }
    }
}

impl NavCtl {
    /// Abandon route following and any recovery/docking in progress, as the
    /// immediate-motion commands do.
    pub fn clear_navigation(&mut self) {
        self.follow_route = false;
        self.start_route = false;
        self.recovery.reset();
        self.charger.reset();
    }

    /// The move id the MCU must echo for the current waypoint.
    fn expected_move_id(&self) -> u8 {
        (self.id_cnt << 4) | ((self.route_pos as u8) & 0x0F)
    }

    fn bump_id_cnt(&mut self) {
        self.id_cnt = if self.id_cnt >= 7 { 1 } else { self.id_cnt + 1 };
    }
}

/// Blocking work picked up while the navigation lock was held, executed
/// after it is released (routing requests re-take the lock to publish).
enum Pending {
    Reroute(RerouteSite),
    ChargerRoute(i32, i32),
    GiveUp,
}

/// The navigation worker loop. The inter-tick sleep is the cancel-safe
/// window; a tick itself is never torn down.
pub fn run(core: Arc<Core>) {
    let gate = &core.gates.navigation;
    loop {
        tick(&core);
        gate.set_cancelable(true);
        std::thread::sleep(Duration::from_millis(10));
        if gate.yield_point() {
            break;
        }
        gate.set_cancelable(false);
    }
}

pub fn tick(core: &Core) {
    let mut pending: Option<Pending> = None;

    {
        let mut nav = core.nav.lock();
        // Close-range docking maneuvers must not be aborted by the map.
        nav.live_obstacle_checking = nav.charger.stage() < 4;

        resume_on_line_of_sight(core, &mut nav);

        if nav.recovery.is_active() {
            match recovery::tick(core, &mut nav) {
                RecoveryOutcome::None => {}
                RecoveryOutcome::Reroute(site) => pending = Some(Pending::Reroute(site)),
                RecoveryOutcome::GiveUp => pending = Some(Pending::GiveUp),
            }
        }

        if nav.start_route && !nav.route.is_empty() {
            nav.start_route = false;
            let wp = nav.route[nav.route_pos];
            info!("starting route, id={:#04x}", nav.id_cnt << 4);
            let _ = core.motion.move_to(
                wp.x,
                wp.y,
                wp.backmode,
                nav.expected_move_id(),
                core.speed.cur(),
                0,
            );
            core.send_info(backmode_info(wp.backmode));
        }

        if nav.follow_route && pending.is_none() {
            pending = follow_tick(core, &mut nav);
        }

        if nav.charger.is_active() && pending.is_none() {
            if let Some(ChargerAction::RouteTo(x, y)) = charger::tick(core, &mut nav) {
                pending = Some(Pending::ChargerRoute(x, y));
            }
        }
    }

    match pending {
        None => {}
        Some(Pending::Reroute(site)) => {
            let no_route = core.routing.rerequest();
            apply_reroute_outcome(core, site, no_route);
        }
        Some(Pending::ChargerRoute(x, y)) => {
            let no_route = core.routing.request(crate::routing::RouteRequest {
                dest_x: x,
                dest_y: y,
                dont_map_lidars: false,
                no_tight: true,
            });
            let mut nav = core.nav.lock();
            if no_route {
                warn!("no route to the charger approach point, aborting mount");
                nav.charger.reset();
                drop(nav);
                core.send_info(InfoState::Idle);
            } else {
                nav.charger.advance(2);
            }
        }
        Some(Pending::GiveUp) => {
            core.report_route_status(RouteStatus::NotFound);
            core.send_info(InfoState::Idle);
        }
    }
}

/// While recovering: the moment a straight drive to the waypoint opens up,
/// drop the recovery machinery and resume the route.
fn resume_on_line_of_sight(core: &Core, nav: &mut NavCtl) {
    if !nav.recovery.is_active() {
        return;
    }
    let Some(wp) = nav.route.get(nav.route_pos).copied() else {
        return;
    };
    let p = core.pose.pose();
    if core
        .world
        .check_direct_route_non_turning(p.x, p.y, wp.x, wp.y)
    {
        info!("direct line-of-sight to the waypoint reappeared, resuming the route");
        nav.recovery.reset();
        nav.follow_route = true;
        nav.bump_id_cnt();
        issue_waypoint_move(core, nav);
    }
}

fn follow_tick(core: &Core, nav: &mut NavCtl) -> Option<Pending> {
    let xy = core.motion.xymove();
    // Only feedback for the move we actually issued counts.
    if (xy.id & 0x70) != (nav.id_cnt << 4) || (xy.id & 0x0F) != ((nav.route_pos as u8) & 0x0F) {
        return None;
    }

    if xy.micronavi_stop_flags != 0 || xy.feedback_stop_flags != 0 {
        if nav.micronavi_stops < MAX_MICRONAVI_RETRIES {
            nav.micronavi_stops += 1;
            info!(
                "MCU stop (#{} on this waypoint), entering recovery",
                nav.micronavi_stops
            );
            nav.recovery.enter();
        } else {
            info!("too many MCU stops on this waypoint, rerouting");
            return Some(Pending::Reroute(RerouteSite::TooManyStops));
        }
        return None;
    }

    if nav.id_cnt == 0 {
        // A steer maneuver just finished; re-issue the real waypoint.
        if xy.remaining < 30 {
            skip_reachable_waypoints(core, nav);
            nav.id_cnt = 1;
            info!("maneuver done, redoing waypoint id={:#04x}", nav.expected_move_id());
            issue_waypoint_move(core, nav);
        }
        return None;
    }

    if xy.remaining < 250 {
        core.good_lidar_time.store(true, Ordering::Relaxed);
    }

    let take_next_early = nav.route[nav.route_pos].take_next_early;
    if xy.remaining < take_next_early {
        nav.maneuver_cnt = 0;
        if nav.route_pos < nav.route.len() - 1 {
            nav.route_pos += 1;
            skip_reachable_waypoints(core, nav);
            info!("taking the next waypoint, id={:#04x}", nav.expected_move_id());
            issue_waypoint_move(core, nav);
            nav.micronavi_stops = 0;
        } else {
            info!("route finished");
            core.send_info(InfoState::Idle);
            nav.micronavi_stops = 0;
            nav.follow_route = false;
            nav.finished_or_notfound = true;
            core.report_route_status(RouteStatus::Success);
        }
    } else if nav.live_obstacle_checking
        && nav.last_obstacle_check.elapsed() >= OBSTACLE_CHECK_INTERVAL
    {
        nav.last_obstacle_check = Instant::now();
        // Never steer off a stale pose.
        if core.pose.snapshot().stamp.elapsed() <= POSE_FRESHNESS_LIMIT {
            obstacle::live_check(core, nav);
        }
    }
    None
}

fn apply_reroute_outcome(core: &Core, site: RerouteSite, no_route: bool) {
    let mut nav = core.nav.lock();
    match site {
        RerouteSite::TooManyStops => {
            if no_route {
                warn!("rerouting after repeated stops failed, giving up the route");
                nav.follow_route = false;
                nav.finished_or_notfound = true;
                drop(nav);
                core.report_route_status(RouteStatus::NotFound);
                core.send_info(InfoState::Idle);
            }
        }
        RerouteSite::Autonomous => {
            nav.recovery.reset();
        }
        RerouteSite::LookaroundExhausted | RerouteSite::CreepExhausted => {
            if no_route {
                info!("routing failed, going to daiju mode for a while");
                let _ = core.motion.daiju_mode(true);
                core.send_info(InfoState::Daijuing);
                nav.recovery.advance(8);
            }
        }
        RerouteSite::Daiju => {
            if no_route {
                info!("routing failed, daijuing a bit more");
                let _ = core.motion.daiju_mode(true);
                core.send_info(InfoState::Daijuing);
                let next = nav.recovery.stage() + 1;
                nav.recovery.advance(next);
            }
        }
    }
}

/// Skip forward over waypoints that are close, forward-mode and directly
/// reachable, so maneuvering does not zig-zag through stale intermediate
/// points.
fn skip_reachable_waypoints(core: &Core, nav: &mut NavCtl) {
    let p = core.pose.pose();
    while nav.route_pos < nav.route.len() - 1 && nav.route[nav.route_pos].backmode == 0 {
        let next = nav.route[nav.route_pos + 1];
        if dist_sq(p.x, p.y, next.x, next.y) < SKIP_RADIUS_MM * SKIP_RADIUS_MM
            && core.world.check_direct_route(p.ang, p.x, p.y, next.x, next.y)
        {
            info!("skipping waypoint ({}, {})", nav.route[nav.route_pos].x, nav.route[nav.route_pos].y);
            nav.route_pos += 1;
        } else {
            break;
        }
    }
}

fn issue_waypoint_move(core: &Core, nav: &NavCtl) {
    let Some(wp) = nav.route.get(nav.route_pos).copied() else {
        return;
    };
    let _ = core.motion.move_to(
        wp.x,
        wp.y,
        wp.backmode,
        nav.expected_move_id(),
        core.speed.cur(),
        0,
    );
    core.send_info(backmode_info(wp.backmode));
}

fn backmode_info(backmode: u8) -> InfoState {
    if backmode != 0 {
        InfoState::Rev
    } else {
        InfoState::Fwd
    }
}
