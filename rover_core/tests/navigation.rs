//! End-to-end navigation scenarios against a scripted MCU and planner.

mod common;

use common::harness;
use rover_core::core::ActiveCmd;
use rover_core::motion::{McuRequest, XyMoveStatus};
use rover_core::nav;
use rover_core::pose::Pose;
use rover_core::routing::{self, RouteRequest};
use rover_core::sensors::SonarPoint;
use std::time::{Duration, Instant};

fn xymove(id: u8, remaining: i32) -> XyMoveStatus {
    XyMoveStatus {
        id,
        remaining,
        ..Default::default()
    }
}

fn move_ids(reqs: &[McuRequest]) -> Vec<u8> {
    reqs.iter()
        .filter_map(|r| match r {
            McuRequest::MoveTo { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

#[test]
fn reachable_goal_completes_after_three_moves() {
    let h = harness();
    h.script_route(&[(1000, 0, 0), (2000, 0, 0), (3000, 0, 0)]);

    let p = h.core.pose.pose();
    *h.core.active_cmd.lock() = Some(ActiveCmd::Route {
        start_ang16: 0,
        start_x: p.x,
        start_y: p.y,
        requested_x: 3000,
        requested_y: 0,
    });

    let no_route = routing::run_search(
        &h.core,
        RouteRequest {
            dest_x: 3000,
            dest_y: 0,
            dont_map_lidars: true,
            no_tight: true,
        },
    );
    assert!(!no_route);

    let (id_cnt, take_nexts) = {
        let nav = h.core.nav.lock();
        assert!(nav.follow_route && nav.start_route);
        assert_eq!(nav.route.len(), 3);
        (
            nav.id_cnt,
            nav.route.iter().map(|w| w.take_next_early).collect::<Vec<_>>(),
        )
    };
    // 1000 mm segments -> 100 mm take-next-early, terminal 20 mm.
    assert_eq!(take_nexts, vec![100, 100, 20]);

    // First tick issues the first waypoint move.
    nav::tick(&h.core);
    assert_eq!(move_ids(&h.sent_requests()), vec![id_cnt << 4]);

    // Drive through the waypoints by reporting shrinking remaining
    // distances under the expected move ids.
    h.push_xymove(xymove(id_cnt << 4, 40));
    nav::tick(&h.core);
    h.push_xymove(xymove((id_cnt << 4) | 1, 40));
    nav::tick(&h.core);
    h.push_xymove(xymove((id_cnt << 4) | 2, 15));
    nav::tick(&h.core);

    let nav_state = h.core.nav.lock();
    assert!(!nav_state.follow_route);
    assert!(nav_state.finished_or_notfound);
    drop(nav_state);

    assert_eq!(
        move_ids(&h.sent_requests()),
        vec![id_cnt << 4, (id_cnt << 4) | 1, (id_cnt << 4) | 2]
    );
    // The SUCCESS report consumed the active route command.
    assert!(h.core.active_cmd.lock().is_none());
}

/// A wall across the corridor, far enough away that turning in place stays
/// possible.
fn build_wall(h: &common::Harness, x: i32) {
    for y in (-400..=400).step_by(40) {
        for dx in [0, 40, 80] {
            h.core.world.map_sonar(SonarPoint {
                corr_id: 0,
                x: x + dx,
                y,
            });
        }
    }
}

#[test]
fn blocked_route_walks_recovery_stages_in_order() {
    let h = harness();
    build_wall(&h, 1000);
    h.script_route(&[(2000, 0, 0)]);

    let no_route = routing::run_search(
        &h.core,
        RouteRequest {
            dest_x: 2000,
            dest_y: 0,
            dont_map_lidars: true,
            no_tight: true,
        },
    );
    assert!(!no_route);

    let id_cnt = h.core.nav.lock().id_cnt;
    nav::tick(&h.core); // issues the move

    // The MCU reflex-stops against the obstacle.
    h.push_xymove(XyMoveStatus {
        id: id_cnt << 4,
        remaining: 1500,
        micronavi_stop_flags: 0x4,
        ..Default::default()
    });
    nav::tick(&h.core);
    {
        let nav_state = h.core.nav.lock();
        assert_eq!(nav_state.recovery.stage(), 1);
        assert_eq!(nav_state.micronavi_stops, 1);
    }

    // Stage 1 backs off immediately and arms the 1 s probe timers.
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().recovery.stage(), 2);
    assert!(matches!(
        h.sent_requests().last(),
        Some(McuRequest::TurnAndGoAbsRel {
            dist_rel: -50,
            ..
        })
    ));

    // Probe stages 2..=5 each advance after their 1 s gate; a premature
    // tick must not advance.
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().recovery.stage(), 2);
    for expected_next in [3u8, 4, 5, 6] {
        std::thread::sleep(Duration::from_millis(1050));
        nav::tick(&h.core);
        assert_eq!(h.core.nav.lock().recovery.stage(), expected_next);
    }

    // Stage 6: the turn toward the waypoint is feasible (the wall is far),
    // so the FSM creeps forward and enters the creep stage without any
    // reroute.
    std::thread::sleep(Duration::from_millis(1050));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().recovery.stage(), 7);
    assert!(matches!(
        h.sent_requests().last(),
        Some(McuRequest::TurnAndGoAbsRel { dist_rel: 50, .. })
    ));
}

#[test]
fn reroute_after_repeated_stops_replaces_route_buffer() {
    let h = harness();
    build_wall(&h, 1000);
    h.spawn_routing_worker();

    h.script_route(&[(2000, 0, 0)]);
    let no_route = h.core.routing.request(RouteRequest {
        dest_x: 2000,
        dest_y: 0,
        dont_map_lidars: true,
        no_tight: true,
    });
    assert!(!no_route);
    let old_id_cnt = h.core.nav.lock().id_cnt;

    nav::tick(&h.core); // issue the move

    // Burn through the per-waypoint stop budget, then stop once more.
    h.core.nav.lock().micronavi_stops = 7;
    h.script_route(&[(500, 800, 0), (2000, 0, 0)]);
    h.push_xymove(XyMoveStatus {
        id: old_id_cnt << 4,
        remaining: 1500,
        micronavi_stop_flags: 0x4,
        ..Default::default()
    });
    nav::tick(&h.core);

    let nav_state = h.core.nav.lock();
    assert!(nav_state.follow_route);
    assert_eq!(nav_state.route_pos, 0);
    assert_eq!(nav_state.route.len(), 2);
    assert_eq!(nav_state.route[0].x, 500);
    assert!((1..=7).contains(&nav_state.id_cnt));
    assert_ne!(nav_state.id_cnt, old_id_cnt);
    assert!(!nav_state.recovery.is_active());
}

#[test]
fn live_obstacle_check_stops_move_and_enters_recovery() {
    let h = harness();
    h.script_route(&[(3000, 0, 0)]);
    let no_route = routing::run_search(
        &h.core,
        RouteRequest {
            dest_x: 3000,
            dest_y: 0,
            dont_map_lidars: true,
            no_tight: true,
        },
    );
    assert!(!no_route);
    let id_cnt = h.core.nav.lock().id_cnt;
    nav::tick(&h.core);

    // A wall appears mid-route, well inside the 1200 mm look-ahead.
    build_wall(&h, 960);
    h.core.pose.publish(Pose::default());
    h.core.nav.lock().last_obstacle_check =
        Instant::now().checked_sub(Duration::from_millis(300)).unwrap();

    h.push_xymove(xymove(id_cnt << 4, 2500));
    nav::tick(&h.core);

    assert_eq!(h.core.speed.cur(), 18);
    assert!(h
        .sent_requests()
        .iter()
        .any(|r| matches!(r, McuRequest::StopMovement)));
    assert!(h.core.nav.lock().recovery.is_active());
}

#[test]
fn stale_pose_skips_live_obstacle_check() {
    let h = harness();
    h.script_route(&[(3000, 0, 0)]);
    routing::run_search(
        &h.core,
        RouteRequest {
            dest_x: 3000,
            dest_y: 0,
            dont_map_lidars: true,
            no_tight: true,
        },
    );
    let id_cnt = h.core.nav.lock().id_cnt;
    nav::tick(&h.core);

    build_wall(&h, 960);
    h.core.nav.lock().last_obstacle_check =
        Instant::now().checked_sub(Duration::from_millis(300)).unwrap();
    // Let the pose go stale past the 200 ms freshness limit.
    std::thread::sleep(Duration::from_millis(250));

    h.push_xymove(xymove(id_cnt << 4, 2500));
    nav::tick(&h.core);

    assert!(
        !h.core.nav.lock().recovery.is_active(),
        "a stale pose must suppress the obstacle check"
    );
}
