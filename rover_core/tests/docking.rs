//! Charger mounting: the full staged docking sequence against a scripted
//! MCU.

mod common;

use common::harness;
use rover_core::motion::{McuRequest, McuResponse, PowerStatus, XyMoveStatus};
use rover_core::nav::{self, ChargerPose};
use rover_core::pose::Pose;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn dock_pose() -> ChargerPose {
    // Robot docked at (2000, 0) facing +x.
    ChargerPose::from_dock_pose(Pose::new(0, 2000, 0))
}

#[test]
fn full_docking_sequence_reaches_charging() {
    let h = harness();
    h.spawn_routing_worker();
    let cp = dock_pose();
    {
        let mut nav_state = h.core.nav.lock();
        nav_state.charger_pose = Some(cp);
        nav_state.charger.start();
    }

    // Stage 1 routes to the first approach point.
    h.script_route(&[(cp.first_x, cp.first_y, 0)]);
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 2);
    assert!(h.core.nav.lock().follow_route);

    // Drive the approach route to completion.
    let id_cnt = h.core.nav.lock().id_cnt;
    nav::tick(&h.core); // issues the approach move
    h.push_xymove(XyMoveStatus {
        id: id_cnt << 4,
        remaining: 15,
        ..Default::default()
    });
    h.core.pose.publish(Pose::new(0, cp.first_x, cp.first_y));
    nav::tick(&h.core);
    assert!(!h.core.nav.lock().follow_route);

    // Stage 2: on the spot, turn to the dock angle.
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 3);

    // Stage 3 localizes after the 2.5 s settle.
    std::thread::sleep(Duration::from_millis(2600));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 4);
    assert!(!h.core.lidar_ignore_over.load(Ordering::Relaxed));

    // Stage 4 waits for a post-correction lidar and the 3 s gate, then
    // heads for the second approach point with the reserved move id.
    h.core.lidar_ignore_over.store(true, Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(3050));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 5);
    assert!(h.sent_requests().iter().any(|r| matches!(
        r,
        McuRequest::MoveTo {
            id: 0x7F,
            speedlim: 20,
            ..
        }
    )));

    // Stage 5 completes the move close enough and starts the forward push.
    h.core.pose.publish(Pose::new(0, cp.second_x, cp.second_y));
    h.push_xymove(XyMoveStatus {
        id: 0x7F,
        remaining: 5,
        ..Default::default()
    });
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 6);
    assert!(h.sent_requests().iter().any(|r| matches!(
        r,
        McuRequest::TurnAndGoAbsRel { dist_rel, speed: 20, .. } if *dist_rel == cp.fwd
    )));

    // Stages 6 and 7: settle, square up, engage the hardware dock.
    std::thread::sleep(Duration::from_millis(3050));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 7);
    std::thread::sleep(Duration::from_millis(1550));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 8);
    assert!(h
        .sent_requests()
        .iter()
        .any(|r| matches!(r, McuRequest::FindCharger)));

    // Power reports charging: the docking FSM retires.
    h.mcu
        .lock()
        .unwrap()
        .queue
        .push_back(McuResponse::Power(PowerStatus {
            charging: true,
            ..Default::default()
        }));
    h.core
        .motion
        .pump(&h.core.pose, &h.core.sensors_tx)
        .unwrap();
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 0);
}

#[test]
fn missed_first_approach_restarts_the_procedure() {
    let h = harness();
    h.spawn_routing_worker();
    let cp = dock_pose();
    {
        let mut nav_state = h.core.nav.lock();
        nav_state.charger_pose = Some(cp);
        nav_state.charger.start();
    }

    h.script_route(&[(cp.first_x, cp.first_y, 0)]);
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 2);

    // Abort the route and leave the robot 600 mm off the approach point.
    {
        let mut nav_state = h.core.nav.lock();
        nav_state.follow_route = false;
        nav_state.start_route = false;
    }
    h.core
        .pose
        .publish(Pose::new(0, cp.first_x - 600, cp.first_y));
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 1);
}

#[test]
fn docking_suppresses_live_obstacle_checking_from_stage_four() {
    let h = harness();
    let cp = dock_pose();
    {
        let mut nav_state = h.core.nav.lock();
        nav_state.charger_pose = Some(cp);
        nav_state.charger.advance(4);
    }
    nav::tick(&h.core);
    assert!(!h.core.nav.lock().live_obstacle_checking);

    {
        let mut nav_state = h.core.nav.lock();
        nav_state.charger.advance(2);
    }
    nav::tick(&h.core);
    assert!(h.core.nav.lock().live_obstacle_checking);
}

#[test]
fn no_route_to_charger_aborts_the_mount() {
    let h = harness();
    h.spawn_routing_worker();
    let cp = dock_pose();
    {
        let mut nav_state = h.core.nav.lock();
        nav_state.charger_pose = Some(cp);
        nav_state.charger.start();
    }
    h.script_no_route();
    nav::tick(&h.core);
    assert_eq!(h.core.nav.lock().charger.stage(), 0);
}
