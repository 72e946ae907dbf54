//! Live obstacle checking against the evolving map while a route is being
//! driven.

use crate::core::Core;
use crate::geom::ang_to;
use crate::nav::NavCtl;

/// How far ahead the check looks along the line to the next waypoint.
const LOOKAHEAD_MM: i32 = 1200;

/// Hits below this only slow the robot down; at or above it the move is
/// stopped and recovery starts.
const STOP_HITCNT: u32 = 3;

const SLOW_SPEED: u8 = 18;

/// Forward-travel only: count obstacle cells on the direct path toward the
/// next waypoint (capped at the look-ahead distance) and either slow down
/// or abort into recovery.
pub(crate) fn live_check(core: &Core, nav: &mut NavCtl) {
    let Some(wp) = nav.route.get(nav.route_pos).copied() else {
        return;
    };
    if wp.backmode != 0 {
        return;
    }
    let p = core.pose.pose();
    let dist_to_next = p.dist_to(wp.x, wp.y);

    let (target_x, target_y) = if dist_to_next < LOOKAHEAD_MM {
        (wp.x, wp.y)
    } else {
        let ang = ang_to(p.x, p.y, wp.x, wp.y);
        (
            p.x + (LOOKAHEAD_MM as f64 * ang.cos()) as i32,
            p.y + (LOOKAHEAD_MM as f64 * ang.sin()) as i32,
        )
    };

    let hitcnt = core.world.direct_route_hitcnt(p.x, p.y, target_x, target_y);
    if hitcnt < STOP_HITCNT {
        core.speed.clamp_now(SLOW_SPEED, &core.motion);
    } else {
        core.speed.clamp_now(SLOW_SPEED, &core.motion);
        let _ = core.motion.stop_movement();
        nav.recovery.enter();
    }
}
