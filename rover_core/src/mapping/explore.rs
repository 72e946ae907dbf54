//! Minimal autonomous exploration: when the robot is idle and in
//! autonomous command, chase the nearest frontier through the routing
//! coordinator.

use crate::core::Core;
use crate::routing::RouteRequest;
use crate::state::CommandSource;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const ATTEMPT_INTERVAL: Duration = Duration::from_secs(5);
const FRONTIER_RADIUS_MM: i32 = 12_000;

pub fn tick(core: &Core) {
    if core.state.command_source() != CommandSource::Autonomous || !core.explorer.is_active() {
        return;
    }
    {
        let nav = core.nav.lock();
        if nav.follow_route || nav.start_route || nav.recovery.is_active() || nav.charger.is_active()
        {
            return;
        }
    }
    {
        let mut last = core.explorer.last_attempt.lock();
        if last.elapsed() < ATTEMPT_INTERVAL {
            return;
        }
        *last = Instant::now();
    }

    let p = core.pose.pose();
    match core.world.find_frontier(p.x, p.y, FRONTIER_RADIUS_MM) {
        Some((fx, fy)) => {
            info!("exploring toward frontier ({fx}, {fy})");
            let _ = core.routing.request(RouteRequest {
                dest_x: fx,
                dest_y: fy,
                dont_map_lidars: false,
                no_tight: true,
            });
        }
        None => debug!("no frontier within reach"),
    }
}
