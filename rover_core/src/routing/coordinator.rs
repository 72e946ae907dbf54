//! On-demand route planning, serialized behind a request/response
//! handshake.
//!
//! Exactly one request is in flight at a time: requesters serialize on the
//! routing token and block until the routing worker publishes the verdict.
//! The route buffer itself is replaced atomically under the navigation
//! lock, so readers observe either the old route or the new one.

use crate::core::Core;
use crate::proto::HostReport;
use crate::routing::route::build_route;
use crate::state::InfoState;
use crate::world::page_coords;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRequest {
    pub dest_x: i32,
    pub dest_y: i32,
    /// Skip the last-moment localization pass before planning.
    pub dont_map_lidars: bool,
    /// Prefer clearance over the shortest path.
    pub no_tight: bool,
}

#[derive(Debug, Default)]
struct Slot {
    request: Option<RouteRequest>,
    /// `Some(no_route_found)` once the worker has answered.
    response: Option<bool>,
}

#[derive(Debug, Default)]
pub struct RoutingCoordinator {
    slot: Mutex<Slot>,
    req_cv: Condvar,
    resp_cv: Condvar,
    /// The routing token: serializes requesters against each other.
    token: Mutex<()>,
    last_dest: Mutex<Option<(i32, i32)>>,
}

impl RoutingCoordinator {
    /// Ask for a route and block until the verdict. Returns true when no
    /// route was found.
    pub fn request(&self, req: RouteRequest) -> bool {
        let _token = self.token.lock();
        *self.last_dest.lock() = Some((req.dest_x, req.dest_y));
        let mut slot = self.slot.lock();
        slot.request = Some(req);
        slot.response = None;
        self.req_cv.notify_one();
        while slot.response.is_none() {
            self.resp_cv.wait(&mut slot);
        }
        slot.response.take().unwrap_or(true)
    }

    /// Re-plan to the most recent destination. True when there is none or
    /// no route was found.
    pub fn rerequest(&self) -> bool {
        let dest = *self.last_dest.lock();
        match dest {
            Some((x, y)) => self.request(RouteRequest {
                dest_x: x,
                dest_y: y,
                dont_map_lidars: false,
                no_tight: true,
            }),
            None => true,
        }
    }

    /// Worker-side: wait briefly for a request so the worker keeps polling
    /// its gate between arrivals.
    fn take_request(&self, timeout: Duration) -> Option<RouteRequest> {
        let mut slot = self.slot.lock();
        if slot.request.is_none() {
            let _ = self.req_cv.wait_for(&mut slot, timeout);
        }
        slot.request.take()
    }

    fn publish_response(&self, no_route_found: bool) {
        let mut slot = self.slot.lock();
        slot.response = Some(no_route_found);
        self.resp_cv.notify_all();
    }
}

/// The routing worker loop.
pub fn run(core: std::sync::Arc<Core>) {
    let gate = &core.gates.routing;
    loop {
        gate.set_cancelable(true);
        if gate.yield_point() {
            break;
        }
        let Some(req) = core.routing.take_request(Duration::from_millis(50)) else {
            continue;
        };
        // A search in progress must not be torn down mid-map-update.
        gate.set_cancelable(false);
        let no_route_found = run_search(&core, req);
        core.routing.publish_response(no_route_found);
    }
}

/// Plan from the current pose to the requested destination and publish the
/// outcome. Returns true when no route was found.
pub fn run_search(core: &Core, req: RouteRequest) -> bool {
    core.send_info(InfoState::Think);

    if !req.dont_map_lidars {
        // Last-moment localization from the newest lidar frames, applied at
        // half strength.
        let scans = core.lidar_ring.latest();
        if !scans.is_empty() {
            let (da, dx, dy) = core.world.map_lidars(&scans, false, core.state.mapping_2d());
            let id = core.pose.correct(da / 2, dx / 2, dy / 2);
            let _ = core.motion.correct_robot_pos(da / 2, dx / 2, dy / 2, id);
        }
    }

    let p = core.pose.pose();
    // Both endpoint regions must be resident before planning.
    let (spx, spy, _, _) = page_coords(p.x, p.y);
    let (dpx, dpy, _, _) = page_coords(req.dest_x, req.dest_y);
    core.world.load_region(spx, spy);
    core.world.load_region(dpx, dpy);
    core.world.refresh_routing_pages();

    let planned = core
        .planner
        .plan(&core.world, (p.x, p.y), (req.dest_x, req.dest_y), req.no_tight);

    core.num_reroutes
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let mut nav = core.nav.lock();
    match planned {
        Some(points) if !points.is_empty() => {
            let route = build_route(&points);
            info!(
                "route found: {} waypoints to ({}, {})",
                route.len(),
                req.dest_x,
                req.dest_y
            );
            core.client.send(&HostReport::Route {
                start_x: p.x,
                start_y: p.y,
                points: route.iter().map(|w| (w.x, w.y, w.backmode)).collect(),
            });
            nav.route = route;
            nav.route_pos = 0;
            nav.follow_route = true;
            nav.start_route = true;
            nav.finished_or_notfound = false;
            nav.id_cnt = if nav.id_cnt >= 7 { 1 } else { nav.id_cnt + 1 };
            nav.recovery.reset();
            false
        }
        _ => {
            warn!("no route to ({}, {})", req.dest_x, req.dest_y);
            nav.follow_route = false;
            nav.finished_or_notfound = true;
            drop(nav);
            core.send_info(InfoState::Idle);
            true
        }
    }
}
