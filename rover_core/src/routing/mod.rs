//! Route planning: the waypoint buffer, the pluggable planner and the
//! blocking request/response coordinator.

mod coordinator;
mod planner;
mod route;

pub use coordinator::{run, run_search, RouteRequest, RoutingCoordinator};
pub use planner::{GridPlanner, RoutePlanner};
pub use route::{
    build_route, Waypoint, BACKMODE_ROTATE_POSE, ROUTE_MAX, TAKE_NEXT_EARLY_LAST,
    TAKE_NEXT_EARLY_MAX, TAKE_NEXT_EARLY_MIN,
};
