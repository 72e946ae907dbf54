//! Paged occupancy world: fixed-size pages, residency management,
//! scan-matching updates and the geometry queries navigation relies on.

mod page;
mod store;

pub use page::{MapPage, CELL_MM, PAGE_CELLS, PAGE_MM};
pub use store::{
    page_coords, World, RESIDENT_RADIUS, ROBOT_CORRIDOR_HALF_MM, ROBOT_TURN_RADIUS_MM,
};
