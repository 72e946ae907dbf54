//! Route planning over the world's routing pages.
//!
//! The planner is pluggable; the built-in implementation is grid A* on the
//! 40 mm routing raster with corner-point simplification.

use crate::world::{World, CELL_MM};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// What the routing coordinator asks of a planner: a waypoint polyline in
/// world millimeters, `(x, y, backmode)`, excluding the start pose.
pub trait RoutePlanner: Send + Sync {
    fn plan(
        &self,
        world: &World,
        start: (i32, i32),
        dest: (i32, i32),
        no_tight: bool,
    ) -> Option<Vec<(i32, i32, u8)>>;
}

/// A* over the routing raster.
pub struct GridPlanner {
    /// Expansion budget; a search that exhausts it reports no route.
    max_expansions: usize,
}

impl Default for GridPlanner {
    fn default() -> Self {
        Self {
            max_expansions: 200_000,
        }
    }
}

#[derive(Clone, Debug)]
struct SearchNode {
    x: i32,
    y: i32,
    g_cost: f64,
    f_cost: f64,
}

impl Eq for SearchNode {}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.x == other.x && self.y == other.y
    }
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap on f cost.
        other
            .f_cost
            .partial_cmp(&self.f_cost)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

const NEIGHBORS: [(i32, i32, f64); 8] = [
    (1, 0, 1.0),
    (-1, 0, 1.0),
    (0, 1, 1.0),
    (0, -1, 1.0),
    (1, 1, std::f64::consts::SQRT_2),
    (1, -1, std::f64::consts::SQRT_2),
    (-1, 1, std::f64::consts::SQRT_2),
    (-1, -1, std::f64::consts::SQRT_2),
];

impl GridPlanner {
    fn blocked(world: &World, cx: i32, cy: i32, no_tight: bool) -> bool {
        let x = cx * CELL_MM + CELL_MM / 2;
        let y = cy * CELL_MM + CELL_MM / 2;
        if world.routing_blocked_mm(x, y) {
            return true;
        }
        if no_tight {
            // Keep an extra cell of clearance when asked to avoid tight
            // passages.
            for (dx, dy, _) in NEIGHBORS {
                if world.routing_blocked_mm(x + dx * CELL_MM, y + dy * CELL_MM) {
                    return true;
                }
            }
        }
        false
    }

    /// The robot may be standing inside the dilated blocked band; pick the
    /// nearest free cell within a short radius to anchor the search.
    fn nearest_free(world: &World, cx: i32, cy: i32, no_tight: bool) -> Option<(i32, i32)> {
        for r in 0i32..=10 {
            for dy in -r..=r {
                for dx in -r..=r {
                    if dx.abs().max(dy.abs()) != r {
                        continue;
                    }
                    if !Self::blocked(world, cx + dx, cy + dy, no_tight) {
                        return Some((cx + dx, cy + dy));
                    }
                }
            }
        }
        None
    }

    fn heuristic(ax: i32, ay: i32, bx: i32, by: i32) -> f64 {
        let dx = (ax - bx).abs() as f64;
        let dy = (ay - by).abs() as f64;
        // Octile distance.
        dx.max(dy) + (std::f64::consts::SQRT_2 - 1.0) * dx.min(dy)
    }

    /// Drop intermediate cells along straight runs, keeping corner points.
    fn simplify(path: &[(i32, i32)]) -> Vec<(i32, i32)> {
        if path.len() <= 2 {
            return path.to_vec();
        }
        let mut out = vec![path[0]];
        for i in 1..path.len() - 1 {
            let (ax, ay) = path[i - 1];
            let (bx, by) = path[i];
            let (cx, cy) = path[i + 1];
            let colinear = (bx - ax, by - ay) == (cx - bx, cy - by);
            if !colinear {
                out.push(path[i]);
            }
        }
        out.push(*path.last().unwrap());
        out
    }
}

impl RoutePlanner for GridPlanner {
    fn plan(
        &self,
        world: &World,
        start: (i32, i32),
        dest: (i32, i32),
        no_tight: bool,
    ) -> Option<Vec<(i32, i32, u8)>> {
        let scell = (start.0.div_euclid(CELL_MM), start.1.div_euclid(CELL_MM));
        let dcell = (dest.0.div_euclid(CELL_MM), dest.1.div_euclid(CELL_MM));
        let (sx, sy) = Self::nearest_free(world, scell.0, scell.1, no_tight)?;
        let (gx, gy) = Self::nearest_free(world, dcell.0, dcell.1, no_tight)?;

        let mut open = BinaryHeap::new();
        let mut came_from: HashMap<(i32, i32), (i32, i32)> = HashMap::new();
        let mut g_costs: HashMap<(i32, i32), f64> = HashMap::new();
        let mut closed: HashSet<(i32, i32)> = HashSet::new();

        g_costs.insert((sx, sy), 0.0);
        open.push(SearchNode {
            x: sx,
            y: sy,
            g_cost: 0.0,
            f_cost: Self::heuristic(sx, sy, gx, gy),
        });

        let mut expansions = 0;
        while let Some(node) = open.pop() {
            if closed.contains(&(node.x, node.y)) {
                continue;
            }
            closed.insert((node.x, node.y));

            if (node.x, node.y) == (gx, gy) {
                // Walk back to the start, then forward again.
                let mut cells = vec![(gx, gy)];
                let mut cur = (gx, gy);
                while let Some(&prev) = came_from.get(&cur) {
                    cells.push(prev);
                    cur = prev;
                }
                cells.reverse();
                let simplified = Self::simplify(&cells);
                let mut points: Vec<(i32, i32, u8)> = simplified
                    .iter()
                    .skip(1)
                    .map(|&(cx, cy)| (cx * CELL_MM + CELL_MM / 2, cy * CELL_MM + CELL_MM / 2, 0))
                    .collect();
                // Land exactly on the requested destination.
                if let Some(last) = points.last_mut() {
                    *last = (dest.0, dest.1, 0);
                } else {
                    points.push((dest.0, dest.1, 0));
                }
                return Some(points);
            }

            expansions += 1;
            if expansions > self.max_expansions {
                return None;
            }

            for (dx, dy, cost) in NEIGHBORS {
                let nx = node.x + dx;
                let ny = node.y + dy;
                if closed.contains(&(nx, ny)) || Self::blocked(world, nx, ny, no_tight) {
                    continue;
                }
                let tentative = node.g_cost + cost;
                if tentative < *g_costs.get(&(nx, ny)).unwrap_or(&f64::INFINITY) {
                    g_costs.insert((nx, ny), tentative);
                    came_from.insert((nx, ny), (node.x, node.y));
                    open.push(SearchNode {
                        x: nx,
                        y: ny,
                        g_cost: tentative,
                        f_cost: tentative + Self::heuristic(nx, ny, gx, gy),
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::SonarPoint;

    fn open_world() -> (tempfile::TempDir, World) {
        let dir = tempfile::tempdir().unwrap();
        let w = World::new(dir.path().to_path_buf());
        w.load_region(0, 0);
        (dir, w)
    }

    fn refresh(w: &World) {
        for py in -1..=1 {
            for px in -1..=1 {
                w.gen_routing_page(px, py, true);
            }
        }
    }

    #[test]
    fn straight_line_route() {
        let (_dir, w) = open_world();
        refresh(&w);
        let planner = GridPlanner::default();
        let route = planner.plan(&w, (0, 0), (3000, 0), false).unwrap();
        assert!(!route.is_empty());
        assert_eq!(route.last().unwrap().0, 3000);
        assert_eq!(route.last().unwrap().1, 0);
    }

    #[test]
    fn routes_around_wall() {
        let (_dir, w) = open_world();
        // Wall at x = 1500 spanning y in [-1200, 1200].
        for y in (-1200..=1200).step_by(40) {
            w.map_sonar(SonarPoint {
                corr_id: 0,
                x: 1500,
                y,
            });
        }
        refresh(&w);
        let planner = GridPlanner::default();
        let route = planner.plan(&w, (0, 0), (3000, 0), false).unwrap();
        // The route must detour beyond the wall ends.
        let max_abs_y = route.iter().map(|p| p.1.abs()).max().unwrap();
        assert!(max_abs_y > 1200, "route should detour, got max |y| = {max_abs_y}");
    }

    #[test]
    fn fully_walled_goal_is_unreachable() {
        let (_dir, w) = open_world();
        // Box the goal in.
        for d in (-800..=800).step_by(40) {
            for &(x, y) in &[(2000 + d, 1200), (2000 + d, -1200), (800, d), (3200, d)] {
                w.map_sonar(SonarPoint { corr_id: 0, x, y });
            }
        }
        refresh(&w);
        let planner = GridPlanner::default();
        assert!(planner.plan(&w, (0, 0), (2000, 0), false).is_none());
    }
}
