//! The paged world map behind reader-writer protection.

use super::page::{MapPage, CELL_MM, PAGE_MM};
use crate::error::RoverResult;
use crate::geom::{ang32_to_rad, dist_mm};
use crate::pose::Pose;
use crate::sensors::{LidarScan, SonarPoint, TofFrame};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pages within this chebyshev distance of the robot's page stay resident.
pub const RESIDENT_RADIUS: i32 = 2;

/// Physical robot envelope, used by the line-of-sight corridor and turn
/// checks.
pub const ROBOT_CORRIDOR_HALF_MM: i32 = 240;
pub const ROBOT_TURN_RADIUS_MM: i32 = 340;
const ROBOT_CLEAR_RADIUS_MM: i32 = 300;

/// Routing dilation in cells (~240 mm), applied when routing pages are
/// regenerated.
const ROUTING_DILATE_CELLS: i32 = 6;

/// Convert a millimeter coordinate to `(page, offset-in-page)` indices.
pub fn page_coords(x_mm: i32, y_mm: i32) -> (i32, i32, i32, i32) {
    let px = x_mm.div_euclid(PAGE_MM);
    let py = y_mm.div_euclid(PAGE_MM);
    let ox = x_mm.rem_euclid(PAGE_MM) / CELL_MM;
    let oy = y_mm.rem_euclid(PAGE_MM) / CELL_MM;
    (px, py, ox, oy)
}

#[derive(Debug, Default)]
struct Store {
    pages: HashMap<(i32, i32), MapPage>,
}

impl Store {
    fn page_mut(&mut self, px: i32, py: i32) -> &mut MapPage {
        self.pages.entry((px, py)).or_default()
    }

    fn cell_blocked(&self, x_mm: i32, y_mm: i32) -> bool {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        match self.pages.get(&(px, py)) {
            Some(p) => p.is_blocked(ox, oy),
            None => false,
        }
    }

    fn cell_seen(&self, x_mm: i32, y_mm: i32) -> Option<bool> {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.pages.get(&(px, py)).map(|p| p.is_seen(ox, oy))
    }

    fn mark_occupied_mm(&mut self, x_mm: i32, y_mm: i32) {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.page_mut(px, py).mark_occupied(ox, oy);
    }

    fn mark_free_mm(&mut self, x_mm: i32, y_mm: i32) {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.page_mut(px, py).mark_free(ox, oy);
    }

    /// Score one candidate correction against the current map.
    fn score_candidate(&self, scans: &[Arc<LidarScan>], da: i32, dx: i32, dy: i32) -> i64 {
        let mut score = 0i64;
        for scan in scans {
            let ang = ang32_to_rad(scan.robot_pose.ang.wrapping_add(da));
            let (sin, cos) = ang.sin_cos();
            let rx = scan.robot_pose.x + dx;
            let ry = scan.robot_pose.y + dy;
            for &(lpx, lpy) in scan.points.iter().step_by(3) {
                let wx = rx + (lpx as f64 * cos - lpy as f64 * sin) as i32;
                let wy = ry + (lpx as f64 * sin + lpy as f64 * cos) as i32;
                let (px, py, ox, oy) = page_coords(wx, wy);
                if let Some(page) = self.pages.get(&(px, py)) {
                    if page.is_occupied(ox, oy) {
                        score += 2;
                    } else if page.is_seen(ox, oy) {
                        score -= 1;
                    }
                }
            }
        }
        score
    }

    /// Plot a corrected scan into the occupancy planes: pass-through cells
    /// as free, the endpoint as a wall.
    fn insert_scan(&mut self, scan: &LidarScan, da: i32, dx: i32, dy: i32) {
        let ang = ang32_to_rad(scan.robot_pose.ang.wrapping_add(da));
        let (sin, cos) = ang.sin_cos();
        let rx = scan.robot_pose.x + dx;
        let ry = scan.robot_pose.y + dy;
        for &(lpx, lpy) in &scan.points {
            let wx = rx + (lpx as f64 * cos - lpy as f64 * sin) as i32;
            let wy = ry + (lpx as f64 * sin + lpy as f64 * cos) as i32;
            let len = dist_mm(rx, ry, wx, wy);
            let steps = (len / CELL_MM).max(1);
            for s in 0..steps {
                let fx = rx + (wx - rx) / steps * s;
                let fy = ry + (wy - ry) / steps * s;
                self.mark_free_mm(fx, fy);
            }
            self.mark_occupied_mm(wx, wy);
        }
    }
}

/// The world map. All access goes through this handle; reads take the
/// shared lock, mutations the exclusive one.
#[derive(Debug)]
pub struct World {
    store: RwLock<Store>,
    page_dir: PathBuf,
}

impl World {
    pub fn new(page_dir: PathBuf) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            page_dir,
        }
    }

    pub fn resident_page_count(&self) -> usize {
        self.store.read().pages.len()
    }

    /// Make the 5x5 page window around `(px, py)` resident, loading from
    /// disk where a page exists and creating blank pages elsewhere.
    /// Idempotent.
    pub fn load_region(&self, px: i32, py: i32) {
        let mut store = self.store.write();
        for iy in -RESIDENT_RADIUS..=RESIDENT_RADIUS {
            for ix in -RESIDENT_RADIUS..=RESIDENT_RADIUS {
                let key = (px + ix, py + iy);
                if store.pages.contains_key(&key) {
                    continue;
                }
                match MapPage::load(&self.page_dir, key.0, key.1) {
                    Ok(Some(page)) => {
                        store.pages.insert(key, page);
                    }
                    Ok(None) => {
                        store.pages.insert(key, MapPage::default());
                    }
                    Err(e) => {
                        warn!("map page ({}, {}) load failed: {e}", key.0, key.1);
                        store.pages.insert(key, MapPage::default());
                    }
                }
            }
        }
    }

    /// Sync and free pages outside the 5x5 window around `(px, py)`.
    pub fn unload_far(&self, px: i32, py: i32) {
        let mut store = self.store.write();
        let far: Vec<(i32, i32)> = store
            .pages
            .keys()
            .filter(|(kx, ky)| {
                (kx - px).abs() > RESIDENT_RADIUS || (ky - py).abs() > RESIDENT_RADIUS
            })
            .copied()
            .collect();
        for key in far {
            if let Some(mut page) = store.pages.remove(&key) {
                if page.is_dirty() {
                    if let Err(e) = page.save(&self.page_dir, key.0, key.1) {
                        warn!("map page ({}, {}) sync failed: {e}", key.0, key.1);
                    }
                }
                debug!("unloaded far map page ({}, {})", key.0, key.1);
            }
        }
    }

    /// Write all dirty resident pages to disk. Returns true when anything
    /// changed on disk.
    pub fn sync_pages(&self) -> RoverResult<bool> {
        let mut store = self.store.write();
        let mut wrote = false;
        let keys: Vec<(i32, i32)> = store.pages.keys().copied().collect();
        for key in keys {
            let page = store.pages.get_mut(&key).expect("resident page");
            if page.is_dirty() {
                page.save(&self.page_dir, key.0, key.1)?;
                wrote = true;
            }
        }
        Ok(wrote)
    }

    /// Scan-match the given lidar scans against the map and return the best
    /// correction `(da, dx, dy)`. When `insert` is set the scans are also
    /// plotted into the map at their corrected poses.
    pub fn map_lidars(
        &self,
        scans: &[Arc<LidarScan>],
        big_search: bool,
        insert: bool,
    ) -> (i32, i32, i32) {
        if scans.is_empty() {
            return (0, 0, 0);
        }
        let mut store = self.store.write();

        let (ang_win_deg, ang_step_deg, xy_win, xy_step) = if big_search {
            (12.0, 2.0, 400, 80)
        } else {
            (2.0, 0.5, 120, 40)
        };

        let mut best = (0i32, 0i32, 0i32);
        let mut best_score = store.score_candidate(scans, 0, 0, 0);

        let ang_steps = (ang_win_deg / ang_step_deg) as i32;
        for ai in -ang_steps..=ang_steps {
            let da = (ai as f64 * ang_step_deg * crate::geom::ANG_1_DEG as f64) as i32;
            for dx in (-xy_win..=xy_win).step_by(xy_step as usize) {
                for dy in (-xy_win..=xy_win).step_by(xy_step as usize) {
                    let score = store.score_candidate(scans, da, dx, dy);
                    if score > best_score {
                        best_score = score;
                        best = (da, dx, dy);
                    }
                }
            }
        }

        if insert {
            for scan in scans {
                store.insert_scan(scan, best.0, best.1, best.2);
            }
        }

        if best != (0, 0, 0) {
            info!(
                "scan match correction da={} dx={} dy={} (score {best_score})",
                best.0, best.1, best.2
            );
        }
        best
    }

    /// Project a batch of 3D-ToF frames into the obstacle plane. Returns the
    /// center of the batch in world millimeters.
    pub fn map_3dtof(&self, batch: &[TofFrame]) -> (i32, i32) {
        if batch.is_empty() {
            return (0, 0);
        }
        let mut store = self.store.write();
        let mut sum_x = 0i64;
        let mut sum_y = 0i64;
        for frame in batch {
            sum_x += frame.robot_pose.x as i64;
            sum_y += frame.robot_pose.y as i64;
            let ang = ang32_to_rad(frame.robot_pose.ang);
            let (sin, cos) = ang.sin_cos();
            for &(opx, opy) in &frame.obstacles {
                let wx = frame.robot_pose.x + (opx as f64 * cos - opy as f64 * sin) as i32;
                let wy = frame.robot_pose.y + (opx as f64 * sin + opy as f64 * cos) as i32;
                let (px, py, ox, oy) = page_coords(wx, wy);
                store.page_mut(px, py).add_obst3d(ox, oy);
            }
        }
        (
            (sum_x / batch.len() as i64) as i32,
            (sum_y / batch.len() as i64) as i32,
        )
    }

    /// Insert one sonar echo as weak occupancy evidence.
    pub fn map_sonar(&self, p: SonarPoint) {
        let mut store = self.store.write();
        store.mark_occupied_mm(p.x, p.y);
    }

    /// Record a collision reported by the feedback module: mark a small
    /// obstacle patch just outside the robot outline, in the direction of
    /// impact.
    pub fn map_collision_obstacle(
        &self,
        ang: i32,
        x: i32,
        y: i32,
        reason: u32,
        xcel_valid: bool,
        xcel_ang_rad: f32,
    ) {
        let dir = if xcel_valid {
            xcel_ang_rad as f64
        } else {
            ang32_to_rad(ang)
        };
        let cx = x + ((ROBOT_CLEAR_RADIUS_MM + CELL_MM) as f64 * dir.cos()) as i32;
        let cy = y + ((ROBOT_CLEAR_RADIUS_MM + CELL_MM) as f64 * dir.sin()) as i32;
        debug!("collision obstacle at ({cx}, {cy}), reason {reason}");
        let mut store = self.store.write();
        for iy in -1..=1 {
            for ix in -1..=1 {
                let (px, py, ox, oy) = page_coords(cx + ix * CELL_MM, cy + iy * CELL_MM);
                store.page_mut(px, py).mark_collision(ox, oy);
            }
        }
    }

    /// Clear all obstacle evidence under the robot outline.
    pub fn clear_within_robot(&self, pose: Pose) {
        let mut store = self.store.write();
        let r = ROBOT_CLEAR_RADIUS_MM;
        let mut y = -r;
        while y <= r {
            let mut x = -r;
            while x <= r {
                if x * x + y * y <= r * r {
                    let (px, py, ox, oy) = page_coords(pose.x + x, pose.y + y);
                    store.page_mut(px, py).clear_obstacles(ox, oy);
                }
                x += CELL_MM;
            }
            y += CELL_MM;
        }
    }

    pub fn add_constraint(&self, x_mm: i32, y_mm: i32) {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.store.write().page_mut(px, py).set_constraint(ox, oy, true);
    }

    pub fn remove_constraint(&self, x_mm: i32, y_mm: i32) {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.store.write().page_mut(px, py).set_constraint(ox, oy, false);
    }

    pub fn has_constraint(&self, x_mm: i32, y_mm: i32) -> bool {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        self.store
            .read()
            .pages
            .get(&(px, py))
            .map(|p| p.is_constraint(ox, oy))
            .unwrap_or(false)
    }

    /// Regenerate the routing bitset of one page. With `force` unset the
    /// page is only regenerated when its routing data is stale.
    pub fn gen_routing_page(&self, px: i32, py: i32, force: bool) {
        let mut store = self.store.write();
        let page = store.page_mut(px, py);
        if force || !page.routing_valid() {
            page.regen_routing(ROUTING_DILATE_CELLS);
        }
    }

    /// Regenerate every resident page whose routing bitset is stale, so a
    /// following planner run sees current obstacle data everywhere.
    pub fn refresh_routing_pages(&self) {
        let mut store = self.store.write();
        for page in store.pages.values_mut() {
            if !page.routing_valid() {
                page.regen_routing(ROUTING_DILATE_CELLS);
            }
        }
    }

    /// Regenerate the 3x3 routing pages around a world point, as required
    /// after obstacle updates while a route is active.
    pub fn gen_routing_pages_around(&self, x_mm: i32, y_mm: i32) {
        let (px, py, _, _) = page_coords(x_mm, y_mm);
        for iy in -1..=1 {
            for ix in -1..=1 {
                self.gen_routing_page(px + ix, py + iy, true);
            }
        }
    }

    /// Routing query: is this cell blocked for route planning? Cells of
    /// non-resident pages are blocked; unexplored cells of resident pages
    /// are traversable.
    pub fn routing_blocked_mm(&self, x_mm: i32, y_mm: i32) -> bool {
        let (px, py, ox, oy) = page_coords(x_mm, y_mm);
        match self.store.read().pages.get(&(px, py)) {
            Some(p) => p.is_routing_blocked(ox, oy),
            None => true,
        }
    }

    /// Count obstacle hits along the straight corridor from `(fx, fy)` to
    /// `(tx, ty)`, robot width included.
    pub fn direct_route_hitcnt(&self, fx: i32, fy: i32, tx: i32, ty: i32) -> u32 {
        let store = self.store.read();
        let len = dist_mm(fx, fy, tx, ty);
        if len == 0 {
            return 0;
        }
        let dir = ((ty - fy) as f64).atan2((tx - fx) as f64);
        let (sin, cos) = dir.sin_cos();
        let mut hits = 0;
        let steps = (len / CELL_MM).max(1);
        for s in 0..=steps {
            let cx = fx + (tx - fx) / steps * s;
            let cy = fy + (ty - fy) / steps * s;
            let mut hit_here = false;
            let mut w = -ROBOT_CORRIDOR_HALF_MM;
            while w <= ROBOT_CORRIDOR_HALF_MM {
                let sx = cx - (w as f64 * sin) as i32;
                let sy = cy + (w as f64 * cos) as i32;
                if store.cell_blocked(sx, sy) {
                    hit_here = true;
                    break;
                }
                w += CELL_MM * 2;
            }
            if hit_here {
                hits += 1;
            }
        }
        hits
    }

    /// Straight-line reachability without turning first.
    pub fn check_direct_route_non_turning(&self, fx: i32, fy: i32, tx: i32, ty: i32) -> bool {
        self.direct_route_hitcnt(fx, fy, tx, ty) == 0
    }

    /// Can the robot turn in place at `(x, y)`? Checks the swept circle.
    pub fn test_robot_turn(&self, x: i32, y: i32, _from_ang: i32, _to_ang_rad: f64) -> bool {
        let store = self.store.read();
        let r = ROBOT_TURN_RADIUS_MM;
        let mut dy = -r;
        while dy <= r {
            let mut dx = -r;
            while dx <= r {
                if dx * dx + dy * dy <= r * r && store.cell_blocked(x + dx, y + dy) {
                    return false;
                }
                dx += CELL_MM;
            }
            dy += CELL_MM;
        }
        true
    }

    /// Full reachability: turn toward the target, then drive the corridor.
    pub fn check_direct_route(&self, cur_ang: i32, fx: i32, fy: i32, tx: i32, ty: i32) -> bool {
        let target_ang = ((ty - fy) as f64).atan2((tx - fx) as f64);
        self.test_robot_turn(fx, fy, cur_ang, target_ang)
            && self.check_direct_route_non_turning(fx, fy, tx, ty)
    }

    /// Nearest reachable cell adjacent to unexplored space, for autonomous
    /// exploration. Returns world millimeters.
    pub fn find_frontier(&self, x_mm: i32, y_mm: i32, max_radius_mm: i32) -> Option<(i32, i32)> {
        let store = self.store.read();
        let step = CELL_MM * 2;
        let mut ring = step;
        while ring <= max_radius_mm {
            let circumference = 2.0 * std::f64::consts::PI * ring as f64;
            let n = (circumference / step as f64).max(8.0) as i32;
            for i in 0..n {
                let a = i as f64 / n as f64 * 2.0 * std::f64::consts::PI;
                let cx = x_mm + (ring as f64 * a.cos()) as i32;
                let cy = y_mm + (ring as f64 * a.sin()) as i32;
                let here = store.cell_seen(cx, cy);
                if here == Some(true) && !store.cell_blocked(cx, cy) {
                    // Any unexplored neighbor makes this a frontier cell.
                    let neigh_unseen = [(step, 0), (-step, 0), (0, step), (0, -step)]
                        .iter()
                        .any(|&(dx, dy)| store.cell_seen(cx + dx, cy + dy) == Some(false));
                    if neigh_unseen && ring >= 600 {
                        return Some((cx, cy));
                    }
                }
            }
            ring += step * 4;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> (tempfile::TempDir, World) {
        let dir = tempfile::tempdir().unwrap();
        let w = World::new(dir.path().to_path_buf());
        (dir, w)
    }

    #[test]
    fn residency_window() {
        let (_dir, w) = world();
        w.load_region(0, 0);
        assert_eq!(w.resident_page_count(), 25);
        // Idempotent.
        w.load_region(0, 0);
        assert_eq!(w.resident_page_count(), 25);
        // Moving two pages over loads new ones, unloading frees the far set.
        w.load_region(4, 0);
        assert!(w.resident_page_count() > 25);
        w.unload_far(4, 0);
        assert_eq!(w.resident_page_count(), 25);
    }

    #[test]
    fn constraints_add_remove() {
        let (_dir, w) = world();
        w.load_region(0, 0);
        w.add_constraint(1000, 1000);
        assert!(w.has_constraint(1000, 1000));
        w.remove_constraint(1000, 1000);
        assert!(!w.has_constraint(1000, 1000));
    }

    #[test]
    fn corridor_hit_counting() {
        let (_dir, w) = world();
        w.load_region(0, 0);
        assert!(w.check_direct_route_non_turning(0, 0, 2000, 0));
        // A wall across the corridor midway.
        for y in (-400..=400).step_by(40) {
            w.map_sonar(SonarPoint {
                corr_id: 0,
                x: 1000,
                y,
            });
        }
        assert!(w.direct_route_hitcnt(0, 0, 2000, 0) > 0);
        assert!(!w.check_direct_route_non_turning(0, 0, 2000, 0));
    }

    #[test]
    fn clear_within_robot_removes_evidence() {
        let (_dir, w) = world();
        w.load_region(0, 0);
        w.map_sonar(SonarPoint {
            corr_id: 0,
            x: 100,
            y: 0,
        });
        w.clear_within_robot(Pose::new(0, 0, 0));
        assert!(w.check_direct_route_non_turning(0, 0, 200, 0));
    }

    #[test]
    fn scan_match_zero_on_empty_map() {
        let (_dir, w) = world();
        w.load_region(0, 0);
        let scan = Arc::new(LidarScan {
            corr_id: 1,
            robot_pose: Pose::default(),
            points: vec![(1000, 0), (0, 1000), (-1000, 0)],
            significant: true,
            distorted: false,
        });
        let (da, dx, dy) = w.map_lidars(&[scan], false, true);
        assert_eq!((da, dx, dy), (0, 0, 0));
        // The inserted scan leaves walls behind.
        assert!(!w.check_direct_route_non_turning(0, 0, 1400, 0));
    }
}
