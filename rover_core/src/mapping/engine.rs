//! The mapping worker: sensor ingest, scan-matching pose correction,
//! adaptive speed limiting and periodic map maintenance.

use crate::core::Core;
use crate::geom::ang32_to_rad;
use crate::mapping::explore;
use crate::pose::Pose;
use crate::proto::HostReport;
use crate::sensors::{LidarScan, TofFrame};
use crate::state::CommandSource;
use crate::world::page_coords;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stale-id lidar frames tolerated before the correction id is forcibly
/// advanced to unstick the pipeline.
const LIDAR_IGNORE_LIMIT: u32 = 20;

/// ToF batch sizes: flush early while moving, accumulate when parked.
const TOF_BATCH_MOVING: usize = 3;
const TOF_BATCH_STATIC: usize = 20;

/// MCU keepalive cadence in loop iterations while keep-position is on.
const KEEPALIVE_ITERATIONS: u32 = 500;

struct Engine {
    tof_batch: Vec<TofFrame>,
    tof_levels: [i32; 3],
    prev_tof_pose: Pose,
    lidar_queue: Vec<Arc<LidarScan>>,
    lidar_ignore_cnt: u32,
    lidar_send_cnt: u32,
    pos_send_cnt: u32,
    hmap_send_cnt: u32,
    pointcloud_cnt: u32,
    prev_keep_position: bool,
    prev_autonomous: bool,
    keepalive_cnt: u32,
    last_sync: Instant,
}

impl Engine {
    fn new() -> Self {
        Self {
            tof_batch: Vec::new(),
            tof_levels: [0; 3],
            prev_tof_pose: Pose::default(),
            lidar_queue: Vec::new(),
            lidar_ignore_cnt: 0,
            lidar_send_cnt: 0,
            pos_send_cnt: 0,
            hmap_send_cnt: 0,
            pointcloud_cnt: 0,
            prev_keep_position: true,
            prev_autonomous: false,
            keepalive_cnt: 0,
            last_sync: Instant::now(),
        }
    }

    fn iterate(&mut self, core: &Core) {
        explore::tick(core);

        core.speed.tof_adjust(self.tof_levels, &core.motion);

        if let Some(frame) = core.sensors_rx.try_tof() {
            self.handle_tof(core, frame);
        }
        if let Some(scan) = core.sensors_rx.try_lidar() {
            self.handle_lidar(core, scan);
        }
        if let Some(p) = core.sensors_rx.try_sonar() {
            core.client.send(&HostReport::Sonar { x: p.x, y: p.y });
            if core.state.mapping_2d() {
                core.world.map_sonar(p);
            }
        }

        self.periodic_sync(core);
        self.state_edges(core);
    }

    fn handle_tof(&mut self, core: &Core, frame: TofFrame) {
        self.tof_levels = frame.obstacle_levels;

        self.hmap_send_cnt += 1;
        if self.hmap_send_cnt >= 4 {
            self.hmap_send_cnt = 0;
            if core.client.is_connected() {
                core.client.send(&HostReport::Hmap {
                    robot_x: frame.robot_pose.x,
                    robot_y: frame.robot_pose.y,
                    obstacles: frame.obstacles.clone(),
                });
            }
            if core.pointcloud_mode.load(Ordering::Relaxed) != 0 {
                self.save_pointcloud(core, &frame);
            }
        }

        // Frames captured right after a pose reset are dropped.
        let pending_flush = core.flush_tof.load(Ordering::Relaxed);
        if pending_flush > 0 {
            core.flush_tof.store(pending_flush - 1, Ordering::Relaxed);
            return;
        }
        if frame.corr_id != core.pose.corr_id() {
            return;
        }

        let pw = core.motion.power_status();
        if !core.state.mapping_3d() || pw.charging || pw.charged {
            return;
        }
        if frame.robot_pose == Pose::default() {
            // The MCU has not produced a pose yet.
            return;
        }

        let moving = frame.robot_pose != self.prev_tof_pose;
        self.prev_tof_pose = frame.robot_pose;
        self.tof_batch.push(frame);

        let flush_at = if moving {
            TOF_BATCH_MOVING
        } else {
            TOF_BATCH_STATIC
        };
        if self.tof_batch.len() >= flush_at {
            let (mid_x, mid_y) = core.world.map_3dtof(&self.tof_batch);
            self.tof_batch.clear();
            if core.nav.lock().follow_route {
                // The map changed under an active route.
                core.world.gen_routing_pages_around(mid_x, mid_y);
            }
        }
    }

    fn handle_lidar(&mut self, core: &Core, scan: Arc<LidarScan>) {
        self.lidar_send_cnt += 1;
        if self.lidar_send_cnt > 3 {
            self.lidar_send_cnt = 0;
            if core.client.is_connected() {
                core.client.send(&HostReport::LidarLowres {
                    robot_x: scan.robot_pose.x,
                    robot_y: scan.robot_pose.y,
                    points: scan.points.iter().step_by(4).copied().collect(),
                });
            }
        }

        if scan.corr_id != core.pose.corr_id() {
            self.lidar_ignore_cnt += 1;
            if self.lidar_ignore_cnt > LIDAR_IGNORE_LIMIT {
                self.lidar_ignore_cnt = 0;
                warn!("lidar correction id stuck, forcing an id advance");
                let id = core.pose.correct(0, 0, 0);
                let _ = core.motion.correct_robot_pos(0, 0, 0, id);
            }
            return;
        }
        self.lidar_ignore_cnt = 0;
        core.lidar_ignore_over.store(true, Ordering::Relaxed);

        self.pos_send_cnt += 1;
        if self.pos_send_cnt > 2 {
            self.pos_send_cnt = 0;
            let p = core.pose.pose();
            core.client.send(&HostReport::Pos {
                ang16: (p.ang >> 16) as i16,
                x: p.x,
                y: p.y,
            });
        }

        let (px, py, _, _) = page_coords(scan.robot_pose.x, scan.robot_pose.y);
        core.world.load_region(px, py);

        if core.state.mapping_collisions() {
            core.world.clear_within_robot(scan.robot_pose);
        }

        core.lidar_ring.push(scan.clone());

        if !scan.significant {
            return;
        }

        if scan.distorted {
            if self.lidar_queue.len() < 3 {
                info!("distorted scan with a near-empty queue, resetting the queue");
                self.lidar_queue.clear();
            } else {
                info!("distorted scan, matching the queued scans early");
                self.run_scan_match(core, 3);
            }
            return;
        }

        self.lidar_queue.push(scan);
        let big = core.state.big_search_area() != 0;
        let good_time = core.good_lidar_time.load(Ordering::Relaxed);
        let trigger = if big {
            self.lidar_queue.len() > 11
        } else {
            (good_time && self.lidar_queue.len() > 3) || self.lidar_queue.len() > 4
        };
        if trigger {
            if good_time {
                core.good_lidar_time.store(false, Ordering::Relaxed);
            }
            self.run_scan_match(core, if big { 1 } else { 2 });
        }
    }

    /// Match the queued scans, apply the correction damped by `divisor`,
    /// publish the new id and clear the queue.
    fn run_scan_match(&mut self, core: &Core, divisor: i32) {
        let loca = core.state.loca_2d();
        let insert = core.state.mapping_2d();
        if !loca && !insert {
            self.lidar_queue.clear();
            return;
        }
        let big = core.state.big_search_area() != 0;
        let (da, dx, dy) = core.world.map_lidars(&self.lidar_queue, big, insert);
        self.lidar_queue.clear();

        let (da, dx, dy) = if loca {
            (da / divisor, dx / divisor, dy / divisor)
        } else {
            (0, 0, 0)
        };
        let id = core.pose.correct(da, dx, dy);
        let _ = core.motion.correct_robot_pos(da, dx, dy, id);
        core.client
            .send(&HostReport::LocalizationResult { da, dx, dy });
    }

    fn periodic_sync(&mut self, core: &Core) {
        let interval = if core.client.is_connected() {
            Duration::from_secs(7)
        } else {
            Duration::from_secs(30)
        };
        if self.last_sync.elapsed() < interval {
            return;
        }
        self.last_sync = Instant::now();

        let p = core.pose.pose();
        let (px, py, _, _) = page_coords(p.x, p.y);
        core.world.unload_far(px, py);
        match core.world.sync_pages() {
            Ok(true) => core.client.send(&HostReport::SyncRequest),
            Ok(false) => {}
            Err(e) => warn!("map page sync failed: {e}"),
        }
        if core.client.is_connected() {
            let pw = core.motion.power_status();
            core.client.send(&HostReport::Battery {
                charging: pw.charging,
                charged: pw.charged,
                battery_mv: pw.battery_mv,
                battery_percent: pw.battery_percent,
            });
            core.client
                .send(&HostReport::StateVect(core.state.snapshot()));
        }
    }

    fn state_edges(&mut self, core: &Core) {
        let keep = core.state.keep_position();
        if !keep && self.prev_keep_position {
            let _ = core.motion.release_motors();
        }
        self.prev_keep_position = keep;

        let autonomous = core.state.command_source() == CommandSource::Autonomous;
        if autonomous && !self.prev_autonomous {
            info!("switching to autonomous exploration");
            let _ = core.motion.daiju_mode(false);
            core.explorer.start();
            core.state.set_all_mapping_loca(true);
        }
        if !autonomous && self.prev_autonomous {
            core.explorer.stop();
        }
        self.prev_autonomous = autonomous;

        self.keepalive_cnt += 1;
        if self.keepalive_cnt > KEEPALIVE_ITERATIONS {
            self.keepalive_cnt = 0;
            if keep {
                let _ = core.motion.send_keepalive();
            } else {
                let _ = core.motion.release_motors();
            }
        }
    }

    fn save_pointcloud(&mut self, core: &Core, frame: &TofFrame) {
        let path = core
            .config
            .data_dir
            .join(format!("cloud{:05}.xyz", self.pointcloud_cnt));
        self.pointcloud_cnt = (self.pointcloud_cnt + 1) % 100_000;

        let world_frame = core.pointcloud_mode.load(Ordering::Relaxed) == 2;
        let mut text = String::new();
        let ang = ang32_to_rad(frame.robot_pose.ang);
        let (sin, cos) = ang.sin_cos();
        for &(ox, oy) in &frame.obstacles {
            let (x, y) = if world_frame {
                (
                    frame.robot_pose.x + (ox as f64 * cos - oy as f64 * sin) as i32,
                    frame.robot_pose.y + (ox as f64 * sin + oy as f64 * cos) as i32,
                )
            } else {
                (ox, oy)
            };
            text.push_str(&format!("{} {} 0\n", x, -y));
        }
        if let Err(e) = std::fs::write(&path, text) {
            warn!("pointcloud save failed: {e}");
        }
    }
}

/// The mapping worker loop. It never blocks on sensor input; each
/// iteration drains at most one frame per source.
pub fn run(core: Arc<Core>) {
    let gate = &core.gates.mapping;
    let mut engine = Engine::new();
    loop {
        engine.iterate(&core);
        gate.set_cancelable(true);
        std::thread::sleep(Duration::from_millis(1));
        if gate.yield_point() {
            break;
        }
        gate.set_cancelable(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::core::Core;
    use crate::error::RoverResult;
    use crate::motion::{McuLink, McuRequest, McuResponse};
    use crate::routing::GridPlanner;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMcu {
        sent: std::sync::Arc<Mutex<Vec<McuRequest>>>,
    }
    impl McuLink for RecordingMcu {
        fn send(&mut self, req: &McuRequest) -> RoverResult<()> {
            self.sent.lock().push(req.clone());
            Ok(())
        }
        fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
            Ok(None)
        }
    }

    fn test_core() -> (Arc<Core>, std::sync::Arc<Mutex<Vec<McuRequest>>>) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HostConfig {
            data_dir: dir.into_path(),
            ..HostConfig::default()
        };
        let mcu = RecordingMcu::default();
        let sent = mcu.sent.clone();
        let core = Core::new(cfg, Box::new(mcu), Box::new(GridPlanner::default()));
        (core, sent)
    }

    fn scan_with_id(id: u8) -> Arc<LidarScan> {
        Arc::new(LidarScan {
            corr_id: id,
            robot_pose: Pose::new(0, 10, 10),
            points: vec![(1000, 0)],
            significant: true,
            distorted: false,
        })
    }

    #[test]
    fn stale_lidar_frames_are_dropped_and_unstick_after_twenty() {
        let (core, sent) = test_core();
        let mut engine = Engine::new();
        let current = core.pose.corr_id();
        let stale = current.wrapping_add(50) % 100;

        for _ in 0..LIDAR_IGNORE_LIMIT {
            engine.handle_lidar(&core, scan_with_id(stale));
        }
        assert!(core.lidar_ring.is_empty());
        assert_eq!(core.pose.corr_id(), current);

        // The 21st stale frame forces a no-op correction with a fresh id.
        engine.handle_lidar(&core, scan_with_id(stale));
        assert_ne!(core.pose.corr_id(), current);
        let reqs = sent.lock();
        assert!(reqs.iter().any(|r| matches!(
            r,
            McuRequest::CorrectRobotPos {
                da: 0,
                dx: 0,
                dy: 0,
                ..
            }
        )));
    }

    #[test]
    fn matching_lidar_frames_enter_ring_and_queue() {
        let (core, _sent) = test_core();
        let mut engine = Engine::new();
        let id = core.pose.corr_id();
        engine.handle_lidar(&core, scan_with_id(id));
        assert_eq!(core.lidar_ring.len(), 1);
        assert_eq!(engine.lidar_queue.len(), 1);
        assert!(core.lidar_ignore_over.load(Ordering::Relaxed));
    }

    #[test]
    fn queue_of_five_triggers_correction() {
        let (core, sent) = test_core();
        let mut engine = Engine::new();
        // Re-tag each scan after the correction advances the id.
        for _ in 0..5 {
            let id = core.pose.corr_id();
            engine.handle_lidar(&core, scan_with_id(id));
        }
        assert!(engine.lidar_queue.is_empty(), "queue should have flushed");
        assert!(sent
            .lock()
            .iter()
            .any(|r| matches!(r, McuRequest::CorrectRobotPos { .. })));
    }

    #[test]
    fn tof_flush_drops_frames_after_pose_reset() {
        let (core, _sent) = test_core();
        let mut engine = Engine::new();
        core.flush_tof.store(2, Ordering::Relaxed);
        let frame = TofFrame {
            corr_id: core.pose.corr_id(),
            robot_pose: Pose::new(0, 5, 5),
            obstacle_levels: [0; 3],
            obstacles: vec![(300, 0)],
        };
        engine.handle_tof(&core, frame.clone());
        engine.handle_tof(&core, frame.clone());
        assert_eq!(engine.tof_batch.len(), 0);
        engine.handle_tof(&core, frame);
        assert_eq!(engine.tof_batch.len(), 1);
    }

    #[test]
    fn tof_batches_flush_at_three_while_moving() {
        let (core, _sent) = test_core();
        let mut engine = Engine::new();
        core.world.load_region(0, 0);
        for i in 0..3 {
            let frame = TofFrame {
                corr_id: core.pose.corr_id(),
                robot_pose: Pose::new(0, 100 + i * 50, 0),
                obstacle_levels: [0; 3],
                obstacles: vec![(400, 0)],
            };
            engine.handle_tof(&core, frame);
        }
        assert!(engine.tof_batch.is_empty(), "batch should have flushed at 3");
    }
}
