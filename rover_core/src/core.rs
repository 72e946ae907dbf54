//! The shared context every worker runs against, plus the adaptive speed
//! limiter and the autonomous-exploration switch.

use crate::config::HostConfig;
use crate::motion::{McuLink, MotionClient};
use crate::nav::NavCtl;
use crate::pose::PoseService;
use crate::proto::{ClientPort, HostReport, MovementStatus, RouteStatus};
use crate::routing::{RoutePlanner, RoutingCoordinator};
use crate::sensors::{sensor_channels, LidarRing, SensorRx, SensorTx};
use crate::state::{InfoState, StateVector};
use crate::workers::WorkerGates;
use crate::world::World;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI8, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Speed-limit adjustments are rate limited to this interval.
const SPEED_ADJUST_INTERVAL: Duration = Duration::from_millis(150);

/// Current and maximum speed limit. The invariant `0 < cur <= max <= 70`
/// holds at all times.
#[derive(Debug)]
pub struct SpeedLimiter {
    cur: AtomicU8,
    max: AtomicU8,
    last_adjust: Mutex<Instant>,
}

impl SpeedLimiter {
    pub fn new(default_lim: u8) -> Self {
        Self {
            cur: AtomicU8::new(default_lim),
            max: AtomicU8::new(default_lim),
            last_adjust: Mutex::new(Instant::now()),
        }
    }

    pub fn cur(&self) -> u8 {
        self.cur.load(Ordering::Relaxed)
    }

    pub fn max_limit(&self) -> u8 {
        self.max.load(Ordering::Relaxed)
    }

    /// Clamp the current limit down to `limit` immediately (obstacle
    /// reactions are not rate limited).
    pub fn clamp_now(&self, limit: u8, motion: &MotionClient) {
        let new = limit.min(self.max_limit()).max(1);
        self.cur.store(new, Ordering::Relaxed);
        let _ = motion.limit_speed(new);
    }

    /// Reconfigure the maximum, lowering the current limit if needed.
    pub fn set_max(&self, limit: u8, motion: &MotionClient) {
        self.max.store(limit.max(1), Ordering::Relaxed);
        if self.cur() > limit {
            self.cur.store(limit.max(1), Ordering::Relaxed);
            let _ = motion.limit_speed(limit.max(1));
        }
    }

    /// Derive the limit from the latest 3D-ToF obstacle-level histogram
    /// `[near, mid, far]`, or ramp back toward the maximum when the view is
    /// clear. Applies at most once per 150 ms.
    pub fn tof_adjust(&self, levels: [i32; 3], motion: &MotionClient) {
        let mut last = self.last_adjust.lock();
        if last.elapsed() < SPEED_ADJUST_INTERVAL {
            return;
        }
        *last = Instant::now();

        let [near, mid, far] = levels;
        let ceiling = if far > 100 {
            Some(18)
        } else if far > 7 {
            Some(25)
        } else if mid > 70 {
            Some(25)
        } else if mid > 7 {
            Some(35)
        } else if near > 20 {
            Some(42)
        } else {
            None
        };

        let cur = self.cur();
        let max = self.max_limit();
        match ceiling {
            Some(c) if cur > c => {
                self.cur.store(c.min(max).max(1), Ordering::Relaxed);
                let _ = motion.limit_speed(self.cur());
            }
            Some(_) => {}
            None => {
                if cur < max {
                    self.cur.store(cur + 1, Ordering::Relaxed);
                    let _ = motion.limit_speed(cur + 1);
                } else if cur > max {
                    self.cur.store(cur - 1, Ordering::Relaxed);
                    let _ = motion.limit_speed(cur - 1);
                }
            }
        }
    }
}

/// Autonomous-exploration switch, flipped by the command source edge.
#[derive(Debug)]
pub struct Explorer {
    active: AtomicBool,
    pub last_attempt: Mutex<Instant>,
}

impl Default for Explorer {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(false),
            last_attempt: Mutex::new(Instant::now()),
        }
    }
}

impl Explorer {
    pub fn start(&self) {
        self.active.store(true, Ordering::Relaxed);
    }
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// The client command currently awaiting a completion report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveCmd {
    Dest {
        start_ang16: i16,
        start_x: i32,
        start_y: i32,
        requested_x: i32,
        requested_y: i32,
        requested_backmode: u8,
    },
    Route {
        start_ang16: i16,
        start_x: i32,
        start_y: i32,
        requested_x: i32,
        requested_y: i32,
    },
}

/// Everything the workers share. One instance per process.
pub struct Core {
    pub config: HostConfig,
    pub world: World,
    pub pose: PoseService,
    pub state: StateVector,
    pub motion: MotionClient,
    pub client: ClientPort,
    pub lidar_ring: LidarRing,
    pub sensors_tx: SensorTx,
    pub sensors_rx: SensorRx,
    pub routing: RoutingCoordinator,
    pub planner: Box<dyn RoutePlanner>,
    pub nav: Mutex<NavCtl>,
    pub speed: SpeedLimiter,
    pub gates: WorkerGates,
    pub explorer: Explorer,
    pub active_cmd: Mutex<Option<ActiveCmd>>,
    /// Total searches run; echoed in route status reports.
    pub num_reroutes: AtomicI32,

    /// Pending 3D-ToF frames to drop after a pose reset.
    pub flush_tof: AtomicU8,
    /// Set when an accepted (id-matching) lidar frame has been processed
    /// since the flag was last cleared.
    pub lidar_ignore_over: AtomicBool,
    /// Near a waypoint: a good moment to run lidar mapping early.
    pub good_lidar_time: AtomicBool,

    pub shutdown: AtomicBool,
    pub exit_code: AtomicI32,
    pub verbose: AtomicBool,
    /// 0 = off, 1 = robot frame, 2 = world frame.
    pub pointcloud_mode: AtomicU8,
    /// Raw ToF sensor index forwarded for display, -1 = none.
    pub raw_tof_sensor: AtomicI8,
}

impl Core {
    pub fn new(config: HostConfig, link: Box<dyn McuLink>, planner: Box<dyn RoutePlanner>) -> Arc<Self> {
        let (sensors_tx, sensors_rx) = sensor_channels();
        let page_dir = config.map_page_dir();
        let default_lim = config.default_speedlim;
        Arc::new(Self {
            config,
            world: World::new(page_dir),
            pose: PoseService::default(),
            state: StateVector::default(),
            motion: MotionClient::new(link),
            client: ClientPort::default(),
            lidar_ring: LidarRing::default(),
            sensors_tx,
            sensors_rx,
            routing: RoutingCoordinator::default(),
            planner,
            nav: Mutex::new(NavCtl::default()),
            speed: SpeedLimiter::new(default_lim),
            gates: WorkerGates::default(),
            explorer: Explorer::default(),
            active_cmd: Mutex::new(None),
            num_reroutes: AtomicI32::new(0),
            flush_tof: AtomicU8::new(0),
            lidar_ignore_over: AtomicBool::new(false),
            good_lidar_time: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            verbose: AtomicBool::new(false),
            pointcloud_mode: AtomicU8::new(0),
            raw_tof_sensor: AtomicI8::new(-1),
        })
    }

    pub fn send_info(&self, state: InfoState) {
        self.client.send(&HostReport::Info(state));
    }

    pub fn request_shutdown(&self, code: i32) {
        self.exit_code.store(code, Ordering::Relaxed);
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Close out an active planned-route command with a status report.
    pub fn report_route_status(&self, status: RouteStatus) {
        let mut active = self.active_cmd.lock();
        let Some(ActiveCmd::Route {
            start_ang16,
            start_x,
            start_y,
            requested_x,
            requested_y,
        }) = *active
        else {
            return;
        };
        let p = self.pose.pose();
        let num_reroutes = self.num_reroutes.load(Ordering::Relaxed);
        self.client.send(&HostReport::RouteStatus {
            start_ang16,
            start_x,
            start_y,
            requested_x,
            requested_y,
            cur_ang16: (p.ang >> 16) as i16,
            cur_x: p.x,
            cur_y: p.y,
            status,
            num_reroutes,
        });
        *active = None;
    }

    /// Close out an active manual-destination command.
    pub fn report_movement_status(&self, status: MovementStatus, obstacle_flags: u32) {
        let mut active = self.active_cmd.lock();
        let Some(ActiveCmd::Dest {
            start_ang16,
            start_x,
            start_y,
            requested_x,
            requested_y,
            requested_backmode,
        }) = *active
        else {
            return;
        };
        let p = self.pose.pose();
        self.client.send(&HostReport::MovementStatus {
            start_ang16,
            start_x,
            start_y,
            requested_x,
            requested_y,
            requested_backmode,
            cur_ang16: (p.ang >> 16) as i16,
            cur_x: p.x,
            cur_y: p.y,
            status,
            obstacle_flags,
        });
        *active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoverResult;
    use crate::motion::{McuRequest, McuResponse};
    use crate::routing::GridPlanner;

    struct NullMcu;
    impl McuLink for NullMcu {
        fn send(&mut self, _req: &McuRequest) -> RoverResult<()> {
            Ok(())
        }
        fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
            Ok(None)
        }
    }

    fn core() -> Arc<Core> {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HostConfig {
            data_dir: dir.into_path(),
            ..HostConfig::default()
        };
        Core::new(cfg, Box::new(NullMcu), Box::new(GridPlanner::default()))
    }

    #[test]
    fn speed_invariant_holds() {
        let core = core();
        assert_eq!(core.speed.cur(), 45);
        core.speed.clamp_now(18, &core.motion);
        assert_eq!(core.speed.cur(), 18);
        core.speed.set_max(10, &core.motion);
        assert_eq!(core.speed.cur(), 10);
        core.speed.clamp_now(200, &core.motion);
        assert!(core.speed.cur() <= core.speed.max_limit());
    }

    #[test]
    fn tof_adjust_table_and_cadence() {
        let core = core();
        // First adjustment is gated by the 150 ms interval from startup.
        std::thread::sleep(std::time::Duration::from_millis(160));
        core.speed.tof_adjust([0, 0, 120], &core.motion);
        assert_eq!(core.speed.cur(), 18);
        // Immediately after, further adjustments are ignored.
        core.speed.tof_adjust([0, 0, 0], &core.motion);
        assert_eq!(core.speed.cur(), 18);
        // After the interval the clear view ramps the limit back up.
        std::thread::sleep(std::time::Duration::from_millis(160));
        core.speed.tof_adjust([0, 0, 0], &core.motion);
        assert_eq!(core.speed.cur(), 19);
    }

    #[test]
    fn shutdown_carries_exit_code() {
        let core = core();
        assert!(!core.shutting_down());
        core.request_shutdown(5);
        assert!(core.shutting_down());
        assert_eq!(core.exit_code.load(Ordering::Relaxed), 5);
    }
}
