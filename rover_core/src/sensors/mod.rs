//! Sensor frame types and the intake channels feeding the mapping engine.
//!
//! Every frame carries the pose-correction id that was current when it was
//! captured. Frames whose id no longer matches the published id are dropped
//! for mapping purposes (they may still be forwarded for display).

use crate::pose::Pose;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A 2D lidar scan. Points are millimeter offsets in the robot frame of the
/// capture pose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LidarScan {
    pub corr_id: u8,
    pub robot_pose: Pose,
    pub points: Vec<(i32, i32)>,
    /// Flagged by lidar preprocessing as usable for map updates.
    pub significant: bool,
    /// Captured during fast rotation; usable only as a fallback.
    pub distorted: bool,
}

/// One 3D time-of-flight frame, reduced to the obstacle projection the
/// mapping engine consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TofFrame {
    pub corr_id: u8,
    pub robot_pose: Pose,
    /// Obstacle-level histogram: cell counts at [near, mid, far] bands.
    pub obstacle_levels: [i32; 3],
    /// Robot-frame millimeter points classified as obstacles.
    pub obstacles: Vec<(i32, i32)>,
}

/// A single sonar echo, already projected into world millimeters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SonarPoint {
    pub corr_id: u8,
    pub x: i32,
    pub y: i32,
}

/// The most recent lidar scans, significant or not, kept for last-moment
/// localization before routing starts and before charger docking.
pub const LIDAR_RING_DEPTH: usize = 4;

#[derive(Debug, Default)]
pub struct LidarRing {
    scans: Mutex<Vec<Arc<LidarScan>>>,
}

impl LidarRing {
    pub fn push(&self, scan: Arc<LidarScan>) {
        let mut scans = self.scans.lock();
        scans.insert(0, scan);
        scans.truncate(LIDAR_RING_DEPTH);
    }

    pub fn latest(&self) -> Vec<Arc<LidarScan>> {
        self.scans.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.scans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scans.lock().is_empty()
    }
}

/// Producer half of the sensor intake, held by the MCU link pump and the
/// ToF poll thread.
#[derive(Debug, Clone)]
pub struct SensorTx {
    pub lidar: Sender<Arc<LidarScan>>,
    pub tof: Sender<TofFrame>,
    pub sonar: Sender<SonarPoint>,
}

/// Consumer half, owned by the mapping engine.
#[derive(Debug)]
pub struct SensorRx {
    pub lidar: Receiver<Arc<LidarScan>>,
    pub tof: Receiver<TofFrame>,
    pub sonar: Receiver<SonarPoint>,
}

impl SensorRx {
    pub fn try_lidar(&self) -> Option<Arc<LidarScan>> {
        match self.lidar.try_recv() {
            Ok(s) => Some(s),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn try_tof(&self) -> Option<TofFrame> {
        self.tof.try_recv().ok()
    }

    pub fn try_sonar(&self) -> Option<SonarPoint> {
        self.sonar.try_recv().ok()
    }

    /// Drop everything queued on the ToF channel, as the set-position
    /// command does before flushing the next frames.
    pub fn drain_tof(&self) -> usize {
        let mut n = 0;
        while self.tof.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// A processed frame as delivered by a 3D-ToF camera driver: capture pose
/// attached, correction id not yet assigned.
#[derive(Debug, Clone)]
pub struct RawTofFrame {
    pub robot_pose: Pose,
    pub obstacle_levels: [i32; 3],
    pub obstacles: Vec<(i32, i32)>,
}

/// Driver-side source of 3D-ToF frames. The camera driver itself lives
/// outside the core; the intake worker polls it and tags each frame with
/// the pose-correction id current at hand-off.
pub trait TofSource: Send {
    fn poll(&mut self) -> Option<RawTofFrame>;
}

/// The ToF intake worker loop.
pub fn run_tof_intake(core: std::sync::Arc<crate::core::Core>, mut source: Box<dyn TofSource>) {
    while !core.shutting_down() {
        match source.poll() {
            Some(raw) => {
                let frame = TofFrame {
                    corr_id: core.pose.corr_id(),
                    robot_pose: raw.robot_pose,
                    obstacle_levels: raw.obstacle_levels,
                    obstacles: raw.obstacles,
                };
                let _ = core.sensors_tx.tof.send(frame);
            }
            None => std::thread::sleep(std::time::Duration::from_millis(5)),
        }
    }
}

pub fn sensor_channels() -> (SensorTx, SensorRx) {
    let (lidar_tx, lidar_rx) = unbounded();
    let (tof_tx, tof_rx) = unbounded();
    let (sonar_tx, sonar_rx) = unbounded();
    (
        SensorTx {
            lidar: lidar_tx,
            tof: tof_tx,
            sonar: sonar_tx,
        },
        SensorRx {
            lidar: lidar_rx,
            tof: tof_rx,
            sonar: sonar_rx,
        },
    )
}
