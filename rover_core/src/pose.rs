//! Current robot pose and the pose-correction epoch counter.
//!
//! The pose and its correction id are published together under one lock so
//! that sensor intake can never tag a frame with an id from a different
//! epoch than the pose it observed.

use crate::error::RoverResult;
use crate::geom;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Robot pose: fixed-point angle (full turn = 2^32) and millimeter x/y.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub ang: i32,
    pub x: i32,
    pub y: i32,
}

impl Pose {
    pub fn new(ang: i32, x: i32, y: i32) -> Self {
        Self { ang, x, y }
    }

    pub fn dist_to(&self, x: i32, y: i32) -> i32 {
        geom::dist_mm(self.x, self.y, x, y)
    }
}

/// Pose correction ids live in [0, 99] and wrap.
pub const POS_CORR_ID_MAX: u8 = 99;

#[derive(Debug, Clone, Copy)]
pub struct PoseSnapshot {
    pub pose: Pose,
    pub corr_id: u8,
    pub stamp: Instant,
}

#[derive(Debug)]
struct PoseRecord {
    pose: Pose,
    corr_id: u8,
    stamp: Instant,
}

/// One process-wide pose instance.
///
/// The MCU stream keeps `pose` current via [`PoseService::publish`];
/// corrections and explicit repositioning go through [`PoseService::correct`]
/// and [`PoseService::set`], which also advance the correction id.
#[derive(Debug)]
pub struct PoseService {
    inner: Mutex<PoseRecord>,
}

impl Default for PoseService {
    fn default() -> Self {
        Self {
            inner: Mutex::new(PoseRecord {
                pose: Pose::default(),
                corr_id: 42,
                stamp: Instant::now(),
            }),
        }
    }
}

impl PoseService {
    pub fn snapshot(&self) -> PoseSnapshot {
        let rec = self.inner.lock();
        PoseSnapshot {
            pose: rec.pose,
            corr_id: rec.corr_id,
            stamp: rec.stamp,
        }
    }

    pub fn pose(&self) -> Pose {
        self.inner.lock().pose
    }

    pub fn corr_id(&self) -> u8 {
        self.inner.lock().corr_id
    }

    /// Update from the MCU pose stream. Does not touch the correction id.
    pub fn publish(&self, pose: Pose) {
        let mut rec = self.inner.lock();
        rec.pose = pose;
        rec.stamp = Instant::now();
    }

    /// Reset the pose outright and open a new correction epoch.
    pub fn set(&self, pose: Pose) -> u8 {
        let mut rec = self.inner.lock();
        rec.pose = pose;
        rec.stamp = Instant::now();
        rec.corr_id = next_id(rec.corr_id);
        rec.corr_id
    }

    /// Apply a (possibly damped) correction delta and open a new epoch.
    /// The delta and the id advance are visible atomically.
    pub fn correct(&self, da: i32, dx: i32, dy: i32) -> u8 {
        let mut rec = self.inner.lock();
        rec.pose.ang = rec.pose.ang.wrapping_add(da);
        rec.pose.x += dx;
        rec.pose.y += dy;
        rec.stamp = Instant::now();
        rec.corr_id = next_id(rec.corr_id);
        rec.corr_id
    }
}

fn next_id(id: u8) -> u8 {
    if id >= POS_CORR_ID_MAX {
        0
    } else {
        id + 1
    }
}

/// Persist the pose as one `ang x y` line.
pub fn save_robot_pos(path: &Path, pose: Pose) -> RoverResult<()> {
    std::fs::write(path, format!("{} {} {}\n", pose.ang, pose.x, pose.y))?;
    Ok(())
}

/// Read a pose previously written by [`save_robot_pos`]. Returns `None` when
/// the file does not exist or does not parse.
pub fn load_robot_pos(path: &Path) -> Option<Pose> {
    let text = std::fs::read_to_string(path).ok()?;
    let mut it = text.split_whitespace();
    let ang = it.next()?.parse().ok()?;
    let x = it.next()?.parse().ok()?;
    let y = it.next()?.parse().ok()?;
    Some(Pose::new(ang, x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_advances_id_atomically() {
        let svc = PoseService::default();
        let before = svc.snapshot();
        let id = svc.correct(1000, 50, -20);
        let after = svc.snapshot();
        assert_eq!(after.corr_id, id);
        assert_ne!(after.corr_id, before.corr_id);
        assert_eq!(after.pose.x, before.pose.x + 50);
        assert_eq!(after.pose.y, before.pose.y - 20);
    }

    #[test]
    fn id_wraps_at_hundred() {
        let svc = PoseService::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..=POS_CORR_ID_MAX {
            seen.insert(svc.correct(0, 0, 0));
        }
        assert_eq!(seen.len(), 100);
        assert!(seen.iter().all(|&id| id <= POS_CORR_ID_MAX));
    }

    #[test]
    fn pose_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("robot_pos.txt");
        let pose = Pose::new(123456789, -1500, 2000);
        save_robot_pos(&path, pose).unwrap();
        assert_eq!(load_robot_pos(&path), Some(pose));
    }
}
