//! Process-wide state vector and user-visible status states.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Who is currently in command of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandSource {
    Idle = 0,
    User = 1,
    Autonomous = 2,
}

impl CommandSource {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CommandSource::User,
            2 => CommandSource::Autonomous,
            _ => CommandSource::Idle,
        }
    }
}

/// User-visible robot status, emitted to the client on every change of
/// activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum InfoState {
    Idle = 0,
    Think = 1,
    Fwd = 2,
    Rev = 3,
    Left = 4,
    Right = 5,
    Charging = 6,
    Daijuing = 7,
}

/// Feature flags read by every worker, each behind its own atomic so there
/// is no lock to contend on the hot paths.
#[derive(Debug)]
pub struct StateVector {
    loca_2d: AtomicBool,
    loca_3d: AtomicBool,
    mapping_2d: AtomicBool,
    mapping_3d: AtomicBool,
    mapping_collisions: AtomicBool,
    keep_position: AtomicBool,
    /// 0 = normal, 1 = big search area, 2 = massive search area.
    big_search_area: AtomicU8,
    command_source: AtomicU8,
}

impl Default for StateVector {
    fn default() -> Self {
        Self {
            loca_2d: AtomicBool::new(true),
            loca_3d: AtomicBool::new(true),
            mapping_2d: AtomicBool::new(true),
            mapping_3d: AtomicBool::new(true),
            mapping_collisions: AtomicBool::new(true),
            keep_position: AtomicBool::new(true),
            big_search_area: AtomicU8::new(0),
            command_source: AtomicU8::new(CommandSource::User as u8),
        }
    }
}

impl StateVector {
    pub fn loca_2d(&self) -> bool {
        self.loca_2d.load(Ordering::Relaxed)
    }
    pub fn loca_3d(&self) -> bool {
        self.loca_3d.load(Ordering::Relaxed)
    }
    pub fn mapping_2d(&self) -> bool {
        self.mapping_2d.load(Ordering::Relaxed)
    }
    pub fn mapping_3d(&self) -> bool {
        self.mapping_3d.load(Ordering::Relaxed)
    }
    pub fn mapping_collisions(&self) -> bool {
        self.mapping_collisions.load(Ordering::Relaxed)
    }
    pub fn keep_position(&self) -> bool {
        self.keep_position.load(Ordering::Relaxed)
    }
    pub fn big_search_area(&self) -> u8 {
        self.big_search_area.load(Ordering::Relaxed)
    }
    pub fn command_source(&self) -> CommandSource {
        CommandSource::from_u8(self.command_source.load(Ordering::Relaxed))
    }

    pub fn set_keep_position(&self, on: bool) {
        self.keep_position.store(on, Ordering::Relaxed);
    }
    pub fn set_big_search_area(&self, level: u8) {
        self.big_search_area.store(level.min(2), Ordering::Relaxed);
    }
    pub fn set_command_source(&self, src: CommandSource) {
        self.command_source.store(src as u8, Ordering::Relaxed);
    }

    /// Switch every mapping and localization flag at once, as the composite
    /// mode commands do.
    pub fn set_all_mapping_loca(&self, on: bool) {
        self.loca_2d.store(on, Ordering::Relaxed);
        self.loca_3d.store(on, Ordering::Relaxed);
        self.mapping_2d.store(on, Ordering::Relaxed);
        self.mapping_3d.store(on, Ordering::Relaxed);
        self.mapping_collisions.store(on, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StateVectSnapshot {
        StateVectSnapshot {
            loca_2d: self.loca_2d(),
            loca_3d: self.loca_3d(),
            mapping_2d: self.mapping_2d(),
            mapping_3d: self.mapping_3d(),
            mapping_collisions: self.mapping_collisions(),
            keep_position: self.keep_position(),
            localize_with_big_search_area: self.big_search_area(),
            command_source: self.command_source(),
        }
    }

    /// Apply a client-supplied state vector wholesale.
    pub fn apply(&self, s: &StateVectSnapshot) {
        self.loca_2d.store(s.loca_2d, Ordering::Relaxed);
        self.loca_3d.store(s.loca_3d, Ordering::Relaxed);
        self.mapping_2d.store(s.mapping_2d, Ordering::Relaxed);
        self.mapping_3d.store(s.mapping_3d, Ordering::Relaxed);
        self.mapping_collisions
            .store(s.mapping_collisions, Ordering::Relaxed);
        self.keep_position.store(s.keep_position, Ordering::Relaxed);
        self.set_big_search_area(s.localize_with_big_search_area);
        self.set_command_source(s.command_source);
    }
}

/// Wire-format copy of the state vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVectSnapshot {
    pub loca_2d: bool,
    pub loca_3d: bool,
    pub mapping_2d: bool,
    pub mapping_3d: bool,
    pub mapping_collisions: bool,
    pub keep_position: bool,
    pub localize_with_big_search_area: u8,
    pub command_source: CommandSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_apply_round_trip() {
        let sv = StateVector::default();
        sv.set_big_search_area(2);
        sv.set_command_source(CommandSource::Autonomous);
        sv.set_keep_position(false);

        let snap = sv.snapshot();
        let other = StateVector::default();
        other.apply(&snap);
        assert_eq!(other.snapshot(), snap);
    }

    #[test]
    fn big_search_clamps() {
        let sv = StateVector::default();
        sv.set_big_search_area(9);
        assert_eq!(sv.big_search_area(), 2);
    }
}
