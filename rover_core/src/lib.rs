//! # Rover Core
//!
//! The on-robot host control core for a differential-drive mobile robot
//! with a 2D lidar, a 3D time-of-flight camera, sonar and a motion-control
//! MCU. This crate provides the four tightly coupled subsystems the host
//! daemon runs:
//!
//! - **Navigation**: waypoint following with live obstacle checking,
//!   lookaround/creep/reroute recovery and charger docking
//! - **Routing**: on-demand route planning seeded by last-moment
//!   localization
//! - **Mapping**: paged occupancy world, scan-matching pose correction and
//!   adaptive speed limiting
//! - **Command dispatch**: serialized client/operator command execution
//!   with worker preemption
//!
//! The workers are plain OS threads sharing one [`core::Core`] context;
//! the world map sits behind a reader-writer lock, the pose and its
//! correction id are published atomically, and the state vector is a set
//! of per-flag atomics.

pub mod command;
pub mod config;
pub mod core;
pub mod error;
pub mod geom;
pub mod mapping;
pub mod motion;
pub mod nav;
pub mod pose;
pub mod proto;
pub mod routing;
pub mod sensors;
pub mod state;
pub mod workers;
pub mod world;

// Re-export the commonly used types for easy access.
pub use crate::core::Core;
pub use command::Dispatcher;
pub use config::HostConfig;
pub use error::{RoverError, RoverResult};
pub use motion::{McuLink, MotionClient, StreamLink};
pub use pose::{Pose, PoseService};
pub use routing::{GridPlanner, RoutePlanner};
pub use state::{CommandSource, InfoState, StateVector};
pub use world::World;
