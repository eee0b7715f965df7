//! Utility re-exports for the kiwi-drive control core.
//!
//! - `controllers`: pulse counters, motor actuators, the RPM controller and the
//!   robot-level orchestration that ties them together
//! - `math`: kiwi-drive kinematics and encoder velocity estimation
//! - `time`: monotonic instants with wraparound-safe differences

pub mod controllers;
pub mod math;
pub mod time;

pub use controllers::{MotionCommand, RobotConfig, RobotController};
pub use math::kinematics::{KiwiKinematics, RobotGeometry};
