//! Math utilities for the kiwi-drive robot.
//!
//! This module provides the kinematics of a three-wheeled omni-directional base and
//! the conversion from encoder pulse counts to wheel RPM.

pub mod kinematics;

pub use kinematics::{estimate_rpm, KiwiKinematics, RobotGeometry};
