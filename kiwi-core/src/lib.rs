//! Kinematics, encoder counting and RPM control for a three-wheeled kiwi-drive robot
//! on no-std embedded platforms.
//!
//! For a runnable host simulation, see the `mock-mcu` application in `kiwi-app/`.
#![no_std]

pub mod utils;
