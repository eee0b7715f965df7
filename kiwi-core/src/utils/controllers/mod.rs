//! Module Exports
//!
//! This file exports the control-side modules of the kiwi-drive core.
//!
//! - `encoder`: interrupt-fed pulse counters with debounce and direction sensing
//! - `motor`: H-bridge DC motor actuation
//! - `rpm`: proportional wheel-speed controller
//! - `robot`: the per-tick orchestration of all three wheels

pub mod encoder;
pub mod motor;
pub mod robot;
pub mod rpm;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::math::kinematics::{GeometryError, RobotGeometry};

pub use encoder::{Edge, PulseCounter, Sense, SenseChannel};
pub use motor::{DriveActuator, DriveCommand, DriveError, MotorDirection, WheelDrive};
pub use robot::{CommandError, DrivePhase, RobotController, RobotError, Telemetry, Tick, WheelState};
pub use rpm::RpmController;

/// Motion command variants accepted by [`RobotController::execute`].
///
/// Serialized as JSON with tag `"mc"`; `omega` (deg/s) defaults to zero.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "mc", rename_all = "snake_case")]
pub enum MotionCommand {
    /// Heading (deg, 90° = forward) and speed (m/s).
    Holonomic {
        speed: f32,
        angle: f32,
        #[serde(default)]
        omega: f32,
    },
    /// Body velocities (m/s): `vx` to the right, `vy` forward.
    NonHolonomic {
        vx: f32,
        vy: f32,
        #[serde(default)]
        omega: f32,
    },
    Stop,
}

/// Everything needed to bring up a [`RobotController`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub geometry: RobotGeometry,
    /// Proportional gain, raw duty per RPM of error
    pub kp: f32,
    /// Minimum spacing of control ticks (ms)
    pub min_tick_ms: u32,
    /// Encoder debounce window (µs)
    pub debounce_us: u32,
    /// B-channel level meaning forward rotation on A/B encoders
    pub sense_forward_high: bool,
    /// PWM carrier frequency handed to the HAL when the channels are set up (Hz)
    pub pwm_frequency_hz: u32,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            geometry: RobotGeometry::default(),
            kp: 1000.0,
            min_tick_ms: 10,
            debounce_us: 200,
            sense_forward_high: false,
            pwm_frequency_hz: 10_000,
        }
    }
}

impl RobotConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.kp.is_finite() || self.kp < 0.0 {
            return Err(ConfigError::Gain);
        }
        // Elapsed time is only defined up to half the 32-bit µs range.
        let tick_us = match self.min_tick_ms.checked_mul(1_000) {
            Some(us) if us != 0 && us <= i32::MAX as u32 => us,
            _ => return Err(ConfigError::TickInterval),
        };
        if self.debounce_us >= tick_us {
            return Err(ConfigError::Debounce);
        }
        if self.pwm_frequency_hz == 0 {
            return Err(ConfigError::PwmFrequency);
        }
        Ok(())
    }

    pub fn sense_forward_level(&self) -> embedded_hal::digital::PinState {
        embedded_hal::digital::PinState::from(self.sense_forward_high)
    }

    /// A/B counter configured with this config's polarity and debounce window.
    pub fn quadrature_counter(&self) -> PulseCounter {
        PulseCounter::quadrature(self.sense_forward_level())
            .with_debounce(crate::utils::time::micros(self.debounce_us))
    }

    /// Single-channel counter with this config's debounce window.
    pub fn blind_counter(&self) -> PulseCounter {
        PulseCounter::direction_blind().with_debounce(crate::utils::time::micros(self.debounce_us))
    }
}

/// Errors in robot configuration, caught at construction or tuning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    Geometry(GeometryError),
    Gain,
    TickInterval,
    Debounce,
    PwmFrequency,
}

impl fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ConfigError::Geometry(e) => write!(f, "geometry: {}", e),
            ConfigError::Gain => f.write_str("kp must be finite and non-negative"),
            ConfigError::TickInterval => {
                f.write_str("minimum tick interval must be between 1 ms and 2147483 ms")
            }
            ConfigError::Debounce => f.write_str("debounce window must be shorter than a tick"),
            ConfigError::PwmFrequency => f.write_str("PWM frequency must be non-zero"),
        }
    }
}
