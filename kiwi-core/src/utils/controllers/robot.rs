//! Robot-level orchestration of the three wheel loops.
//!
//! Per tick: snapshot the pulse counters, estimate each wheel's RPM, run the P
//! controller against the held targets and command the motors.

use core::fmt;

use serde::Serialize;

use super::{
    encoder::PulseCounter,
    motor::{DriveCommand, WheelDrive},
    rpm::RpmController,
    ConfigError, MotionCommand, RobotConfig,
};
use crate::utils::{
    math::kinematics::{estimate_rpm, KiwiKinematics},
    time::{self, Duration, Instant},
};

/// Where the robot is in its command lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivePhase {
    /// No command yet; targets are zero.
    Idle,
    /// Targets set, no control tick applied since.
    Commanded,
    /// Control ticks are tracking the targets.
    Running,
    /// Explicitly stopped; motors stay off until the next command.
    Stopped,
}

/// Per-wheel loop state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WheelState {
    pub target_rpm: f32,
    pub current_rpm: f32,
    /// Raw pulse count at the last applied tick
    pub last_count: i32,
    /// Last controller output the motor accepted (raw duty units, signed)
    pub drive_output: f32,
    /// Direction of the last non-zero accepted output. Kept across `stop` so a
    /// direction-blind counter still reads a coasting wheel with the right sign.
    pub reverse: bool,
}

/// Tick timing and gain, owned by the controller and mutated only through `&mut self`.
#[derive(Debug, Clone, Copy)]
pub struct ControllerState {
    pub rpm: RpmController,
    pub last_update: Instant,
    pub min_tick: Duration,
}

/// Outcome of one `update` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tick {
    /// Too soon after the previous tick, or the clock did not advance; nothing changed.
    Skipped,
    /// Measurements refreshed; `driven` tells whether the motors were commanded.
    Applied { dt_s: f32, driven: bool },
}

/// Read-only snapshot for logging and export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    pub phase: DrivePhase,
    pub wheels: [WheelState; 3],
}

/// Errors from `RobotController` operations.
#[derive(Debug)]
pub enum RobotError<E> {
    Config(ConfigError),
    Command(CommandError),
    Drive(E),
}

impl<E> From<ConfigError> for RobotError<E> {
    fn from(e: ConfigError) -> Self {
        RobotError::Config(e)
    }
}

impl<E> From<CommandError> for RobotError<E> {
    fn from(e: CommandError) -> Self {
        RobotError::Command(e)
    }
}

impl<E: fmt::Debug> fmt::Display for RobotError<E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            RobotError::Config(e) => write!(f, "invalid configuration: {}", e),
            RobotError::Command(e) => write!(f, "rejected command: {}", e),
            RobotError::Drive(e) => write!(f, "motor error: {:?}", e),
        }
    }
}

/// A motion command carried a NaN or infinite parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandError;

impl fmt::Display for CommandError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str("motion parameters must be finite")
    }
}

/// Closed-loop controller for a kiwi-drive base.
pub struct RobotController<'a, M> {
    kinematics: KiwiKinematics,
    motors: [M; 3],
    encoders: [&'a PulseCounter; 3],
    wheels: [WheelState; 3],
    state: ControllerState,
    phase: DrivePhase,
}

impl<'a, M> RobotController<'a, M>
where
    M: WheelDrive,
{
    /// Validate `config`, stop every motor and start timing from `now`.
    ///
    /// Counts already on the encoders are taken as the baseline.
    pub fn new(
        config: &RobotConfig,
        mut motors: [M; 3],
        encoders: [&'a PulseCounter; 3],
        now: Instant,
    ) -> Result<Self, RobotError<M::Error>> {
        let kinematics = KiwiKinematics::new(config.geometry).map_err(ConfigError::Geometry)?;
        config.validate()?;

        for motor in motors.iter_mut() {
            motor.stop().map_err(RobotError::Drive)?;
        }

        let limit = motors.iter().map(|m| m.max_duty()).min().unwrap_or(0) as f32;
        let wheels = core::array::from_fn(|i| WheelState {
            last_count: encoders[i].get_count(),
            ..WheelState::default()
        });

        tracing::info!(
            kp = config.kp,
            max_duty = limit,
            "kiwi drive ready"
        );

        Ok(Self {
            kinematics,
            motors,
            encoders,
            wheels,
            state: ControllerState {
                rpm: RpmController::new(config.kp, limit),
                last_update: now,
                min_tick: time::millis(config.min_tick_ms),
            },
            phase: DrivePhase::Idle,
        })
    }

    /// Move along `angle` (deg, 90° = forward) at `speed` (m/s) while turning at
    /// `omega` (deg/s).
    pub fn holonomic(
        &mut self,
        speed: f32,
        angle: f32,
        omega: f32,
    ) -> Result<(), RobotError<M::Error>> {
        check_finite(&[speed, angle, omega])?;
        let targets = self.kinematics.holonomic(speed, angle, omega);
        tracing::info!(speed, angle, omega, "holonomic command");
        self.set_targets(targets);
        Ok(())
    }

    /// Move with body velocities `vx` (right) and `vy` (forward) in m/s while turning
    /// at `omega` (deg/s).
    pub fn non_holonomic(
        &mut self,
        vx: f32,
        vy: f32,
        omega: f32,
    ) -> Result<(), RobotError<M::Error>> {
        check_finite(&[vx, vy, omega])?;
        let targets = self.kinematics.non_holonomic(vx, vy, omega);
        tracing::info!(vx, vy, omega, "non-holonomic command");
        self.set_targets(targets);
        Ok(())
    }

    /// Zero all targets and stop every motor.
    ///
    /// Every motor is attempted even if an earlier one fails; the first failure is
    /// returned.
    pub fn stop(&mut self) -> Result<(), RobotError<M::Error>> {
        self.phase = DrivePhase::Stopped;
        let mut first_err = None;
        for (wheel, motor) in self.wheels.iter_mut().zip(self.motors.iter_mut()) {
            wheel.target_rpm = 0.0;
            wheel.drive_output = 0.0;
            if let Err(e) = motor.stop() {
                tracing::error!(?e, "failed to stop motor");
                first_err.get_or_insert(e);
            }
        }
        tracing::info!("stopped");
        match first_err {
            Some(e) => Err(RobotError::Drive(e)),
            None => Ok(()),
        }
    }

    pub fn execute(
        &mut self,
        command: MotionCommand,
    ) -> Result<(), RobotError<M::Error>> {
        match command {
            MotionCommand::Holonomic {
                speed,
                angle,
                omega,
            } => self.holonomic(speed, angle, omega),
            MotionCommand::NonHolonomic { vx, vy, omega } => self.non_holonomic(vx, vy, omega),
            MotionCommand::Stop => self.stop(),
        }
    }

    /// Run one control step at `now`.
    ///
    /// Calls closer together than the minimum tick interval are no-ops. While idle or
    /// stopped the RPM measurements are refreshed but the motors are left alone.
    ///
    /// If a motor rejects its command the whole base is stopped (as by [`Self::stop`])
    /// and the motor's error is returned.
    pub fn update(
        &mut self,
        now: Instant,
    ) -> Result<Tick, RobotError<M::Error>> {
        let dt = match time::elapsed(now, self.state.last_update) {
            Some(dt) if dt >= self.state.min_tick => dt,
            _ => {
                tracing::trace!("tick skipped");
                return Ok(Tick::Skipped);
            }
        };
        let dt_s = time::as_secs_f32(dt);
        let pulses_per_rev = self.kinematics.geometry().pulses_per_wheel_rev();
        let drive = matches!(self.phase, DrivePhase::Commanded | DrivePhase::Running);

        let mut outputs = [0.0; 3];
        for ((wheel, encoder), output) in self
            .wheels
            .iter_mut()
            .zip(self.encoders.iter())
            .zip(outputs.iter_mut())
        {
            let count = encoder.get_count();
            let mut rpm = estimate_rpm(count.wrapping_sub(wheel.last_count), dt_s, pulses_per_rev);
            if !encoder.is_direction_aware() && wheel.reverse {
                rpm = -rpm;
            }
            wheel.current_rpm = rpm;
            wheel.last_count = count;
            if drive {
                *output = self.state.rpm.output(wheel.target_rpm, rpm);
            }
        }
        self.state.last_update = now;

        if drive {
            for i in 0..3 {
                if let Err(e) = self.motors[i].drive(DriveCommand::Raw(outputs[i])) {
                    tracing::error!(wheel = i, ?e, "motor rejected drive command, halting");
                    // Secondary stop failures are logged by `stop`; the drive error wins.
                    let _ = self.stop();
                    return Err(RobotError::Drive(e));
                }
                let wheel = &mut self.wheels[i];
                wheel.drive_output = outputs[i];
                if outputs[i] != 0.0 {
                    wheel.reverse = outputs[i] < 0.0;
                }
            }
            self.phase = DrivePhase::Running;
        }

        let [m1, m2, m3] = &self.wheels;
        tracing::debug!(
            "M1 T:{:.1} C:{:.1} | M2 T:{:.1} C:{:.1} | M3 T:{:.1} C:{:.1}",
            m1.target_rpm,
            m1.current_rpm,
            m2.target_rpm,
            m2.current_rpm,
            m3.target_rpm,
            m3.current_rpm
        );

        Ok(Tick::Applied {
            dt_s,
            driven: drive,
        })
    }

    /// Zero every pulse counter together with the baseline the estimator diffs against.
    ///
    /// Resetting a counter on its own would make the next tick read the whole previous
    /// total as backwards motion.
    pub fn reset_encoders(&mut self) {
        for (wheel, encoder) in self.wheels.iter_mut().zip(self.encoders.iter()) {
            encoder.reset();
            wheel.last_count = 0;
        }
        tracing::info!("encoders reset");
    }

    /// Change the proportional gain between ticks.
    pub fn set_kp(
        &mut self,
        kp: f32,
    ) -> Result<(), RobotError<M::Error>> {
        if !kp.is_finite() || kp < 0.0 {
            tracing::warn!(kp, "rejected gain");
            return Err(ConfigError::Gain.into());
        }
        self.state.rpm.set_kp(kp);
        Ok(())
    }

    pub fn kp(&self) -> f32 {
        self.state.rpm.kp()
    }

    pub fn phase(&self) -> DrivePhase {
        self.phase
    }

    pub fn wheels(&self) -> &[WheelState; 3] {
        &self.wheels
    }

    pub fn target_rpms(&self) -> [f32; 3] {
        self.wheels.map(|w| w.target_rpm)
    }

    pub fn current_rpms(&self) -> [f32; 3] {
        self.wheels.map(|w| w.current_rpm)
    }

    pub fn drive_outputs(&self) -> [f32; 3] {
        self.wheels.map(|w| w.drive_output)
    }

    pub fn last_update(&self) -> Instant {
        self.state.last_update
    }

    /// Body velocity `(vx, vy, omega)` implied by the last measured RPMs.
    pub fn measured_body_velocity(&self) -> (f32, f32, f32) {
        self.kinematics.body_velocity(self.current_rpms())
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            phase: self.phase,
            wheels: self.wheels,
        }
    }

    pub fn kinematics(&self) -> &KiwiKinematics {
        &self.kinematics
    }

    pub fn motors(&self) -> &[M; 3] {
        &self.motors
    }

    fn set_targets(
        &mut self,
        targets: [f32; 3],
    ) {
        for (wheel, target) in self.wheels.iter_mut().zip(targets) {
            wheel.target_rpm = target;
        }
        self.phase = DrivePhase::Commanded;
    }
}

fn check_finite(values: &[f32]) -> Result<(), CommandError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        tracing::warn!(?values, "rejected non-finite motion command");
        Err(CommandError)
    }
}
