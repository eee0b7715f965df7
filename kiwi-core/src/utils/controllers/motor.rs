//! H-bridge DC motor actuation.
//!
//! Each wheel motor is driven through two direction lines (IN1/IN2) and one PWM enable
//! channel. Exactly one direction line is high while the motor is driven; both are low
//! when it is stopped.

use core::fmt;

use embedded_hal::{digital::OutputPin, pwm::SetDutyCycle};

/// A drive request for one motor.
///
/// The sign selects the direction, the magnitude the intensity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriveCommand {
    /// Fraction of full duty in `[-1.0, 1.0]`; larger magnitudes saturate.
    Normalized(f32),
    /// Duty in raw PWM units; magnitudes above the channel maximum saturate.
    Raw(f32),
}

impl DriveCommand {
    /// Unsigned duty for a channel whose maximum is `max_duty`.
    ///
    /// Non-finite commands map to zero duty.
    pub fn duty(
        self,
        max_duty: u16,
    ) -> u16 {
        let max = max_duty as f32;
        let scaled = match self {
            DriveCommand::Normalized(v) if v.is_finite() => v.abs().min(1.0) * max,
            DriveCommand::Raw(v) if v.is_finite() => v.abs().min(max),
            _ => 0.0,
        };
        libm::roundf(scaled) as u16
    }

    pub fn is_reverse(self) -> bool {
        match self {
            DriveCommand::Normalized(v) | DriveCommand::Raw(v) => v < 0.0,
        }
    }
}

/// Which direction line is currently asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotorDirection {
    Forward,
    Reverse,
    #[default]
    Stopped,
}

/// What the robot controller needs from a wheel motor.
pub trait WheelDrive {
    type Error: fmt::Debug;

    fn drive(
        &mut self,
        command: DriveCommand,
    ) -> Result<(), Self::Error>;

    /// Both direction lines low, zero duty.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// Largest raw duty the motor accepts.
    fn max_duty(&self) -> u16;
}

/// Failure of one of the actuator's hardware lines.
#[derive(Debug)]
pub enum DriveError<PwmE, PinE> {
    Pwm(PwmE),
    Direction(PinE),
}

impl<PwmE: fmt::Debug, PinE: fmt::Debug> fmt::Display for DriveError<PwmE, PinE> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            DriveError::Pwm(e) => write!(f, "PWM channel error: {:?}", e),
            DriveError::Direction(e) => write!(f, "direction line error: {:?}", e),
        }
    }
}

/// One DC motor behind an H-bridge.
pub struct DriveActuator<PWM, DIR> {
    en: PWM,
    in1: DIR,
    in2: DIR,
    max_duty: u16,
    duty: u16,
    direction: MotorDirection,
}

impl<PWM, DIR> DriveActuator<PWM, DIR>
where
    PWM: SetDutyCycle,
    DIR: OutputPin,
{
    /// Take ownership of the lines and leave the motor stopped.
    ///
    /// The PWM frequency is whatever the channel was configured with.
    pub fn new(
        en: PWM,
        in1: DIR,
        in2: DIR,
    ) -> Result<Self, DriveError<PWM::Error, DIR::Error>> {
        let max_duty = en.max_duty_cycle();
        let mut motor = Self {
            en,
            in1,
            in2,
            max_duty,
            duty: 0,
            direction: MotorDirection::Stopped,
        };
        motor.halt()?;
        Ok(motor)
    }

    /// Drive at a fraction of full duty in `[-1.0, 1.0]`.
    pub fn set_normalized_duty(
        &mut self,
        value: f32,
    ) -> Result<(), DriveError<PWM::Error, DIR::Error>> {
        self.apply(DriveCommand::Normalized(value))
    }

    /// Drive at a raw duty, sign selecting the direction.
    pub fn set_raw_duty(
        &mut self,
        value: f32,
    ) -> Result<(), DriveError<PWM::Error, DIR::Error>> {
        self.apply(DriveCommand::Raw(value))
    }

    pub fn duty(&self) -> u16 {
        self.duty
    }

    pub fn direction(&self) -> MotorDirection {
        self.direction
    }

    /// Hand the lines back, e.g. to reconfigure the PWM timer.
    pub fn release(self) -> (PWM, DIR, DIR) {
        (self.en, self.in1, self.in2)
    }

    fn apply(
        &mut self,
        command: DriveCommand,
    ) -> Result<(), DriveError<PWM::Error, DIR::Error>> {
        let duty = command.duty(self.max_duty);
        if duty == 0 {
            return self.halt();
        }

        if command.is_reverse() {
            self.in1.set_low().map_err(DriveError::Direction)?;
            self.in2.set_high().map_err(DriveError::Direction)?;
            self.direction = MotorDirection::Reverse;
        } else {
            self.in1.set_high().map_err(DriveError::Direction)?;
            self.in2.set_low().map_err(DriveError::Direction)?;
            self.direction = MotorDirection::Forward;
        }
        self.en.set_duty_cycle(duty).map_err(DriveError::Pwm)?;
        self.duty = duty;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), DriveError<PWM::Error, DIR::Error>> {
        self.in1.set_low().map_err(DriveError::Direction)?;
        self.in2.set_low().map_err(DriveError::Direction)?;
        self.direction = MotorDirection::Stopped;
        self.en.set_duty_cycle(0).map_err(DriveError::Pwm)?;
        self.duty = 0;
        Ok(())
    }
}

impl<PWM, DIR> WheelDrive for DriveActuator<PWM, DIR>
where
    PWM: SetDutyCycle,
    DIR: OutputPin,
{
    type Error = DriveError<PWM::Error, DIR::Error>;

    fn drive(
        &mut self,
        command: DriveCommand,
    ) -> Result<(), Self::Error> {
        self.apply(command)
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.halt()
    }

    fn max_duty(&self) -> u16 {
        self.max_duty
    }
}
