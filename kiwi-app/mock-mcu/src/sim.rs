//! Simulated hardware for the kiwi-drive core.
//!
//! Stands in for the MCU peripherals: three PWM enable channels, six H-bridge direction
//! lines and three encoder B channels, all backed by a first-order DC motor model per
//! wheel. The encoder task steps the model and reports the rising edges it produced.

use core::cell::RefCell;
use std::convert::Infallible;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embedded_hal::{
    digital::{self, InputPin, OutputPin, PinState},
    pwm::{self, SetDutyCycle},
};
use kiwi_core::utils::math::RobotGeometry;

/// Full-scale duty of the simulated PWM channels.
pub const MAX_DUTY: u16 = 65535;
/// Wheel speed at full duty (rpm).
const NO_LOAD_WHEEL_RPM: f32 = 200.0;
/// Motor time constant (s).
const TAU_S: f32 = 0.08;

#[derive(Clone, Copy)]
struct WheelPlant {
    duty: u16,
    in1: bool,
    in2: bool,
    rpm: f32,
    /// Fraction of the way to the next encoder pulse
    phase: f32,
}

impl WheelPlant {
    const fn new() -> Self {
        Self {
            duty: 0,
            in1: false,
            in2: false,
            rpm: 0.0,
            phase: 0.0,
        }
    }

    fn drive(&self) -> f32 {
        let level = self.duty as f32 / MAX_DUTY as f32;
        match (self.in1, self.in2) {
            (true, false) => level,
            (false, true) => -level,
            _ => 0.0,
        }
    }
}

static PLANT: Mutex<CriticalSectionRawMutex, RefCell<[WheelPlant; 3]>> =
    Mutex::new(RefCell::new([WheelPlant::new(); 3]));

fn with_wheel<R>(
    wheel: usize,
    f: impl FnOnce(&mut WheelPlant) -> R,
) -> R {
    PLANT.lock(|plant| f(&mut plant.borrow_mut()[wheel]))
}

/// Advance every wheel by `dt_s` seconds.
///
/// Returns, per wheel, the offsets (fraction of `dt_s`, in `[0, 1)`) at which encoder
/// A edges occurred during the step.
pub fn step(
    dt_s: f32,
    geometry: &RobotGeometry,
) -> [Vec<f32>; 3] {
    let pulses_per_rev = geometry.pulses_per_wheel_rev();
    PLANT.lock(|plant| {
        let mut plant = plant.borrow_mut();
        core::array::from_fn(|i| {
            let w = &mut plant[i];
            let target = w.drive() * NO_LOAD_WHEEL_RPM;
            w.rpm += (target - w.rpm) * (dt_s / TAU_S).min(1.0);

            let pulses = w.rpm.abs() / 60.0 * pulses_per_rev * dt_s;
            let mut edges = Vec::new();
            if pulses > 0.0 {
                let start = w.phase;
                w.phase += pulses;
                let mut next = 1.0;
                while w.phase >= next {
                    edges.push(((next - start) / pulses).clamp(0.0, 0.999));
                    next += 1.0;
                }
                w.phase -= next - 1.0;
            }
            edges
        })
    })
}

/// Modelled wheel speeds (rpm), for comparison against the estimator.
pub fn wheel_rpms() -> [f32; 3] {
    PLANT.lock(|plant| (*plant.borrow()).map(|w| w.rpm))
}

/// PWM enable channel of one wheel.
pub struct SimPwm {
    wheel: usize,
}

impl SimPwm {
    /// The carrier frequency only matters to real hardware; it is logged here.
    pub fn new(
        wheel: usize,
        frequency_hz: u32,
    ) -> Self {
        tracing::debug!(wheel, frequency_hz, "PWM channel configured");
        Self { wheel }
    }
}

impl pwm::ErrorType for SimPwm {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm {
    fn max_duty_cycle(&self) -> u16 {
        MAX_DUTY
    }

    fn set_duty_cycle(
        &mut self,
        duty: u16,
    ) -> Result<(), Self::Error> {
        with_wheel(self.wheel, |w| w.duty = duty);
        Ok(())
    }
}

#[derive(Clone, Copy)]
pub enum Line {
    In1,
    In2,
}

/// H-bridge direction line of one wheel.
pub struct SimDirPin {
    wheel: usize,
    line: Line,
}

impl SimDirPin {
    pub fn new(
        wheel: usize,
        line: Line,
    ) -> Self {
        Self { wheel, line }
    }

    fn set(
        &mut self,
        high: bool,
    ) {
        let line = self.line;
        with_wheel(self.wheel, |w| match line {
            Line::In1 => w.in1 = high,
            Line::In2 => w.in2 = high,
        });
    }
}

impl digital::ErrorType for SimDirPin {
    type Error = Infallible;
}

impl OutputPin for SimDirPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(true);
        Ok(())
    }
}

/// Encoder B channel: reads `forward` while the wheel turns forward, the opposite
/// level otherwise.
pub struct SimSensePin {
    wheel: usize,
    forward: PinState,
}

impl SimSensePin {
    pub fn new(
        wheel: usize,
        forward: PinState,
    ) -> Self {
        Self { wheel, forward }
    }

    fn level(&self) -> PinState {
        if with_wheel(self.wheel, |w| w.rpm >= 0.0) {
            self.forward
        } else {
            !self.forward
        }
    }
}

impl digital::ErrorType for SimSensePin {
    type Error = Infallible;
}

impl InputPin for SimSensePin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level() == PinState::High)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level() == PinState::Low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The plant is process-global, so everything touching it lives in one test.
    #[test]
    fn plant_spins_up_and_emits_edges() {
        let geometry = RobotGeometry::default();
        let mut pwm = SimPwm::new(0, 10_000);
        let mut in1 = SimDirPin::new(0, Line::In1);
        let mut in2 = SimDirPin::new(0, Line::In2);
        in1.set_high().unwrap();
        in2.set_low().unwrap();
        pwm.set_duty_cycle(MAX_DUTY).unwrap();

        let mut edges = 0;
        for _ in 0..1_000 {
            let step_edges = step(0.001, &geometry);
            assert!(step_edges[0].iter().all(|&f| (0.0..1.0).contains(&f)));
            assert!(step_edges[1].is_empty());
            edges += step_edges[0].len();
        }
        let rpm = wheel_rpms()[0];
        assert!((rpm - NO_LOAD_WHEEL_RPM).abs() < 1.0);
        // roughly 1 s of spin-up at up to 200 rpm over 330 pulses per rev
        assert!(edges > 900 && edges < 1_150, "{} edges", edges);

        let mut b = SimSensePin::new(0, PinState::Low);
        assert!(b.is_low().unwrap());
        in1.set_low().unwrap();
        in2.set_high().unwrap();
        for _ in 0..1_000 {
            step(0.001, &geometry);
        }
        assert!(wheel_rpms()[0] < 0.0);
        assert!(b.is_high().unwrap());
    }
}
