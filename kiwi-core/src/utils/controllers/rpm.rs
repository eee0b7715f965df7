//! Proportional wheel-speed control.
//!
//! The error is not integrated, so there is no windup to manage: the output is a pure
//! function of the current target and measurement.

/// P controller mapping RPM error onto a raw drive command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpmController {
    kp: f32,
    limit: f32,
}

impl RpmController {
    /// `limit` is the largest output magnitude, normally the actuator's max duty.
    pub fn new(
        kp: f32,
        limit: f32,
    ) -> Self {
        Self {
            kp,
            limit: limit.abs(),
        }
    }

    pub fn kp(&self) -> f32 {
        self.kp
    }

    pub fn set_kp(
        &mut self,
        kp: f32,
    ) {
        self.kp = kp;
    }

    /// `kp * (target - current)`, clamped to `±limit`.
    pub fn output(
        &self,
        target_rpm: f32,
        current_rpm: f32,
    ) -> f32 {
        let error = target_rpm - current_rpm;
        (self.kp * error).clamp(-self.limit, self.limit)
    }
}
