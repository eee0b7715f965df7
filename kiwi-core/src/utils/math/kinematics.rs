//! Kinematics utilities for 3-wheeled kiwi-drive robots.
//!
//! `KiwiKinematics` maps a body-frame velocity command onto target wheel RPMs and
//! inverts measured wheel RPMs back into a body velocity.
//!
//! Frame convention: +X is to the robot's right, +Y is forward. A polar heading of
//! 90° therefore means "straight ahead".
//!
//! # Example
//! ```rust
//! use kiwi_core::utils::math::kinematics::{KiwiKinematics, RobotGeometry};
//! let kin = KiwiKinematics::new(RobotGeometry::default()).unwrap();
//! let target_rpms = kin.holonomic(0.2, 90.0, 0.0);
//! ```
//!
use core::f32::consts::PI;
use core::fmt;
use libm;
use serde::{Deserialize, Serialize};

const DEG_TO_RAD: f32 = PI / 180.0;

/// Fixed mechanical description of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotGeometry {
    /// Wheel diameter (m)
    pub wheel_diameter_m: f32,
    /// Motor revolutions per wheel revolution
    pub gear_ratio: f32,
    /// Encoder pulses per motor revolution
    pub pulses_per_motor_rev: u32,
    /// Robot center-to-wheel distance (m)
    pub wheel_distance_m: f32,
    /// Mounting angle of each wheel (deg)
    pub wheel_angles_deg: [f32; 3],
}

impl Default for RobotGeometry {
    fn default() -> Self {
        Self {
            wheel_diameter_m: 0.06,
            gear_ratio: 30.0,
            pulses_per_motor_rev: 11,
            wheel_distance_m: 0.1,
            wheel_angles_deg: [330.0, 90.0, 210.0],
        }
    }
}

impl RobotGeometry {
    pub fn pulses_per_wheel_rev(&self) -> f32 {
        self.pulses_per_motor_rev as f32 * self.gear_ratio
    }

    pub fn wheel_circumference_m(&self) -> f32 {
        PI * self.wheel_diameter_m
    }

    fn validate(&self) -> Result<(), GeometryError> {
        fn positive(v: f32) -> bool {
            v.is_finite() && v > 0.0
        }

        if !positive(self.wheel_diameter_m) {
            return Err(GeometryError::WheelDiameter);
        }
        if !positive(self.gear_ratio) {
            return Err(GeometryError::GearRatio);
        }
        if self.pulses_per_motor_rev == 0 {
            return Err(GeometryError::PulsesPerRevolution);
        }
        if !positive(self.wheel_distance_m) {
            return Err(GeometryError::WheelDistance);
        }
        if self.wheel_angles_deg.iter().any(|a| !a.is_finite()) {
            return Err(GeometryError::WheelAngles);
        }
        Ok(())
    }
}

/// Reasons a [`RobotGeometry`] cannot drive a kiwi base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    WheelDiameter,
    GearRatio,
    PulsesPerRevolution,
    WheelDistance,
    WheelAngles,
    /// The wheel layout cannot produce every body velocity (e.g. two wheels share an axis).
    SingularLayout,
}

impl fmt::Display for GeometryError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            GeometryError::WheelDiameter => f.write_str("wheel diameter must be positive"),
            GeometryError::GearRatio => f.write_str("gear ratio must be positive"),
            GeometryError::PulsesPerRevolution => {
                f.write_str("pulses per revolution must be non-zero")
            }
            GeometryError::WheelDistance => f.write_str("wheel distance must be positive"),
            GeometryError::WheelAngles => f.write_str("wheel angles must be finite"),
            GeometryError::SingularLayout => f.write_str("wheel layout is singular"),
        }
    }
}

/// Represents the kinematics of a three-wheeled kiwi-drive robot.
#[derive(Debug, Clone)]
pub struct KiwiKinematics {
    geometry: RobotGeometry,
    /// Precomputed wheel mounting angles (rad)
    wheel_angles: [f32; 3],
    /// Inverse of the rim-speed Jacobian, cached for `body_velocity`
    inverse: [[f32; 3]; 3],
}

impl KiwiKinematics {
    /// Validate `geometry` and precompute the wheel Jacobian.
    ///
    /// Fails fast on a geometry no controller could use.
    pub fn new(geometry: RobotGeometry) -> Result<Self, GeometryError> {
        geometry.validate()?;
        let wheel_angles = geometry.wheel_angles_deg.map(|a| a * DEG_TO_RAD);
        let jacobian = construct_jacobian(&geometry, &wheel_angles);
        let inverse = invert_3x3(jacobian).ok_or(GeometryError::SingularLayout)?;
        Ok(Self {
            geometry,
            wheel_angles,
            inverse,
        })
    }

    pub fn geometry(&self) -> &RobotGeometry {
        &self.geometry
    }

    /// Split a polar motion command into body-frame `(vx, vy)`.
    ///
    /// `angle` is in degrees, 0° = right, 90° = forward, increasing CCW.
    pub fn polar_to_body(
        speed: f32,
        angle: f32,
    ) -> (f32, f32) {
        let a = angle * DEG_TO_RAD;
        (speed * libm::cosf(a), speed * libm::sinf(a))
    }

    /// Target wheel RPMs for a heading-and-speed command with rotation `omega` (deg/s).
    pub fn holonomic(
        &self,
        speed: f32,
        angle: f32,
        omega: f32,
    ) -> [f32; 3] {
        let (vx, vy) = Self::polar_to_body(speed, angle);
        self.wheel_rpms(vx, vy, omega)
    }

    /// Target wheel RPMs for explicit body velocities (m/s) and rotation `omega` (deg/s).
    pub fn non_holonomic(
        &self,
        vx: f32,
        vy: f32,
        omega: f32,
    ) -> [f32; 3] {
        self.wheel_rpms(vx, vy, omega)
    }

    /// Shared transform: each wheel's rim speed is the body velocity projected on the
    /// wheel's drive direction plus the rotational component, converted to RPM.
    pub fn wheel_rpms(
        &self,
        vx: f32,
        vy: f32,
        omega: f32,
    ) -> [f32; 3] {
        fn clamp_small(
            v: f32,
            eps: f32,
        ) -> f32 {
            if v.abs() < eps {
                0.0
            } else {
                v
            }
        }

        let w = omega * DEG_TO_RAD;
        let l = self.geometry.wheel_distance_m;
        let circumference = self.geometry.wheel_circumference_m();
        let mut out = [0.0; 3];
        for (i, &t) in self.wheel_angles.iter().enumerate() {
            let linear = -libm::sinf(t) * vx + libm::cosf(t) * vy + l * w;
            out[i] = clamp_small(linear / circumference * 60.0, 1e-6);
        }
        out
    }

    /// Recover the body velocity implied by measured wheel RPMs.
    ///
    /// # Returns
    ///
    /// `(vx, vy, omega)` with `vx`/`vy` in m/s and `omega` in deg/s.
    pub fn body_velocity(
        &self,
        wheel_rpms: [f32; 3],
    ) -> (f32, f32, f32) {
        let circumference = self.geometry.wheel_circumference_m();
        let rim = wheel_rpms.map(|rpm| rpm * circumference / 60.0);
        let m = &self.inverse;
        let row = |r: usize| m[r][0] * rim[0] + m[r][1] * rim[1] + m[r][2] * rim[2];
        (row(0), row(1), row(2) / DEG_TO_RAD)
    }
}

/// Convert a pulse-count delta over `dt_s` seconds into wheel RPM.
///
/// Degenerate timing (`dt_s <= 0`) reads as no measurable motion.
pub fn estimate_rpm(
    pulse_delta: i32,
    dt_s: f32,
    pulses_per_wheel_rev: f32,
) -> f32 {
    if dt_s <= 0.0 {
        return 0.0;
    }
    let revolutions = pulse_delta as f32 / pulses_per_wheel_rev;
    revolutions / dt_s * 60.0
}

/// Build J such that rim_speeds = J * [vx, vy, ω (rad/s)]
fn construct_jacobian(
    geometry: &RobotGeometry,
    wheel_angles: &[f32; 3],
) -> [[f32; 3]; 3] {
    let l = geometry.wheel_distance_m;
    let mut j = [[0.0; 3]; 3];
    for (i, &t) in wheel_angles.iter().enumerate() {
        j[i][0] = -libm::sinf(t);
        j[i][1] = libm::cosf(t);
        j[i][2] = l;
    }
    j
}

/// Invert a 3×3 matrix using cofactor expansion, `None` if it is (near) singular.
fn invert_3x3(m: [[f32; 3]; 3]) -> Option<[[f32; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if !det.is_finite() || det.abs() < 1e-6 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            -(m[0][1] * m[2][2] - m[0][2] * m[2][1]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            -(m[1][0] * m[2][2] - m[1][2] * m[2][0]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            -(m[0][0] * m[1][2] - m[0][2] * m[1][0]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            -(m[0][0] * m[2][1] - m[0][1] * m[2][0]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}
