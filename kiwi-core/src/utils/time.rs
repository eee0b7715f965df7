//! Monotonic time as seen by the control core.
//!
//! Timestamps are 32-bit microsecond ticks, the width a typical MCU timer hands out.
//! They wrap roughly every 71.6 minutes; [`elapsed`] stays correct across a wrap as
//! long as the two instants are less than half the range apart.

use fugit::{MicrosDurationU32, TimerInstantU32};

/// A microsecond instant from the monotonic clock.
pub type Instant = TimerInstantU32<1_000_000>;
/// A span between two [`Instant`]s.
pub type Duration = MicrosDurationU32;

pub const fn micros(us: u32) -> Duration {
    Duration::from_ticks(us)
}

/// Saturates at the largest representable span rather than wrapping.
pub const fn millis(ms: u32) -> Duration {
    Duration::from_ticks(ms.saturating_mul(1_000))
}

/// Time from `earlier` to `now`, or `None` if `now` is not after `earlier`
/// (clock moved backwards, or the gap exceeds half the counter range).
pub fn elapsed(
    now: Instant,
    earlier: Instant,
) -> Option<Duration> {
    now.checked_duration_since(earlier)
}

/// Seconds in `d` as a float, for rate computations.
pub fn as_secs_f32(d: Duration) -> f32 {
    d.ticks() as f32 / 1_000_000.0
}
