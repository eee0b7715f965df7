//! Interrupt-fed wheel encoder counting.
//!
//! A [`PulseCounter`] is written from the rising-edge handler of the encoder's A channel
//! and read from the control loop. The debounce timestamp and the count are updated
//! together inside one critical section, so a preempting edge can never observe or leave
//! a half-written pair.
//!
//! Counters are `const`-constructible and meant to live in `static`s next to the
//! interrupt handlers that feed them:
//!
//! ```rust
//! use embedded_hal::digital::PinState;
//! use kiwi_core::utils::controllers::encoder::PulseCounter;
//!
//! static M1_ENCODER: PulseCounter = PulseCounter::quadrature(PinState::Low);
//! static M2_ENCODER: PulseCounter = PulseCounter::direction_blind();
//! ```

use core::cell::Cell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embedded_hal::digital::{InputPin, PinState};

use crate::utils::time::{self, Duration, Instant};

/// Edges closer together than this are treated as contact bounce.
pub const DEBOUNCE: Duration = time::micros(200);

/// How an accepted edge moves the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    /// Single channel: every accepted edge counts up.
    Blind,
    /// A second channel is sampled on each edge; `forward` is the level that counts up.
    Quadrature { forward: PinState },
}

/// Result of feeding one rising edge to a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Counted(i32),
    Bounced,
}

#[derive(Clone, Copy)]
struct CounterState {
    count: i32,
    last_edge: Option<Instant>,
}

/// Signed running total of encoder pulses for one wheel.
///
/// The count is an `i32` that wraps on overflow. Consumers take differences with
/// `wrapping_sub`, which stays exact across a wrap as long as fewer than 2^31 pulses
/// arrive between two reads.
pub struct PulseCounter {
    state: Mutex<CriticalSectionRawMutex, Cell<CounterState>>,
    sense: Sense,
    debounce: Duration,
}

impl PulseCounter {
    const fn with_sense(sense: Sense) -> Self {
        Self {
            state: Mutex::new(Cell::new(CounterState {
                count: 0,
                last_edge: None,
            })),
            sense,
            debounce: DEBOUNCE,
        }
    }

    /// Counter for a single-channel encoder.
    pub const fn direction_blind() -> Self {
        Self::with_sense(Sense::Blind)
    }

    /// Counter for an A/B encoder; `forward` is the B level that means forward rotation.
    /// The right level depends on wiring and has to be verified on the real robot.
    pub const fn quadrature(forward: PinState) -> Self {
        Self::with_sense(Sense::Quadrature { forward })
    }

    /// Override the debounce window.
    pub const fn with_debounce(
        mut self,
        debounce: Duration,
    ) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn is_direction_aware(&self) -> bool {
        matches!(self.sense, Sense::Quadrature { .. })
    }

    /// Rising-edge handler body.
    ///
    /// `b_level` is the second channel sampled at the edge, `None` when there is none.
    /// An edge less than the debounce window after the last accepted one leaves the
    /// counter untouched.
    pub fn on_rising_edge(
        &self,
        now: Instant,
        b_level: Option<PinState>,
    ) -> Edge {
        let step = match (self.sense, b_level) {
            (Sense::Quadrature { forward }, Some(level)) if level != forward => -1,
            _ => 1,
        };

        self.state.lock(|cell| {
            let mut state = cell.get();
            if let Some(last) = state.last_edge {
                match time::elapsed(now, last) {
                    Some(dt) if dt >= self.debounce => {}
                    _ => return Edge::Bounced,
                }
            }
            state.count = state.count.wrapping_add(step);
            state.last_edge = Some(now);
            cell.set(state);
            Edge::Counted(step)
        })
    }

    /// Current signed total. Does not modify the counter.
    pub fn get_count(&self) -> i32 {
        self.state.lock(|cell| cell.get().count)
    }

    /// Zero the count. The debounce history is kept.
    pub fn reset(&self) {
        self.state.lock(|cell| {
            let mut state = cell.get();
            state.count = 0;
            cell.set(state);
        })
    }
}

/// A counter paired with the B channel it samples on every A edge.
///
/// This is what a HAL registers as the A pin's rising-edge callback.
pub struct SenseChannel<'a, B> {
    counter: &'a PulseCounter,
    pin_b: B,
}

impl<'a, B> SenseChannel<'a, B>
where
    B: InputPin,
{
    pub fn new(
        counter: &'a PulseCounter,
        pin_b: B,
    ) -> Self {
        Self { counter, pin_b }
    }

    /// Sample B, then count the edge. A failed pin read is returned without counting.
    pub fn on_rising_edge(
        &mut self,
        now: Instant,
    ) -> Result<Edge, B::Error> {
        let level = PinState::from(self.pin_b.is_high()?);
        Ok(self.counter.on_rising_edge(now, Some(level)))
    }

    pub fn counter(&self) -> &'a PulseCounter {
        self.counter
    }

    pub fn release(self) -> B {
        self.pin_b
    }
}
