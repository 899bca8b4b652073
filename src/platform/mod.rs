//! Platform abstraction (§4.12, §5): the two primitives the event loop
//! supplies to a [`crate::Stack`] — frame I/O and monotonic time — kept as
//! traits so the protocol core never depends on a real NIC or a real
//! clock. Two implementations ship in this crate: [`sim::SimMedium`]
//! (always available, used by the integration test suite) and
//! [`tap::TapDevice`] (Linux-only, behind the `tap` feature).

pub mod sim;
#[cfg(feature = "tap")]
pub mod tap;

use crate::error::Result;

/// Link state as reported by a driver (§6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkState {
    Up,
    Down,
}

/// The layer-2 driver contract (§6): send a complete Ethernet frame and
/// report link state. Receiving is the other direction — the event loop
/// calls [`crate::Stack::receive_frame`] when the driver has one, rather
/// than the stack pulling from the driver, so this trait only needs the
/// send half plus a state query.
pub trait L2Driver {
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
    fn link_state(&self) -> LinkState;
}

/// Monotonic time and one-shot timers (§5, §6). `now_ms` is the only
/// thing the protocol core actually needs to read; timer *registration*
/// in this crate is cooperative (every public entry point is expected to
/// be re-driven by the host's event loop, which calls `Stack::poll`
/// periodically) rather than requiring the platform to schedule wakeups
/// itself — see the design note on "no locks, no threads" in §5.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// A `Clock` backed by `std::time::Instant`, shared by both the `sim` and
/// `tap` platforms so neither re-derives monotonic-time plumbing.
#[derive(Clone)]
pub struct MonotonicClock {
    start: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock { start: std::time::Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
