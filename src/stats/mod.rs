//! Lock-free statistics that feed routing and limiting decisions.
//!
//! All structures read time from a [`Clock`](crate::clock::Clock) so tests can
//! drive them with simulated time.

mod decay;
mod timers;
mod window;

pub use decay::DecayingCounter;
pub use timers::{RunningTimer, RunningTimers};
pub use window::SlidingWindow;
