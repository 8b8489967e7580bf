//! Monotonic time source shared by tasks and state tables

use std::time::{Duration, Instant};

/// Monotonic clock with a fixed origin; times are reported in seconds relative to it
#[derive(Debug, Clone, Copy)]
pub struct TimeServer {
    origin: Instant,
}

impl Default for TimeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeServer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn with_origin(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Seconds elapsed since the origin
    pub fn relative_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Convert an instant to seconds relative to the origin (negative if earlier)
    pub fn to_relative(&self, instant: Instant) -> f64 {
        if instant >= self.origin {
            (instant - self.origin).as_secs_f64()
        } else {
            -(self.origin - instant).as_secs_f64()
        }
    }

    /// Block the calling thread until `deadline`. Returns immediately if it already passed.
    pub fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }

    pub fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
