//! Time sources
//!
//! Readings carry two timestamps: a monotonic offset from process start
//! (used for the motion settle window) and the local wall clock (published).

use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the process started
    fn uptime(&self) -> Duration;

    fn wall(&self) -> DateTime<Local>;
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_count_uptime_from_start() {
        let clock = SystemClock::start();
        let first = clock.uptime();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.uptime() >= first + Duration::from_millis(5));
    }

    #[test]
    fn should_return_current_wall_time() {
        let clock = SystemClock::start();
        let before = Local::now();
        let wall = clock.wall();
        assert!(wall >= before);
        assert!(wall <= Local::now());
    }
}
