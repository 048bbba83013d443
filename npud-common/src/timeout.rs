// Copyright 2024-Present the npu-runtime-diagnostics authors
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

/// Tracks how much of a fixed time budget remains across a sequence of
/// bounded waits. The remaining budget never reports below a small floor so
/// that a final cleanup step (e.g. reaping a child) always gets a chance to
/// run even when the budget is already spent.
pub struct TimeoutManager {
    start_time: Instant,
    timeout: Duration,
}

impl TimeoutManager {
    // A few scheduler slices; enough for one last wait attempt.
    const MINIMUM_FLOOR: Duration = Duration::from_millis(160);

    pub fn new(timeout: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        let elapsed = self.start_time.elapsed();
        if elapsed >= self.timeout {
            Self::MINIMUM_FLOOR
        } else {
            (self.timeout - elapsed).max(Self::MINIMUM_FLOOR)
        }
    }

    pub fn expired(&self) -> bool {
        self.start_time.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_respects_floor() {
        let manager = TimeoutManager::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(manager.expired());
        assert_eq!(manager.remaining(), TimeoutManager::MINIMUM_FLOOR);
    }

    #[test]
    fn elapsed_advances() {
        let manager = TimeoutManager::new(Duration::from_secs(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.elapsed() >= Duration::from_millis(10));
        assert!(!manager.expired());
        assert!(manager.remaining() <= Duration::from_secs(5));
    }
}
