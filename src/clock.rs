// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::time::{Duration, Instant};

/// Time source for the protocol's fixed delays and the handshake status timer
pub trait Clock: Send {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ============================================================================
// Mock Clock for Testing
// ============================================================================

#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Virtual clock: `sleep` advances time instantly
#[cfg(test)]
#[derive(Clone)]
pub struct MockClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

#[cfg(test)]
impl MockClock {
    pub fn new() -> Self {
        MockClock {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advances_on_sleep() {
        let clock = MockClock::new();
        let start = clock.now();
        let shared = clock.clone();

        shared.sleep(Duration::from_millis(100));
        shared.sleep(Duration::from_secs(2));

        assert_eq!(clock.elapsed(), Duration::from_millis(2100));
        assert_eq!(clock.now().duration_since(start), Duration::from_millis(2100));
    }
}
