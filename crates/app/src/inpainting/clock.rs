//! Monotonic frame timestamps.

use std::time::Instant;

use graph_runtime::Timestamp;

/// Hands out strictly increasing microsecond timestamps measured from the
/// moment the clock was created.
#[derive(Debug)]
pub struct FrameClock {
    origin: Instant,
    last: Option<i64>,
}

impl FrameClock {
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self { origin, last: None }
    }

    /// Timestamp for a frame captured now.
    pub fn next(&mut self) -> Timestamp {
        self.stamp(Instant::now())
    }

    /// Timestamp for a frame captured at `at`. Two frames landing on the
    /// same microsecond (or a clock that steps backwards) still get
    /// distinct, increasing values.
    pub fn stamp(&mut self, at: Instant) -> Timestamp {
        let elapsed = at.saturating_duration_since(self.origin).as_micros();
        let mut micros = i64::try_from(elapsed).unwrap_or(i64::MAX);
        if let Some(last) = self.last {
            if micros <= last {
                micros = last.saturating_add(1);
            }
        }
        self.last = Some(micros);
        Timestamp::from_micros(micros)
    }
}
