//! Address-events as delivered by the (already decoded, already denoised)
//! upstream sensor pipeline.

use serde::{Deserialize, Serialize};

/// A single sensor sample.
///
/// Timestamps are microseconds. Within one call into the tracker events are
/// expected in non-decreasing timestamp order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub x: u16,
    pub y: u16,
    /// Timestamp in microseconds
    pub timestamp: i64,
    /// `true` = ON (brightness increase), `false` = OFF
    pub polarity: bool,
}

impl Event {
    pub fn new(x: u16, y: u16, timestamp: i64, polarity: bool) -> Self {
        Self {
            x,
            y,
            timestamp,
            polarity,
        }
    }

    #[inline]
    pub fn xf(&self) -> f64 {
        self.x as f64
    }

    #[inline]
    pub fn yf(&self) -> f64 {
        self.y as f64
    }

    /// True when the event lies on a `size_x × size_y` sensor.
    #[inline]
    pub fn in_bounds(&self, size_x: u32, size_y: u32) -> bool {
        (self.x as u32) < size_x && (self.y as u32) < size_y
    }
}

/// Upstream producer of validated, time-ordered events.
pub trait EventSource {
    /// Append the next batch of events to `out`.
    ///
    /// Returns the number of events appended; 0 once the source is exhausted.
    fn next_batch(&mut self, out: &mut Vec<Event>) -> usize;
}
