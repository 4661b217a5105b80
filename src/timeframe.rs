// =============================================================================
// Timeframe generation — the finite frame sequence a backtest replays
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Interval;

/// A named, bounded, fixed-interval span of frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeframe {
    pub name: String,
    /// Inclusive start, Unix milliseconds UTC.
    pub start_ms: i64,
    /// Inclusive end, Unix milliseconds UTC.
    pub end_ms: i64,
    pub interval: Interval,
}

impl Timeframe {
    pub fn new(name: impl Into<String>, start_ms: i64, end_ms: i64, interval: Interval) -> Self {
        Self {
            name: name.into(),
            start_ms,
            end_ms,
            interval,
        }
    }

    /// Generate the sorted frame sequence `[start, end]` stepped by the
    /// interval. An inverted range produces no frames.
    pub fn frames(&self) -> Vec<i64> {
        let step = self.interval.as_millis();
        if self.end_ms < self.start_ms || step <= 0 {
            return Vec::new();
        }
        let count = ((self.end_ms - self.start_ms) / step + 1) as usize;
        let mut frames = Vec::with_capacity(count);
        let mut ts = self.start_ms;
        while ts <= self.end_ms {
            frames.push(ts);
            ts += step;
        }
        frames
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inclusive_minute_frames() {
        let tf = Timeframe::new("jan-first-five", 0, 240_000, Interval::OneMinute);
        let frames = tf.frames();
        assert_eq!(frames, vec![0, 60_000, 120_000, 180_000, 240_000]);
    }

    #[test]
    fn unaligned_end_is_not_overshot() {
        let tf = Timeframe::new("ragged", 0, 150_000, Interval::OneMinute);
        let frames = tf.frames();
        assert_eq!(frames.last(), Some(&120_000));
    }

    #[test]
    fn inverted_range_is_empty() {
        let tf = Timeframe::new("empty", 100, 0, Interval::OneMinute);
        assert!(tf.frames().is_empty());
    }

    #[test]
    fn frames_are_strictly_increasing() {
        let tf = Timeframe::new("hourly", 0, 7_200_000, Interval::OneHour);
        let frames = tf.frames();
        assert!(frames.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(frames.len(), 3);
    }
}
