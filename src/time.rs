use std::time::{Duration, Instant};

/// Accumulates frame times and reports the average at a fixed interval.
#[derive(Debug)]
pub struct FrameTimer {
    interval: Duration,
    last_frame: Instant,
    window_start: Instant,
    frames: u32,
}

impl FrameTimer {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            interval,
            last_frame: now,
            window_start: now,
            frames: 0,
        }
    }

    /// Records a frame finishing at `now`. Returns the delta since the
    /// previous frame and, once per interval, the average frame time.
    pub fn tick(&mut self, now: Instant) -> (Duration, Option<Duration>) {
        let delta = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return (delta, None);
        }
        let average = elapsed / self.frames.max(1);
        self.window_start = now;
        self.frames = 0;
        (delta, Some(average))
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
