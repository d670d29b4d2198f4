//! Rolling per-stage wall-time averages for the pipeline overlay.

use std::time::{Duration, Instant};

/// Number of samples folded into each reported average.
const WINDOW: u32 = 20;

/// Tracks a rolling average of wall times for one pipeline stage and formats
/// it as an overlay line such as `PreProc: 2.4ms`.
#[derive(Debug)]
pub struct StageTimer {
    name: &'static str,
    started: Option<Instant>,
    sum: Duration,
    count: u32,
    avg: Option<Duration>,
}

impl StageTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: None,
            sum: Duration::ZERO,
            count: 0,
            avg: None,
        }
    }

    /// Mark the start of one timed section.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the section opened by [`start`](Self::start) and return its
    /// duration. Calling `stop` without `start` records nothing.
    pub fn stop(&mut self) -> Duration {
        let Some(started) = self.started.take() else {
            return Duration::ZERO;
        };
        let elapsed = started.elapsed();
        self.record(elapsed);
        elapsed
    }

    /// Fold an externally measured duration into the average.
    pub fn record(&mut self, elapsed: Duration) {
        self.sum += elapsed;
        self.count += 1;
        if self.count >= WINDOW {
            self.avg = Some(self.sum / self.count);
            self.sum = Duration::ZERO;
            self.count = 0;
        }
    }

    /// Current average: the last full window, or the running partial window
    /// before the first one completes.
    pub fn average(&self) -> Option<Duration> {
        self.avg.or_else(|| {
            (self.count > 0).then(|| self.sum / self.count)
        })
    }

    /// Overlay line, `-` before any sample has been recorded.
    pub fn display(&self) -> String {
        match self.average() {
            Some(avg) => format!("{}: {:.1}ms", self.name, avg.as_secs_f64() * 1e3),
            None => format!("{}: -", self.name),
        }
    }

    /// Forget all samples (used when the pipeline is rebuilt).
    pub fn reset(&mut self) {
        self.started = None;
        self.sum = Duration::ZERO;
        self.count = 0;
        self.avg = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_dash_before_first_sample() {
        let timer = StageTimer::new("Network");
        assert_eq!(timer.display(), "Network: -");
    }

    #[test]
    fn averages_recorded_samples() {
        let mut timer = StageTimer::new("PreProc");
        timer.record(Duration::from_millis(2));
        timer.record(Duration::from_millis(4));
        let avg = timer.average().unwrap();
        assert_eq!(avg, Duration::from_millis(3));
        assert!(timer.display().starts_with("PreProc: 3.0"));
    }

    #[test]
    fn window_folds_and_resets() {
        let mut timer = StageTimer::new("PstProc");
        for _ in 0..WINDOW {
            timer.record(Duration::from_millis(10));
        }
        assert_eq!(timer.average(), Some(Duration::from_millis(10)));
        // next sample starts a fresh window but the old average sticks
        timer.record(Duration::from_millis(2));
        assert_eq!(timer.average(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn reset_clears_state() {
        let mut timer = StageTimer::new("Network");
        timer.record(Duration::from_millis(5));
        timer.reset();
        assert_eq!(timer.display(), "Network: -");
    }
}
