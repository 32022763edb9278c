//! Per-stage timing and frame rate logging.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::filter::{Ema, Filter};

/// Weight of the newest sample in the moving average.
const SMOOTHING: f32 = 0.1;

/// Measures how long an operation takes, as an exponential moving average.
pub struct Timer {
    name: &'static str,
    avg: Ema,
    last_ms: Option<f32>,
    samples: u32,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            avg: Ema::new(SMOOTHING),
            last_ms: None,
            samples: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs `timee` and records its duration.
    pub fn time<T>(&mut self, timee: impl FnOnce() -> T) -> T {
        let _guard = self.start();
        timee()
    }

    /// Starts a measurement that ends when the returned [`TimerGuard`] goes out of scope.
    pub fn start(&mut self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Averaged duration in milliseconds, or `None` if nothing was timed yet.
    pub fn average_ms(&self) -> Option<f32> {
        self.last_ms
    }

    /// Number of samples recorded since the last [`Timer::reset`].
    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn reset(&mut self) {
        self.avg.reset();
        self.last_ms = None;
        self.samples = 0;
    }

    fn record(&mut self, duration: Duration) {
        let ms = duration.as_secs_f32() * 1000.0;
        self.last_ms = Some(self.avg.push(ms));
        self.samples += 1;
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_ms {
            Some(ms) => write!(f, "{}: {}x{ms:.01}ms", self.name, self.samples),
            None => write!(f, "{}: -", self.name),
        }
    }
}

/// Records the elapsed time into its [`Timer`] on drop.
pub struct TimerGuard<'a> {
    start: Instant,
    timer: &'a mut Timer,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Logs frames per second, together with a summary of stage timers.
pub struct FpsCounter {
    name: String,
    frames: u32,
    start: Instant,
}

impl FpsCounter {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            frames: 0,
            start: Instant::now(),
        }
    }

    /// Counts a frame. Logs the frame rate once per second.
    pub fn tick(&mut self) {
        self.tick_with(std::iter::empty::<&Timer>());
    }

    /// Counts a frame. Once per second, logs the frame rate along with `timers`.
    ///
    /// Returns the measured rate whenever a line was logged.
    pub fn tick_with<'a, I: IntoIterator<Item = &'a Timer>>(&mut self, timers: I) -> Option<u32> {
        self.frames += 1;
        if self.start.elapsed() < Duration::from_secs(1) {
            return None;
        }

        let timers = timers
            .into_iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>();
        if timers.is_empty() {
            log::debug!("{}: {} FPS", self.name, self.frames);
        } else {
            log::debug!("{}: {} FPS ({})", self.name, self.frames, timers.join(", "));
        }

        let fps = self.frames;
        self.frames = 0;
        self.start = Instant::now();
        Some(fps)
    }
}
