//! Moving-window throughput in sequences per second

use std::collections::VecDeque;
use std::time::Instant;

/// Source of wall-clock time, in seconds.
pub trait Clock: Send {
    fn now(&mut self) -> f64;
}

/// Monotonic clock anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&mut self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Throughput over a moving window of call-to-call durations.
///
/// Every call to [`Throughput::get_throughput`] covers
/// `batch_size * world_size * grad_accum_usteps * logging_interval` sequences.
#[derive(Debug)]
pub struct Throughput<C: Clock = SystemClock> {
    seqs_per_iteration: usize,
    window_size: usize,
    window: VecDeque<f64>,
    last: f64,
    clock: C,
}

impl Throughput<SystemClock> {
    /// # Arguments
    /// * `batch_size` - Per-worker batch size
    /// * `world_size` - Data-parallel degree
    /// * `grad_accum_usteps` - Microsteps per accumulation step
    /// * `moving_avg_window` - Window length in accumulation steps
    /// * `logging_interval` - Accumulation steps between calls
    pub fn new(
        batch_size: usize,
        world_size: usize,
        grad_accum_usteps: usize,
        moving_avg_window: usize,
        logging_interval: usize,
    ) -> Self {
        Self::with_clock(
            batch_size,
            world_size,
            grad_accum_usteps,
            moving_avg_window,
            logging_interval,
            SystemClock::default(),
        )
    }
}

impl<C: Clock> Throughput<C> {
    pub fn with_clock(
        batch_size: usize,
        world_size: usize,
        grad_accum_usteps: usize,
        moving_avg_window: usize,
        logging_interval: usize,
        mut clock: C,
    ) -> Self {
        let logging_interval = logging_interval.max(1);
        let last = clock.now();
        Self {
            seqs_per_iteration: batch_size * world_size * grad_accum_usteps * logging_interval,
            window_size: moving_avg_window.div_ceil(logging_interval).max(1),
            window: VecDeque::new(),
            last,
            clock,
        }
    }

    pub fn seqs_per_iteration(&self) -> usize {
        self.seqs_per_iteration
    }

    /// Capacity of the moving window, in calls.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Record the time since the previous call and return the windowed throughput.
    ///
    /// Returns 0.0 while the window holds no elapsed time.
    pub fn get_throughput(&mut self) -> f64 {
        let now = self.clock.now();
        let step_time = now - self.last;
        self.last = now;

        self.window.push_back(step_time);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let window_time: f64 = self.window.iter().sum();
        if window_time <= 0.0 {
            return 0.0;
        }
        (self.window.len() * self.seqs_per_iteration) as f64 / window_time
    }
}
