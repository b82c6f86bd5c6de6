//! timing statistics and periodic timers
//!
//! The [`JitterMeter`](crate::common::jitter_meter::JitterMeter) uses
//! StreamTimeStat to get mean and sigma values on packet inter-arrival
//! times.  The MicroTimer paces the one millisecond tick in the room loop
//! and the periodic status updates.
use std::fmt;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

/// windowed average that tracks mean and sigma of a sample sequence
///
/// The window is a plain circular store so adding a sample is O(1) and
/// nothing allocates after construction.
#[derive(Debug, Deserialize, Serialize)]
pub struct StreamTimeStat {
    window: usize,
    samples: Vec<f64>,
    squares: Vec<f64>,
    head: usize,
    total: f64,
    total_sq: f64,
}

impl StreamTimeStat {
    /// create a new stat collector with a specific window size
    pub fn new(window_size: usize) -> StreamTimeStat {
        StreamTimeStat {
            window: window_size,
            samples: vec![0.0; window_size],
            squares: vec![0.0; window_size],
            head: 0,
            total: 0.0,
            total_sq: 0.0,
        }
    }
    pub fn clear(&mut self) -> () {
        self.samples.fill(0.0);
        self.squares.fill(0.0);
        self.head = 0;
        self.total = 0.0;
        self.total_sq = 0.0;
    }
    pub fn get_mean(&self) -> f64 {
        self.total / self.window as f64
    }
    pub fn get_sigma(&self) -> f64 {
        let mean = self.get_mean();
        let var = self.total_sq / self.window as f64 - mean * mean;
        f64::sqrt(var.max(0.0))
    }
    pub fn get_window(&self) -> usize {
        self.window
    }
    /// add a sample, pushing the oldest one out of the window
    pub fn add_sample(&mut self, sample: f64) -> () {
        self.total += sample - self.samples[self.head];
        self.total_sq += sample * sample - self.squares[self.head];
        self.samples[self.head] = sample;
        self.squares[self.head] = sample * sample;
        self.head = (self.head + 1) % self.window;
    }
}

impl fmt::Display for StreamTimeStat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ mean: {:.3}, sigma: {:.3}, window: {} }}",
            self.get_mean(),
            self.get_sigma(),
            self.get_window()
        )
    }
}


/// Timer with microsecond accuracy to let things know when a certain time
/// (or more) passed
#[derive(Debug)]
pub struct MicroTimer {
    last_time: u128,
    interval: u128,
}

impl MicroTimer {
    /// create a new timer with the current microsecond value and the interval (in microseconds)
    pub fn new(now: u128, interval: u128) -> MicroTimer {
        MicroTimer {
            last_time: now,
            interval: interval,
        }
    }
    pub fn set_interval(&mut self, interval: u128) -> () {
        self.interval = interval;
    }
    /// check if the timer is expired
    pub fn expired(&self, now: u128) -> bool {
        (self.last_time + self.interval) < now
    }
    /// reset the timer to the value of now
    pub fn reset(&mut self, now: u128) {
        self.last_time = now;
    }
    /// Add to the last time to move timer ahead
    pub fn advance(&mut self, delta: u128) {
        self.last_time += delta;
    }
    /// Ask how long since the last time you were reset
    pub fn since(&self, now: u128) -> u128 {
        now - self.last_time
    }
}


/// millisecond tick counter handed to the peer endpoints
///
/// All protocol timing (retransmit schedule, watchdog, RTT) is relative to
/// this counter.  It wraps at 65536 which is fine since every consumer
/// does wrapping subtraction.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    start: Instant,
}

impl TickClock {
    pub fn new() -> TickClock {
        TickClock {
            start: Instant::now(),
        }
    }
    /// current tick, one per millisecond, wrapping
    pub fn ticks(&self) -> u16 {
        (self.start.elapsed().as_millis() & 0xffff) as u16
    }
    /// microseconds since creation, used by MicroTimer consumers
    pub fn micros(&self) -> u128 {
        self.start.elapsed().as_micros()
    }
}
