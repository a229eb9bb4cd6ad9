use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::packet::SAMPLE_LEN;

/// Throughput tracker for the streaming loop, with both *all-time* counters
/// and a *sliding 1 s window* rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time received samples (rows x channels).
    pub total_samples: u64,
    /// All-time number of packets.
    pub n_packets: u64,
    /// Time when this counter was created or last reset.
    pub t_begin: Instant,

    window: Duration,
    packets: VecDeque<(Instant, u64)>,
    samples_in_window: u64,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_samples: 0,
            n_packets: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            packets: VecDeque::new(),
            samples_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in Msps.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_samples as f64 / secs / 1e6
    }

    /// Sliding-window rate over the last second, in Msps.
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.samples_in_window as f64 / secs / 1e6
    }

    /// Sliding-window rate in MB/s of wire data.
    pub fn byte_rate(&self) -> f64 {
        self.rate() * 1e6 * SAMPLE_LEN as f64 / (1024.0 * 1024.0)
    }

    /// Record one packet worth of `samples` flattened samples.
    pub fn increment(&mut self, samples: u64) {
        let now = Instant::now();

        self.total_samples += samples;
        self.n_packets += 1;

        self.packets.push_back((now, samples));
        self.samples_in_window += samples;

        while let Some(&(ts, n)) = self.packets.front() {
            if now.duration_since(ts) > self.window {
                self.packets.pop_front();
                self.samples_in_window -= n;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_samples = 0;
        self.n_packets = 0;
        self.t_begin = Instant::now();
        self.packets.clear();
        self.samples_in_window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let mut c = Counter::new();
        c.increment(1000);
        c.increment(500);
        assert_eq!(c.total_samples, 1500);
        assert_eq!(c.n_packets, 2);
        assert!(c.rate() > 0.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut c = Counter::new();
        c.increment(1000);
        c.reset();
        assert_eq!(c.total_samples, 0);
        assert_eq!(c.n_packets, 0);
        assert_eq!(c.rate(), 0.0);
    }
}
