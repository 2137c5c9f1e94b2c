use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which per-user frequency ceiling a send would exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyExceeded {
    Hourly { count: u32, limit: u32 },
    Daily { count: u32, limit: u32 },
}

/// Sliding-window frequency limiter keyed by user.
///
/// Keeps the send instants of the trailing 24 hours per user; the hourly
/// count is derived from the same window. Checking never consumes quota,
/// `record` does. Not synchronized; the admission filter wraps it in its
/// own lock.
pub struct FrequencyLimiter {
    max_per_hour: u32,
    max_per_day: u32,
    sends: HashMap<String, VecDeque<Instant>>,
}

impl FrequencyLimiter {
    pub fn new(max_per_hour: u32, max_per_day: u32) -> Self {
        Self {
            max_per_hour,
            max_per_day,
            sends: HashMap::new(),
        }
    }

    /// Check both windows without consuming quota. Returns the first
    /// ceiling the next send would exceed, daily checked before hourly.
    pub fn check(&mut self, key: &str, now: Instant) -> Option<FrequencyExceeded> {
        let (max_per_hour, max_per_day) = (self.max_per_hour, self.max_per_day);
        self.check_within(key, now, max_per_hour, max_per_day)
    }

    /// Like `check` but against caller-supplied ceilings; used for
    /// per-kind caps that differ from the user-wide ones.
    pub fn check_within(
        &mut self,
        key: &str,
        now: Instant,
        max_per_hour: u32,
        max_per_day: u32,
    ) -> Option<FrequencyExceeded> {
        let (hour_count, day_count) = self.counts(key, now);
        if day_count >= max_per_day {
            return Some(FrequencyExceeded::Daily {
                count: day_count,
                limit: max_per_day,
            });
        }
        if hour_count >= max_per_hour {
            return Some(FrequencyExceeded::Hourly {
                count: hour_count,
                limit: max_per_hour,
            });
        }
        None
    }

    /// Count one send against the key's windows.
    pub fn record(&mut self, key: &str, now: Instant) {
        self.sends
            .entry(key.to_string())
            .or_default()
            .push_back(now);
    }

    /// (sends in the last hour, sends in the last day), pruning entries
    /// that fell out of the daily window.
    pub fn counts(&mut self, key: &str, now: Instant) -> (u32, u32) {
        let Some(window) = self.sends.get_mut(key) else {
            return (0, 0);
        };
        while window
            .front()
            .is_some_and(|&t| now.duration_since(t) >= DAY)
        {
            window.pop_front();
        }
        let day_count = window.len() as u32;
        let hour_count = window
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < HOUR)
            .count() as u32;
        (hour_count, day_count)
    }

    /// Drop users whose whole window has aged out.
    pub fn sweep(&mut self, now: Instant) {
        self.sends.retain(|_, window| {
            window.back().is_some_and(|&t| now.duration_since(t) < DAY)
        });
    }

    pub fn tracked_users(&self) -> usize {
        self.sends.len()
    }
}
