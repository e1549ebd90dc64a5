//! # Playback Scheduling
//!
//! Fixed-lookahead jitter buffer for streamed audio segments.
//!
//! Segments arrive unevenly over the network but must play back-to-back.
//! The scheduler keeps one piece of state, the time at which the next
//! segment should start, and applies three rules per segment:
//!
//! 1. **Underrun**: the next start is already in the past, so playback
//!    drained. Re-anchor at `now + lead`.
//! 2. **Excess queue**: more than `max_queue` seconds are already scheduled
//!    ahead of `now`. Re-anchor at `now + lead`, dropping the slack.
//! 3. Otherwise schedule at the next start and advance it by the duration.
//!
//! Only scheduling slack is ever dropped, never audio: every segment gets a
//! start time, in arrival order.
//!
//! Times are seconds on whatever monotonic clock the caller uses.

use crate::config::PlaybackConfig;

#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    next_start: f64,
    lead: f64,
    max_queue: f64,
}

impl PlaybackScheduler {
    pub fn new(lead: f64, max_queue: f64) -> Self {
        Self {
            next_start: 0.0,
            lead,
            max_queue,
        }
    }

    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self::new(config.lead_time_secs, config.max_queue_secs)
    }

    /// Start time for a segment of `duration` seconds arriving at `now`.
    pub fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        if self.next_start < now || self.next_start - now > self.max_queue {
            self.next_start = now + self.lead;
        }
        let start = self.next_start;
        self.next_start += duration;
        start
    }

    /// Forget the current schedule, e.g. when the user stops playback.
    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }

    /// Seconds of audio scheduled ahead of `now`.
    pub fn queued(&self, now: f64) -> f64 {
        (self.next_start - now).max(0.0)
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}
