//! Randomized delays that keep the bot's request rate human-looking

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Inclusive range a random delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn secs(min: f64, max: f64) -> Self {
        Self {
            min: Duration::from_secs_f64(min),
            max: Duration::from_secs_f64(max),
        }
    }

    pub fn millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.min.is_zero() && self.max.is_zero()
    }

    /// Draw a delay; a reversed range is treated as its bounds swapped
    pub fn sample(&self) -> Duration {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        if lo == hi {
            return lo;
        }
        let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Sleep for a sampled delay
    pub fn pause(&self) -> Duration {
        if self.is_zero() {
            return Duration::ZERO;
        }
        let delay = self.sample();
        debug!(delay_ms = delay.as_millis() as u64, "pausing");
        std::thread::sleep(delay);
        delay
    }
}

/// All delay knobs the delivery paths use
#[derive(Debug, Clone, PartialEq)]
pub struct Pacing {
    /// Per keystroke while typing into the compose box
    pub keystroke: DelayRange,
    /// Between inserting text and pressing send
    pub before_submit: DelayRange,
    /// After pressing send
    pub after_submit: DelayRange,
    /// After every local-mode attempt
    pub cooldown: DelayRange,
    /// Between guests in a local batch
    pub inter_guest: DelayRange,
    /// After a successful remote-mode send
    pub remote_sent: DelayRange,
    /// After a failed remote-mode send
    pub remote_failed: DelayRange,
    /// After each send_file row
    pub file_send: DelayRange,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            keystroke: DelayRange::millis(50, 120),
            before_submit: DelayRange::secs(0.8, 1.6),
            after_submit: DelayRange::secs(0.8, 1.2),
            cooldown: DelayRange::secs(5.0, 10.0),
            inter_guest: DelayRange::secs(6.0, 14.0),
            remote_sent: DelayRange::secs(5.0, 11.0),
            remote_failed: DelayRange::secs(3.0, 6.0),
            file_send: DelayRange::secs(4.0, 9.0),
        }
    }
}

impl Pacing {
    /// No delays at all (tests, dry runs)
    pub fn none() -> Self {
        Self {
            keystroke: DelayRange::ZERO,
            before_submit: DelayRange::ZERO,
            after_submit: DelayRange::ZERO,
            cooldown: DelayRange::ZERO,
            inter_guest: DelayRange::ZERO,
            remote_sent: DelayRange::ZERO,
            remote_failed: DelayRange::ZERO,
            file_send: DelayRange::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_within_bounds() {
        let range = DelayRange::millis(10, 20);
        for _ in 0..200 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_reversed_range() {
        let range = DelayRange::millis(20, 10);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_reversed_range_still_pauses() {
        let range = DelayRange::millis(20, 0);
        assert!(!range.is_zero());
        let slept = range.pause();
        assert!(slept <= Duration::from_millis(20));
    }

    #[test]
    fn test_zero_pause_returns_immediately() {
        assert_eq!(DelayRange::ZERO.pause(), Duration::ZERO);
        assert!(Pacing::none().inter_guest.is_zero());
    }

    #[test]
    fn test_default_batch_delay_exceeds_cooldown() {
        let pacing = Pacing::default();
        assert!(pacing.inter_guest.min > pacing.cooldown.min);
        assert!(pacing.inter_guest.max > pacing.cooldown.max);
    }
}
