// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exponential Backoff
//!
//! Delay policy used between connection attempts. The un-jittered delay for
//! attempt `n` is:
//!
//! ```text
//! interval[n] = min(initial * multiplier^n, max_interval)
//! ```
//!
//! and each returned delay is drawn uniformly from
//! `[interval * (1 - r), interval * (1 + r)]` (capped at `max_interval`),
//! where `r` is the randomization factor. After `max_retries` delays the
//! policy answers `None`, the stop signal, until it is reset.

use crate::config::RabbitMQConfigs;
use rand::Rng;
use std::time::Duration;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_interval: Duration,
    max_interval: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    /// Creates a policy that yields `max_retries` delays before stopping.
    pub fn new(max_retries: u32) -> Self {
        Backoff {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_retries,
            attempt: 0,
        }
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> Self {
        Backoff::new(cfg.backoff_max_tries)
            .with_intervals(
                Duration::from_millis(cfg.backoff_initial_ms),
                Duration::from_millis(cfg.backoff_max_ms),
            )
            .with_multiplier(cfg.backoff_multiplier)
            .with_randomization_factor(cfg.backoff_randomization)
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }

    /// Multipliers below `1.0` are raised to `1.0` (constant delay).
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    /// Clamped to `[0.0, 1.0]`; `0.0` disables jitter.
    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = if factor.is_finite() {
            factor.clamp(0.0, 1.0)
        } else {
            DEFAULT_RANDOMIZATION_FACTOR
        };
        self
    }

    /// Un-jittered delay for the given zero-based attempt.
    pub fn interval(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exp);

        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jitter window for the given zero-based attempt.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let interval = self.interval(attempt).as_secs_f64();
        let delta = interval * self.randomization_factor;
        let max = self.max_interval.as_secs_f64();

        (
            Duration::from_secs_f64((interval - delta).max(0.0)),
            Duration::from_secs_f64((interval + delta).min(max)),
        )
    }

    /// Returns the next delay, or `None` once `max_retries` delays were handed out.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }

        let (low, high) = self.bounds(self.attempt);
        self.attempt += 1;

        if low >= high {
            return Some(low);
        }

        let secs = rand::thread_rng().gen_range(low.as_secs_f64()..=high.as_secs_f64());
        Some(Duration::from_secs_f64(secs).clamp(low, high))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic(max_retries: u32) -> Backoff {
        Backoff::new(max_retries)
            .with_intervals(Duration::from_millis(100), Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
    }

    #[test]
    fn delays_double_until_the_ceiling() {
        let mut backoff = deterministic(6);

        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_backoff()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn stops_after_max_retries() {
        let mut backoff = deterministic(2);

        assert!(backoff.next_backoff().is_some());
        assert!(backoff.next_backoff().is_some());
        assert_eq!(backoff.next_backoff(), None);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn zero_retries_stops_immediately() {
        let mut backoff = Backoff::new(0);
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn reset_starts_a_clean_cycle() {
        let mut backoff = deterministic(1);

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), None);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let mut backoff = Backoff::new(20);

        for attempt in 0..20 {
            let (low, high) = backoff.bounds(attempt);
            let delay = backoff.next_backoff().unwrap();
            assert!(delay >= low && delay <= high, "{delay:?} not in {low:?}..={high:?}");
            assert!(high <= DEFAULT_MAX_INTERVAL);
        }
    }

    #[test]
    fn interval_is_a_pure_function_of_attempt() {
        let backoff = deterministic(3);
        assert_eq!(backoff.interval(2), backoff.interval(2));
        assert_eq!(backoff.interval(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn builds_from_configs() {
        let cfg = RabbitMQConfigs {
            backoff_max_tries: 3,
            backoff_initial_ms: 10,
            backoff_max_ms: 20,
            backoff_multiplier: 3.0,
            backoff_randomization: 0.0,
            ..RabbitMQConfigs::default()
        };
        let mut backoff = Backoff::from_configs(&cfg);

        assert_eq!(backoff.max_retries(), 3);
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(20)));
    }
}
