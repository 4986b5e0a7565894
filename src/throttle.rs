//! Adaptive throttler: delay computed from server-side backoff signals
//!
//! State lives behind `arc_swap::ArcSwap` so configuration can be hot-swapped
//! without a lock — the donor depends on `arc-swap` but never actually uses
//! it (`Cargo.toml` lists it, nothing in `src/` imports it); this is exactly
//! the case where the teacher's stack is carried forward into real use
//! rather than dropped.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;

use crate::config::ThrottleConfig;

pub struct Throttler {
    config: ArcSwap<ThrottleConfig>,
    consecutive: AtomicU32,
    last_delay_ms: AtomicU64,
    active: AtomicBool,
}

impl Throttler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            consecutive: AtomicU32::new(0),
            last_delay_ms: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    pub fn enable(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Does not reset the counter.
    pub fn disable(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::SeqCst);
        self.last_delay_ms.store(0, Ordering::SeqCst);
    }

    pub fn update_config(&self, new: ThrottleConfig) {
        self.config.store(Arc::new(new));
        self.consecutive.store(0, Ordering::SeqCst);
    }

    pub fn is_throttle_status(&self, status: u16) -> bool {
        self.config.load().throttle_on_status_codes.contains(&status)
    }

    /// Call after every response; bumps the counter and enables throttling
    /// when `status` is in the configured set.
    pub fn record_response(&self, status: u16) {
        if self.is_throttle_status(status) {
            self.consecutive.fetch_add(1, Ordering::SeqCst);
            self.enable();
        }
    }

    /// Computes the current throttle delay from the backoff state.
    pub fn current_throttle_delay(&self) -> Duration {
        if !self.active.load(Ordering::SeqCst) {
            return Duration::ZERO;
        }
        let cfg = self.config.load();
        let c = self.consecutive.load(Ordering::SeqCst).saturating_sub(1);

        let base_ms = (cfg.base_delay.as_millis() as f64) * cfg.exponential_factor.powi(c as i32);
        let base = Duration::from_millis(base_ms.min(cfg.max_delay.as_millis() as f64) as u64);

        let jitter_percent = cfg.jitter_percent.min(100) as f64 / 100.0;
        let jitter_ms = if jitter_percent > 0.0 {
            let max_jitter = base.as_millis() as f64 * jitter_percent;
            rand::thread_rng().gen_range(0.0..=max_jitter)
        } else {
            0.0
        };

        let total = Duration::from_millis((base.as_millis() as f64 + jitter_ms) as u64);
        let capped = total.min(cfg.max_delay);
        self.last_delay_ms.store(capped.as_millis() as u64, Ordering::SeqCst);
        capped
    }

    pub fn last_delay(&self) -> Duration {
        Duration::from_millis(self.last_delay_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_throttler_has_zero_delay() {
        let t = Throttler::new(ThrottleConfig::default());
        assert_eq!(t.current_throttle_delay(), Duration::ZERO);
    }

    #[test]
    fn delay_grows_with_consecutive_count_and_stays_non_negative() {
        let cfg = ThrottleConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            exponential_factor: 2.0,
            jitter_percent: 0,
            throttle_on_status_codes: [429].into_iter().collect(),
        };
        let t = Throttler::new(cfg);
        t.record_response(429);
        let d1 = t.current_throttle_delay();
        assert!(d1 >= Duration::from_millis(1000) && d1 <= Duration::from_millis(1200));

        t.record_response(429);
        let d2 = t.current_throttle_delay();
        assert!(d2 >= Duration::from_millis(2000) && d2 <= Duration::from_millis(2400));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let cfg = ThrottleConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1500),
            exponential_factor: 10.0,
            jitter_percent: 0,
            throttle_on_status_codes: [429].into_iter().collect(),
        };
        let t = Throttler::new(cfg);
        for _ in 0..5 {
            t.record_response(429);
        }
        assert_eq!(t.current_throttle_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn disable_keeps_counter_reset_zeroes_it() {
        let t = Throttler::new(ThrottleConfig::default());
        t.record_response(429);
        t.disable();
        assert_eq!(t.current_throttle_delay(), Duration::ZERO);
        t.enable();
        assert!(t.current_throttle_delay() > Duration::ZERO);
        t.reset();
        assert_eq!(t.last_delay(), Duration::ZERO);
    }
}
