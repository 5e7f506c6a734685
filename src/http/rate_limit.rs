//! Per-endpoint rate limiting — token buckets keyed by (route class, ip)
//! and, where a principal is known, (route class, principal).
//!
//! Returns `429` with `Retry-After` when a bucket is empty.

use std::num::NonZeroU32;

use governor::clock::{Clock, QuantaClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use crate::config::RateLimitConfig;
use crate::{Error, Result};

type Limiter = RateLimiter<String, DefaultKeyedStateStore<String>, QuantaClock>;

/// Route classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Login, registration, token endpoints
    Auth,
    /// OTP verification
    Otp,
    /// Everything else
    General,
}

/// Keyed limiters, one per route class.
pub struct RateLimits {
    enabled: bool,
    auth: Limiter,
    otp: Limiter,
    general: Limiter,
    clock: QuantaClock,
}

impl RateLimits {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let quota = |per_minute: u32| {
            Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("max(1) is non-zero"))
        };
        Self {
            enabled: config.enabled,
            auth: RateLimiter::keyed(quota(config.auth_per_minute)),
            otp: RateLimiter::keyed(quota(config.otp_per_minute)),
            general: RateLimiter::keyed(quota(config.general_per_minute)),
            clock: QuantaClock::default(),
        }
    }

    /// Check one request against a class. `key` is the client ip, optionally
    /// suffixed with the principal for authenticated routes.
    pub fn check(&self, class: RouteClass, key: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let limiter = match class {
            RouteClass::Auth => &self.auth,
            RouteClass::Otp => &self.otp,
            RouteClass::General => &self.general,
        };
        match limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(Error::TooManyRequests {
                    retry_after_secs: wait.as_secs().max(1),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_then_returns_retry_after() {
        // GIVEN: a 3-per-minute auth budget
        let limits = RateLimits::new(&RateLimitConfig {
            enabled: true,
            auth_per_minute: 3,
            otp_per_minute: 3,
            general_per_minute: 3,
        });

        // WHEN: four requests from the same ip
        for _ in 0..3 {
            limits.check(RouteClass::Auth, "1.2.3.4").unwrap();
        }
        let err = limits.check(RouteClass::Auth, "1.2.3.4").unwrap_err();

        // THEN: 429 with a positive Retry-After
        match err {
            Error::TooManyRequests { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let limits = RateLimits::new(&RateLimitConfig {
            enabled: true,
            auth_per_minute: 1,
            otp_per_minute: 1,
            general_per_minute: 1,
        });
        limits.check(RouteClass::Auth, "1.1.1.1").unwrap();
        // A different ip has its own bucket
        limits.check(RouteClass::Auth, "2.2.2.2").unwrap();
        // A different class too
        limits.check(RouteClass::General, "1.1.1.1").unwrap();
    }

    #[test]
    fn disabled_limits_always_pass() {
        let limits = RateLimits::new(&RateLimitConfig {
            enabled: false,
            auth_per_minute: 1,
            otp_per_minute: 1,
            general_per_minute: 1,
        });
        for _ in 0..10 {
            limits.check(RouteClass::Auth, "1.1.1.1").unwrap();
        }
    }
}
