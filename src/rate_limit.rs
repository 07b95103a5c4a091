//! Per-session sliding-window rate limiting.
//!
//! Each session keeps a log of admission timestamps. A request is admitted
//! only if both the per-minute and per-hour windows have room; the check and
//! the record happen under one lock so concurrent requests cannot both
//! squeeze through the last slot.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::AdmitDecision;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

pub struct RateLimiter {
    per_short: usize,
    per_long: usize,
    short_window: Duration,
    long_window: Duration,
    sessions: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_windows(
            config.requests_per_minute,
            MINUTE,
            config.requests_per_hour,
            HOUR,
        )
    }

    fn with_windows(
        per_short: usize,
        short_window: Duration,
        per_long: usize,
        long_window: Duration,
    ) -> Self {
        Self {
            per_short,
            per_long,
            short_window,
            long_window,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Check both windows for `session_id` and, if admitted, record the
    /// request atomically. Denials report how long until a slot frees up.
    pub fn admit(&self, session_id: &str) -> AdmitDecision {
        let now = Instant::now();
        let mut sessions = match self.sessions.lock() {
            Ok(guard) => guard,
            // A poisoned lock denies rather than bypassing the limit.
            Err(_) => {
                return AdmitDecision::Denied {
                    retry_after: self.short_window,
                }
            }
        };

        let log = sessions.entry(session_id.to_string()).or_default();
        log.retain(|&t| now.duration_since(t) < self.long_window);

        let in_long = log.len();
        let in_short = log
            .iter()
            .filter(|&&t| now.duration_since(t) < self.short_window)
            .count();

        let mut retry_after: Option<Duration> = None;
        if in_short >= self.per_short {
            // Oldest timestamp still inside the short window decides when
            // the next slot opens.
            if let Some(&oldest) = log
                .iter()
                .filter(|&&t| now.duration_since(t) < self.short_window)
                .min()
            {
                let wait = self.short_window - now.duration_since(oldest);
                retry_after = Some(retry_after.map_or(wait, |r| r.max(wait)));
            }
        }
        if in_long >= self.per_long {
            if let Some(&oldest) = log.iter().min() {
                let wait = self.long_window - now.duration_since(oldest);
                retry_after = Some(retry_after.map_or(wait, |r| r.max(wait)));
            }
        }

        match retry_after {
            Some(retry_after) => AdmitDecision::Denied { retry_after },
            None => {
                log.push(now);
                AdmitDecision::Admitted
            }
        }
    }

    /// Drop empty session logs. Called opportunistically; correctness does
    /// not depend on it.
    pub fn prune(&self) {
        let now = Instant::now();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|_, log| {
                log.retain(|&t| now.duration_since(t) < self.long_window);
                !log.is_empty()
            });
        }
    }
}
