use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Duration, Utc};
use landing_util::RateLimitConfig;

/// Windows are pruned once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RateKey {
    route: &'static str,
    client: String,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u64 },
}

/// Fixed-window request counter keyed by route and client address.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<RateKey, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests,
            window: Duration::from_std(config.window).unwrap_or_else(|_| Duration::seconds(60)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request and decides whether it may proceed.
    pub fn check(&self, route: &'static str, client: &str, now: DateTime<Utc>) -> RateDecision {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, entry| now - entry.started_at < window);
        }

        let key = RateKey {
            route,
            client: client.to_string(),
        };
        let entry = windows.entry(key).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - entry.started_at >= self.window {
            *entry = Window {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= self.max_requests {
            let remaining = (entry.started_at + self.window) - now;
            let millis = remaining.num_milliseconds().max(0) as u64;
            return RateDecision::Limited {
                retry_after_secs: millis.div_ceil(1000).max(1),
            };
        }

        entry.count += 1;
        RateDecision::Allowed {
            remaining: self.max_requests - entry.count,
        }
    }
}
