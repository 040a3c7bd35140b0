use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Default limits table: operation -> (max requests, window seconds).
const DEFAULT_LIMITS: &[(&str, u32, u64)] = &[
    ("chat", 20, 60),
    ("upload", 10, 60),
    ("voice", 5, 60),
    ("login", 5, 300),
    ("register", 3, 3600),
    ("config_update", 10, 60),
    ("search", 30, 60),
    ("api_default", 100, 60),
];

#[derive(Debug, Clone, Serialize)]
pub struct QuotaInfo {
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
    pub reset_in_s: u64,
    pub window_s: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlacklistEntry {
    pub remaining_s: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub active_users: usize,
    pub total_requests_tracked: usize,
    pub blacklisted_users: usize,
    pub blacklist: HashMap<String, BlacklistEntry>,
}

struct Inner {
    /// (user, operation) -> request timestamps inside the window.
    request_counts: HashMap<(String, String), Vec<Instant>>,
    limits: HashMap<String, (u32, u64)>,
    /// user -> (blocked until, reason)
    blacklist: HashMap<String, (Instant, String)>,
}

/// Sliding-window rate limiter with violation escalation.
///
/// Repeated limit violations inside the escalation window move the user
/// onto a time-bounded blacklist that denies everything until it lapses.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    violation_window: Duration,
    violation_threshold: u32,
    blacklist_duration: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_escalation(Duration::from_secs(600), 5, Duration::from_secs(1800))
    }

    /// Escalation thresholds are deployment-tunable; the defaults match
    /// `new()` (5 violations in 10 minutes -> 30 minute ban).
    pub fn with_escalation(
        violation_window: Duration,
        violation_threshold: u32,
        blacklist_duration: Duration,
    ) -> Self {
        let limits = DEFAULT_LIMITS
            .iter()
            .map(|&(op, max, window)| (op.to_string(), (max, window)))
            .collect();

        Self {
            inner: Mutex::new(Inner {
                request_counts: HashMap::new(),
                limits,
                blacklist: HashMap::new(),
            }),
            violation_window,
            violation_threshold,
            blacklist_duration,
        }
    }

    /// Check whether `user` may perform `operation` at the given cost.
    ///
    /// Returns `Ok(())` and records the request, or `Err(retry_after_s)`.
    pub fn check(&self, user: &str, operation: &str, cost: u32) -> Result<(), u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Blacklist gate comes first, expired entries fall off here.
        if let Some((blocked_until, reason)) = inner.blacklist.get(user).cloned() {
            if now < blocked_until {
                let remaining = (blocked_until - now).as_secs().max(1);
                warn!(user, reason = %reason, remaining, "Blocked blacklisted request");
                return Err(remaining);
            }
            inner.blacklist.remove(user);
            info!(user, "Removed from blacklist");
        }

        let (limit, window_s) = inner
            .limits
            .get(operation)
            .copied()
            .unwrap_or_else(|| inner.limits["api_default"]);
        let window = Duration::from_secs(window_s);

        let key = (user.to_string(), operation.to_string());
        let timestamps = inner.request_counts.entry(key.clone()).or_default();
        timestamps.retain(|ts| now.duration_since(*ts) < window);

        let current = timestamps.len() as u32;
        if current + cost > limit {
            let retry_after = timestamps
                .first()
                .map(|oldest| window_s.saturating_sub(now.duration_since(*oldest).as_secs()))
                .unwrap_or(window_s)
                .max(1);
            warn!(
                user,
                operation, current, limit, window_s, "Rate limit exceeded"
            );
            self.record_violation(&mut inner, user, now);
            return Err(retry_after);
        }

        let timestamps = inner.request_counts.entry(key).or_default();
        for _ in 0..cost {
            timestamps.push(now);
        }
        Ok(())
    }

    fn record_violation(&self, inner: &mut Inner, user: &str, now: Instant) {
        let key = (user.to_string(), "violations".to_string());
        let violations = inner.request_counts.entry(key).or_default();
        violations.retain(|ts| now.duration_since(*ts) < self.violation_window);
        violations.push(now);

        if violations.len() as u32 >= self.violation_threshold {
            let reason = format!(
                "Excessive rate limit violations ({} times)",
                violations.len()
            );
            inner
                .blacklist
                .insert(user.to_string(), (now + self.blacklist_duration, reason));
            warn!(
                user,
                duration_s = self.blacklist_duration.as_secs(),
                "User blacklisted"
            );
        }
    }

    pub fn quota(&self, user: &str, operation: &str) -> QuotaInfo {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let (limit, window_s) = inner
            .limits
            .get(operation)
            .copied()
            .unwrap_or_else(|| inner.limits["api_default"]);
        let window = Duration::from_secs(window_s);

        let key = (user.to_string(), operation.to_string());
        let timestamps = inner.request_counts.entry(key).or_default();
        timestamps.retain(|ts| now.duration_since(*ts) < window);

        let used = timestamps.len() as u32;
        let reset_in_s = timestamps
            .first()
            .map(|oldest| window_s.saturating_sub(now.duration_since(*oldest).as_secs()))
            .unwrap_or(0);

        QuotaInfo {
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_in_s,
            window_s,
        }
    }

    /// Drop every tracked key (including violations) for the user.
    pub fn reset(&self, user: &str) {
        let mut inner = self.inner.lock();
        inner.request_counts.retain(|(u, _), _| u != user);
        info!(user, "Rate limits reset");
    }

    pub fn add_to_blacklist(&self, user: &str, duration: Duration, reason: &str) {
        let mut inner = self.inner.lock();
        inner
            .blacklist
            .insert(user.to_string(), (Instant::now() + duration, reason.to_string()));
        warn!(user, reason, duration_s = duration.as_secs(), "Manually blacklisted");
    }

    pub fn remove_from_blacklist(&self, user: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.blacklist.remove(user).is_some();
        if removed {
            info!(user, "Removed from blacklist");
        }
        removed
    }

    pub fn update_limits(&self, operation: &str, max_requests: u32, window_s: u64) {
        let mut inner = self.inner.lock();
        inner
            .limits
            .insert(operation.to_string(), (max_requests, window_s));
        info!(operation, max_requests, window_s, "Rate limit updated");
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let inner = self.inner.lock();

        let active_users: std::collections::HashSet<&str> = inner
            .request_counts
            .keys()
            .map(|(user, _)| user.as_str())
            .collect();
        let total_requests = inner.request_counts.values().map(Vec::len).sum();

        let blacklist = inner
            .blacklist
            .iter()
            .filter(|(_, (until, _))| *until > now)
            .map(|(user, (until, reason))| {
                (
                    user.clone(),
                    BlacklistEntry {
                        remaining_s: (*until - now).as_secs(),
                        reason: reason.clone(),
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        RateLimiterStats {
            active_users: active_users.len(),
            total_requests_tracked: total_requests,
            blacklisted_users: blacklist.len(),
            blacklist,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            assert!(limiter.check("alice", "chat", 1).is_ok());
        }
        let retry_after = limiter.check("alice", "chat", 1).unwrap_err();
        assert!(retry_after <= 60);
    }

    #[test]
    fn unknown_operation_uses_default_limit() {
        let limiter = RateLimiter::new();
        let quota = limiter.quota("bob", "no_such_op");
        assert_eq!(quota.limit, 100);
        assert_eq!(quota.window_s, 60);
    }

    #[test]
    fn cost_counts_as_multiple_requests() {
        let limiter = RateLimiter::new();
        assert!(limiter.check("carol", "upload", 9).is_ok());
        assert!(limiter.check("carol", "upload", 2).is_err());
        assert!(limiter.check("carol", "upload", 1).is_ok());
    }

    #[test]
    fn quota_reflects_usage() {
        let limiter = RateLimiter::new();
        limiter.check("dave", "search", 5).unwrap();
        let quota = limiter.quota("dave", "search");
        assert_eq!(quota.used, 5);
        assert_eq!(quota.remaining, 25);
        assert!(quota.reset_in_s <= 60);
    }

    #[test]
    fn five_violations_trigger_blacklist() {
        let limiter = RateLimiter::new();
        // Exhaust the register quota (3/hour), then violate 5 times.
        for _ in 0..3 {
            limiter.check("eve", "register", 1).unwrap();
        }
        for _ in 0..5 {
            assert!(limiter.check("eve", "register", 1).is_err());
        }
        // Now blacklisted: even a fresh operation with quota remaining denies.
        let retry_after = limiter.check("eve", "chat", 1).unwrap_err();
        assert!(retry_after <= 1800);
        assert!(retry_after > 60, "blacklist outlasts the operation window");

        let stats = limiter.stats();
        assert_eq!(stats.blacklisted_users, 1);
        assert!(stats.blacklist.contains_key("eve"));
    }

    #[test]
    fn reset_clears_counts_and_violations() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("frank", "register", 1).unwrap();
        }
        assert!(limiter.check("frank", "register", 1).is_err());
        limiter.reset("frank");
        assert!(limiter.check("frank", "register", 1).is_ok());
    }

    #[test]
    fn manual_blacklist_roundtrip() {
        let limiter = RateLimiter::new();
        limiter.add_to_blacklist("grace", Duration::from_secs(60), "abuse");
        assert!(limiter.check("grace", "chat", 1).is_err());
        assert!(limiter.remove_from_blacklist("grace"));
        assert!(limiter.check("grace", "chat", 1).is_ok());
    }

    #[test]
    fn window_eviction_frees_quota() {
        let limiter = RateLimiter::new();
        limiter.update_limits("burst", 2, 1);
        limiter.check("heidi", "burst", 2).unwrap();
        assert!(limiter.check("heidi", "burst", 1).is_err());
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check("heidi", "burst", 1).is_ok());
    }
}
