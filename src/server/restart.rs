//! Restart eligibility and backoff computation.
//!
//! The engine keeps a sliding history of restart timestamps per server and
//! applies two caps from the [`RestartPolicy`]: a lifetime cap on the
//! restart counter and a windowed cap on restarts in the trailing
//! `restart_window`. The windowed cap catches crash loops before the
//! lifetime counter runs out.

use crate::config::RestartPolicy;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound applied to `backoff_multiplier`
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Upper bound applied to the backoff exponent
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Outcome of a restart eligibility check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// A restart may proceed
    Allowed,
    /// The lifetime counter reached `max_restarts`
    MaxRestartsReached,
    /// Too many restarts happened inside the trailing window
    TooManyInWindow,
}

impl RestartDecision {
    /// Whether a restart may proceed
    pub fn is_allowed(self) -> bool {
        self == RestartDecision::Allowed
    }

    /// Human-readable reason for a refusal
    pub fn reason(self) -> &'static str {
        match self {
            RestartDecision::Allowed => "allowed",
            RestartDecision::MaxRestartsReached => "max restarts reached",
            RestartDecision::TooManyInWindow => "too many restarts in window",
        }
    }
}

/// Delay before restart attempt `attempt` (zero-based).
///
/// `min(initial_delay * backoff_multiplier^attempt, max_delay)` with the
/// multiplier clamped to `[1, MAX_BACKOFF_MULTIPLIER]` and the exponent to
/// `MAX_BACKOFF_EXPONENT`.
pub fn compute_delay(policy: &RestartPolicy, attempt: u32) -> Duration {
    let multiplier = if policy.backoff_multiplier.is_finite() {
        policy.backoff_multiplier.clamp(1.0, MAX_BACKOFF_MULTIPLIER)
    } else {
        1.0
    };
    let exponent = attempt.min(MAX_BACKOFF_EXPONENT) as i32;

    let delay = policy.initial_delay.as_secs_f64() * multiplier.powi(exponent);
    let capped = delay.min(policy.max_delay.as_secs_f64());

    Duration::try_from_secs_f64(capped).unwrap_or(policy.max_delay)
}

/// Restart history and eligibility checks, shared by the monitor and router
#[derive(Default)]
pub struct RestartEngine {
    history: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RestartEngine {
    /// Create an engine with empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `id` may be restarted now
    pub fn can_restart(&self, id: &str, policy: &RestartPolicy, restart_count: u32) -> RestartDecision {
        self.can_restart_at(id, policy, restart_count, Instant::now())
    }

    /// Check whether `id` may be restarted at `now`
    pub fn can_restart_at(
        &self,
        id: &str,
        policy: &RestartPolicy,
        restart_count: u32,
        now: Instant,
    ) -> RestartDecision {
        if restart_count >= policy.max_restarts {
            return RestartDecision::MaxRestartsReached;
        }

        if self.restarts_within(id, policy.restart_window, now) >= policy.window_limit() as usize {
            return RestartDecision::TooManyInWindow;
        }

        RestartDecision::Allowed
    }

    /// Number of restarts recorded for `id` in the window ending at `now`
    pub fn restarts_within(&self, id: &str, window: Duration, now: Instant) -> usize {
        let Ok(history) = self.history.lock() else {
            return 0;
        };
        history.get(id).map_or(0, |entries| {
            entries
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < window)
                .count()
        })
    }

    /// Record a restart of `id` now
    pub fn record(&self, id: &str) {
        self.record_at(id, Instant::now());
    }

    /// Record a restart of `id` at `at`
    pub fn record_at(&self, id: &str, at: Instant) {
        if let Ok(mut history) = self.history.lock() {
            history.entry(id.to_string()).or_default().push_back(at);
        }
    }

    /// Forget all restarts of `id`
    pub fn reset(&self, id: &str) {
        if let Ok(mut history) = self.history.lock() {
            history.remove(id);
        }
    }

    /// Drop entries older than `max_age` and ids left with no history
    pub fn prune(&self, max_age: Duration) {
        self.prune_at(max_age, Instant::now());
    }

    /// Drop entries older than `max_age` relative to `now`
    pub fn prune_at(&self, max_age: Duration, now: Instant) {
        if let Ok(mut history) = self.history.lock() {
            history.retain(|_, entries| {
                while entries
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) >= max_age)
                {
                    entries.pop_front();
                }
                !entries.is_empty()
            });
        }
    }

    /// Number of recorded restarts for `id`
    pub fn history_len(&self, id: &str) -> usize {
        self.history
            .lock()
            .map(|h| h.get(id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}
