//! Per-provider circuit breaking.
//!
//! A failure counter with a cooldown, deliberately without a half-open
//! probe state: after the cooldown expires the breaker closes on the
//! next observation and the first attempt is an ordinary closed-state
//! call. One failure then re-accumulates toward the threshold.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Threshold and cooldown for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failure votes before the breaker opens. At least 1.
    pub failure_threshold: u32,
    /// How long the breaker stays open before lazily closing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    fail_count: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

/// Failure-counting breaker for one bucket id, shared by reference
/// across all operations targeting that bucket.
///
/// `opened_at` doubles as the open flag: the breaker is open exactly
/// when it is set and the cooldown has not elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

/// Point-in-time view of a breaker, for callers and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerStatus {
    pub name: String,
    pub is_open: bool,
    pub fail_count: u32,
    pub failure_threshold: u32,
    /// Time left until the breaker would lazily close; zero when closed.
    pub cooldown_remaining: Duration,
    /// When the most recent failure vote was recorded.
    pub last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether calls should be rejected right now.
    ///
    /// An expired cooldown transitions the breaker back to closed as a
    /// side effect of this observation.
    pub fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() > self.config.cooldown => {
                state.opened_at = None;
                state.fail_count = 0;
                debug!(breaker = %self.name, "cooldown expired, breaker closed");
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Record one failure vote; opens the breaker at the threshold.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_count += 1;
        state.last_failure_at = Some(Instant::now());
        if state.fail_count >= self.config.failure_threshold && state.opened_at.is_none() {
            state.opened_at = Some(Instant::now());
            warn!(
                breaker = %self.name,
                failures = state.fail_count,
                cooldown_secs = self.config.cooldown.as_secs(),
                "failure threshold reached, breaker opened"
            );
        }
    }

    /// Record a success: full reset to closed.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_count = 0;
        state.opened_at = None;
    }

    /// Operator override: close the breaker immediately.
    pub fn force_close(&self) {
        self.record_success();
    }

    /// Snapshot the breaker without mutating it.
    pub fn status(&self) -> BreakerStatus {
        let state = self.state.lock().unwrap();
        let (is_open, cooldown_remaining) = match state.opened_at {
            Some(opened_at) => {
                let remaining = self.config.cooldown.saturating_sub(opened_at.elapsed());
                (remaining > Duration::ZERO, remaining)
            }
            None => (false, Duration::ZERO),
        };
        BreakerStatus {
            name: self.name.clone(),
            is_open,
            fail_count: state.fail_count,
            failure_threshold: self.config.failure_threshold,
            cooldown_remaining,
            last_failure_at: state.last_failure_at,
        }
    }
}
