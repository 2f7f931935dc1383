//! Per-service circuit breaker.
//!
//! Three states: closed (normal), open (fail fast), half-open (trial).
//! Closed trips to open once a counting window has seen at least
//! `min_requests` calls with a failure ratio at or above
//! `failure_ratio`. Open rejects everything for `open_timeout`, then
//! half-open admits up to `half_open_max` trial calls: any failure
//! reopens, `half_open_max` successes close. A generation counter guards
//! against outcomes recorded across a state change.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Length of the closed-state counting window.
    pub window: Duration,
    /// Minimum requests in the window before the ratio is considered.
    pub min_requests: u32,
    /// Failure ratio at which the breaker trips.
    pub failure_ratio: f64,
    /// How long the open state rejects before trialing again.
    pub open_timeout: Duration,
    /// Trial calls admitted in half-open.
    pub half_open_max: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            min_requests: 3,
            failure_ratio: 0.6,
            open_timeout: Duration::from_secs(30),
            half_open_max: 3,
        }
    }
}

type StateListener = Box<dyn Fn(BreakerState, BreakerState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    listener: Option<StateListener>,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    requests: u32,
    failures: u32,
    half_open_admitted: u32,
    half_open_successes: u32,
    window_start: Instant,
    opened_at: Instant,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self::build(name.into(), settings, None)
    }

    /// Breaker that reports every state change, used by the registry to
    /// keep the owning service's health flag in sync.
    pub fn with_listener(
        name: impl Into<String>,
        settings: BreakerSettings,
        listener: impl Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    ) -> Self {
        Self::build(name.into(), settings, Some(Box::new(listener)))
    }

    fn build(name: String, settings: BreakerSettings, listener: Option<StateListener>) -> Self {
        let now = Instant::now();
        Self {
            name,
            settings,
            listener,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                requests: 0,
                failures: 0,
                half_open_admitted: 0,
                half_open_successes: 0,
                window_start: now,
                opened_at: now,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit one call. Returns the generation to report the outcome
    /// under, or a terminal error when the breaker rejects the call.
    pub fn acquire(&self) -> Result<u64, EngineError> {
        let (admitted, change) = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let change = self.tick(&mut inner);
            let admitted = match inner.state {
                BreakerState::Closed => {
                    inner.requests += 1;
                    Ok(inner.generation)
                }
                BreakerState::Open => Err(EngineError::BreakerOpen(self.name.clone())),
                BreakerState::HalfOpen => {
                    if inner.half_open_admitted >= self.settings.half_open_max {
                        Err(EngineError::BreakerOpen(self.name.clone()))
                    } else {
                        inner.half_open_admitted += 1;
                        Ok(inner.generation)
                    }
                }
            };
            (admitted, change)
        };
        self.notify(change);
        admitted
    }

    /// Report the outcome of an admitted call. Outcomes from a previous
    /// generation are discarded.
    pub fn record(&self, generation: u64, success: bool) {
        let change = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let mut change = self.tick(&mut inner);
            // A generation mismatch means the state changed since the call
            // was admitted; its outcome no longer counts.
            if generation == inner.generation {
                let outcome = if success {
                    self.on_success(&mut inner)
                } else {
                    self.on_failure(&mut inner)
                };
                change = change.or(outcome);
            }
            change
        };
        self.notify(change);
    }

    pub fn state(&self) -> BreakerState {
        let (state, change) = {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            let change = self.tick(&mut inner);
            (inner.state, change)
        };
        self.notify(change);
        state
    }

    /// Time-driven transitions: expire the closed counting window, move
    /// open to half-open once the timeout elapses.
    fn tick(&self, inner: &mut Inner) -> Option<(BreakerState, BreakerState)> {
        let now = Instant::now();
        match inner.state {
            BreakerState::Closed => {
                if now.duration_since(inner.window_start) >= self.settings.window {
                    inner.requests = 0;
                    inner.failures = 0;
                    inner.window_start = now;
                }
                None
            }
            BreakerState::Open => {
                if now.duration_since(inner.opened_at) >= self.settings.open_timeout {
                    Some(self.transition(inner, BreakerState::HalfOpen))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => None,
        }
    }

    fn on_success(&self, inner: &mut Inner) -> Option<(BreakerState, BreakerState)> {
        match inner.state {
            BreakerState::Closed => None,
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.half_open_max {
                    Some(self.transition(inner, BreakerState::Closed))
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner) -> Option<(BreakerState, BreakerState)> {
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                let ratio = f64::from(inner.failures) / f64::from(inner.requests.max(1));
                if inner.requests >= self.settings.min_requests
                    && ratio >= self.settings.failure_ratio
                {
                    Some(self.transition(inner, BreakerState::Open))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => Some(self.transition(inner, BreakerState::Open)),
            BreakerState::Open => None,
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: BreakerState,
    ) -> (BreakerState, BreakerState) {
        let from = inner.state;
        let now = Instant::now();
        inner.state = to;
        inner.generation += 1;
        inner.requests = 0;
        inner.failures = 0;
        inner.half_open_admitted = 0;
        inner.half_open_successes = 0;
        inner.window_start = now;
        if to == BreakerState::Open {
            inner.opened_at = now;
        }
        (from, to)
    }

    fn notify(&self, change: Option<(BreakerState, BreakerState)>) {
        if let Some((from, to)) = change {
            info!(
                breaker = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker state change"
            );
            if let Some(listener) = &self.listener {
                listener(from, to);
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().expect("breaker lock poisoned").state)
            .finish()
    }
}
