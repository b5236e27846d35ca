//! Per-endpoint circuit breaker.
//!
//! Closed until `failure_threshold` consecutive failures, then Open for the
//! cooldown. The first caller after the cooldown gets the single half-open
//! trial; its result closes or re-opens the circuit.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint_id: String,
    config: BreakerConfig,
    consecutive_failures: AtomicU32,
    inner: Mutex<Inner>,
}

/// Admission to make one call. Dropping it unresolved frees a half-open trial slot.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    resolved: bool,
}

impl Permit {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(endpoint_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            config,
            consecutive_failures: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Current state; an expired cooldown reads as half-open.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.cooled_down(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn cooled_down(&self, inner: &Inner) -> bool {
        inner.opened_at.is_some_and(|at| at.elapsed() >= self.config.cooldown())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut inner = self.lock();
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.cooled_down(&inner) {
                    info!(endpoint = %self.endpoint_id, "Circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        };
        drop(inner);

        admitted.then(|| Permit {
            breaker: self.clone(),
            resolved: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if inner.state != CircuitState::Closed {
            info!(endpoint = %self.endpoint_id, "Circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        match inner.state {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                warn!(endpoint = %self.endpoint_id, failures, "Circuit opening after consecutive failures");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                warn!(endpoint = %self.endpoint_id, "Trial call failed, circuit re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
            }
            _ => {}
        }
    }
}

/// Lazily created breakers keyed by endpoint id.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn for_endpoint(&self, endpoint_id: &str) -> Arc<CircuitBreaker> {
        self.breakers.entry(endpoint_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint_id, self.config.clone())))
            .value()
            .clone()
    }

    pub fn state_of(&self, endpoint_id: &str) -> Option<CircuitState> {
        self.breakers.get(endpoint_id).map(|b| b.state())
    }
}
