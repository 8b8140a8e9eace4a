use crate::types::EndpointKey;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub since_transition_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct State {
    circuit: CircuitState,
    consecutive_failures: u32,
    last_transition: Instant,
    trial_in_flight: bool,
}

impl State {
    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.circuit = to;
        self.last_transition = now;
    }
}

/// Per-endpoint circuit breaker.
///
/// - Counts consecutive transient failures while Closed
/// - Opens for `cooldown` once the threshold is reached
/// - After cooldown admits exactly one trial call (HalfOpen)
///
/// Calls go through [`CircuitBreaker::try_acquire`], which hands out a
/// [`BreakerPermit`] that must be resolved with the call's outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    label: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(label: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            label: label.into(),
            cfg,
            state: Mutex::new(State {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State stays consistent across a panic: every mutation is a plain field write.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call upstream.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit> {
        let now = Instant::now();
        let mut st = self.lock();
        let trial = match st.circuit {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let reopen_at = st.last_transition + self.cfg.cooldown;
                if now < reopen_at {
                    return Err(self.open_error(reopen_at - now));
                }
                st.transition(CircuitState::HalfOpen, now);
                st.trial_in_flight = true;
                info!(endpoint = %self.label, "circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if st.trial_in_flight {
                    return Err(self.open_error(Duration::from_secs(1)));
                }
                st.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            endpoint: self.label.clone(),
            retry_after,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut st = self.lock();
        match (st.circuit, trial) {
            (CircuitState::HalfOpen, true) => {
                st.trial_in_flight = false;
                st.consecutive_failures = 0;
                st.transition(CircuitState::Closed, Instant::now());
                info!(endpoint = %self.label, "circuit closed after successful trial");
            }
            (CircuitState::Closed, _) => st.consecutive_failures = 0,
            // late result of a call admitted before the breaker opened
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut st = self.lock();
        match (st.circuit, trial) {
            (CircuitState::HalfOpen, true) => {
                st.trial_in_flight = false;
                st.transition(CircuitState::Open, now);
                warn!(endpoint = %self.label, "trial call failed, circuit re-opened");
            }
            (CircuitState::Closed, _) => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures >= self.cfg.failure_threshold {
                    st.transition(CircuitState::Open, now);
                    warn!(
                        endpoint = %self.label,
                        consecutive_failures = st.consecutive_failures,
                        cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            _ => {}
        }
    }

    fn release(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().circuit
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining_ms = match st.circuit {
            CircuitState::Open => {
                let until = st.last_transition + self.cfg.cooldown;
                (until > now).then(|| (until - now).as_millis() as u64)
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.circuit,
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms,
            since_transition_ms: (now - st.last_transition).as_millis() as u64,
        }
    }
}

/// Admission to call upstream once.
///
/// Resolve with [`success`](Self::success), [`failure`](Self::failure) or
/// [`release`](Self::release). Dropping an unresolved trial permit frees the
/// HalfOpen slot without changing state.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(self.trial);
    }

    /// Transient failure: counts toward opening the circuit.
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(self.trial);
    }

    /// Outcome says nothing about endpoint health.
    pub fn release(mut self) {
        self.resolved = true;
        self.breaker.release(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.release(self.trial);
        }
    }
}

/// Injected registry of breakers, one per provider endpoint.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    cfg: CircuitBreakerConfig,
    breakers: Mutex<HashMap<EndpointKey, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    pub fn get(&self, key: &EndpointKey) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key.to_string(), self.cfg.clone())))
            .clone()
    }

    pub fn snapshot(&self, key: &EndpointKey) -> Option<CircuitBreakerSnapshot> {
        let map = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key).map(|b| b.snapshot())
    }

    /// Forget every breaker; the next call per endpoint starts Closed.
    pub fn reset(&self) {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
