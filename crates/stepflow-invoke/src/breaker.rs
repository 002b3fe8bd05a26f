//! Per-target circuit breakers.
//!
//! A target is an agent, or an `(agent, method)` pair when the registry is
//! configured with `per_method`. Breakers are created lazily on first use and
//! live as long as the registry, so their state carries across executions.
//! Each target has its own mutex; the registry map lock is only held long
//! enough to fetch or insert a breaker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stepflow_core::config::CircuitBreakerConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{EventBus, WorkflowEvent};
use stepflow_core::types::{CircuitSnapshot, CircuitState};

/// Registry key for an agent call target.
pub fn circuit_key(agent_id: &str, method_id: &str, per_method: bool) -> String {
    if per_method {
        format!("{}/{}", agent_id, method_id)
    } else {
        agent_id.to_string()
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

type Transition = (CircuitState, CircuitState);

impl Breaker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            last_state_change: now,
        }
    }

    fn move_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.opened_at = None;
            }
        }
        (from, to)
    }

    fn seconds_since_failure(&self, now: DateTime<Utc>) -> i64 {
        self.last_failure_time
            .map(|t| (now - t).num_seconds())
            .unwrap_or(i64::MAX)
    }
}

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<Mutex<Breaker>>>>,
    events: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish `CircuitStateChanged` events on the given bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Key for an agent call under this registry's keying mode.
    pub fn key_for(&self, agent_id: &str, method_id: &str) -> String {
        circuit_key(agent_id, method_id, self.config.per_method)
    }

    /// Gate a call to `target`.
    ///
    /// Returns the state the call proceeds under. An OPEN circuit whose
    /// timeout has elapsed moves to HALF_OPEN and lets this call through as
    /// the probe; otherwise it fails with `CircuitOpen`.
    pub fn check_circuit(&self, target: &str) -> Result<(CircuitState, bool)> {
        self.check_circuit_at(target, Utc::now())
    }

    pub fn record_success(&self, target: &str) {
        self.record_success_at(target, Utc::now())
    }

    pub fn record_failure(&self, target: &str) {
        self.record_failure_at(target, Utc::now())
    }

    /// Current state of `target`, if it has been used.
    pub fn snapshot(&self, target: &str) -> Option<CircuitSnapshot> {
        let breaker = self.lookup(target)?;
        let b = lock(&breaker);
        Some(self.to_snapshot(target, &b))
    }

    /// States of every known target, sorted by key.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let entries: Vec<(String, Arc<Mutex<Breaker>>)> = lock(&self.breakers)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut out: Vec<CircuitSnapshot> = entries
            .iter()
            .map(|(k, b)| self.to_snapshot(k, &lock(b)))
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    /// Force `target` back to CLOSED. Returns `false` for an unknown target.
    pub fn reset(&self, target: &str) -> bool {
        let Some(breaker) = self.lookup(target) else {
            return false;
        };
        let now = Utc::now();
        let change = {
            let mut b = lock(&breaker);
            let from = b.state;
            *b = Breaker::new(now);
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        info!(target_key = %target, "Circuit breaker reset");
        self.announce(target, change);
        true
    }

    fn check_circuit_at(&self, target: &str, now: DateTime<Utc>) -> Result<(CircuitState, bool)> {
        let breaker = self.get_or_create(target, now);
        let (state, change) = {
            let mut b = lock(&breaker);
            match b.state {
                CircuitState::Closed | CircuitState::HalfOpen => (b.state, None),
                CircuitState::Open => {
                    let timeout = self.config.timeout_secs as i64;
                    let elapsed = b.seconds_since_failure(now);
                    if elapsed >= timeout {
                        let change = b.move_to(CircuitState::HalfOpen, now);
                        (CircuitState::HalfOpen, Some(change))
                    } else {
                        let retry_in_secs = (timeout - elapsed).max(0) as u64;
                        debug!(target_key = %target, retry_in_secs, "Circuit open, rejecting call");
                        return Err(StepflowError::CircuitOpen {
                            target: target.to_string(),
                            retry_in_secs,
                        });
                    }
                }
            }
        };
        if change.is_some() {
            info!(target_key = %target, "Circuit breaker half-open, probing target");
        }
        self.announce(target, change);
        Ok((state, true))
    }

    fn record_success_at(&self, target: &str, now: DateTime<Utc>) {
        let breaker = self.get_or_create(target, now);
        let change = {
            let mut b = lock(&breaker);
            match b.state {
                CircuitState::HalfOpen => {
                    b.success_count += 1;
                    if b.success_count >= self.config.success_threshold {
                        Some(b.move_to(CircuitState::Closed, now))
                    } else {
                        None
                    }
                }
                CircuitState::Closed => {
                    b.failure_count = b.failure_count.saturating_sub(1);
                    None
                }
                CircuitState::Open => None,
            }
        };
        if change.is_some() {
            info!(target_key = %target, "Circuit breaker closed, target recovered");
        }
        self.announce(target, change);
    }

    fn record_failure_at(&self, target: &str, now: DateTime<Utc>) {
        let breaker = self.get_or_create(target, now);
        let (change, failures) = {
            let mut b = lock(&breaker);
            b.failure_count += 1;
            b.last_failure_time = Some(now);
            let change = match b.state {
                CircuitState::Closed if b.failure_count >= self.config.failure_threshold => {
                    Some(b.move_to(CircuitState::Open, now))
                }
                CircuitState::HalfOpen => Some(b.move_to(CircuitState::Open, now)),
                _ => None,
            };
            (change, b.failure_count)
        };
        if change.is_some() {
            warn!(target_key = %target, failures, "Circuit breaker opened");
        }
        self.announce(target, change);
    }

    fn lookup(&self, target: &str) -> Option<Arc<Mutex<Breaker>>> {
        lock(&self.breakers).get(target).cloned()
    }

    fn get_or_create(&self, target: &str, now: DateTime<Utc>) -> Arc<Mutex<Breaker>> {
        let mut map = lock(&self.breakers);
        Arc::clone(
            map.entry(target.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(now)))),
        )
    }

    fn to_snapshot(&self, target: &str, b: &Breaker) -> CircuitSnapshot {
        CircuitSnapshot {
            target: target.to_string(),
            state: b.state,
            failure_count: b.failure_count,
            success_count: b.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            timeout_secs: self.config.timeout_secs,
            last_failure_time: b.last_failure_time,
            opened_at: b.opened_at,
            last_state_change: b.last_state_change,
        }
    }

    fn announce(&self, target: &str, change: Option<Transition>) {
        if let (Some(events), Some((from, to))) = (&self.events, change) {
            events.publish(WorkflowEvent::CircuitStateChanged {
                target: target.to_string(),
                from,
                to,
            });
        }
    }
}

// A panic while holding a breaker lock leaves plain counters behind, so the
// poisoned value is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
