//! Circuit breaker protecting upstream calls from cascading failure (§4.5).
//!
//! Generalizes `kairos-rs::services::circuit_breaker::CircuitBreaker`, which
//! opened on N *consecutive* failures. This expands it to a sliding-window
//! failure-ratio model with a minimum volume, per [`crate::models::router::CircuitBreakerSpec`]:
//! counts outcomes over a window, opens when the ratio crosses a threshold
//! with enough samples, half-opens after a cooldown to admit a bounded probe
//! volume. The async `call()` wrapper shape (check → await → record) and the
//! atomic/`Mutex` split between hot-path state and coordinated transitions
//! is kept from the teacher.

use crate::models::router::CircuitBreakerSpec;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    CircuitOpen,
    OperationFailed(E),
}

/// Bounded ring of recent outcomes; `true` is success. Guarded by a plain
/// `Mutex` since it's only ever held across the few instructions needed to
/// push a result and read the ratio, never across an `.await`.
struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self { outcomes: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn clear(&mut self) {
        self.outcomes.clear();
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|&&s| !s).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn volume(&self) -> usize {
        self.outcomes.len()
    }
}

/// One breaker per upstream identity: a route ID (`per_backend: false`) or a
/// backend URL (`per_backend: true`, §4.5).
pub struct CircuitBreaker {
    name: String,
    spec: CircuitBreakerSpec,
    state: AtomicU8,
    window: Mutex<Window>,
    opened_at: RwLock<Option<Instant>>,
    half_open_successes: AtomicU32,
    half_open_admitted: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: String, spec: CircuitBreakerSpec) -> Self {
        let window_size = spec.window_size as usize;
        Self {
            name,
            spec,
            state: AtomicU8::new(CircuitState::Closed as u8),
            window: Mutex::new(Window::new(window_size)),
            opened_at: RwLock::new(None),
            half_open_successes: AtomicU32::new(0),
            half_open_admitted: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Returns whether a call may proceed right now, performing the
    /// Open→HalfOpen cooldown transition and probe admission as a side
    /// effect. For callers that need to classify an outcome by something
    /// other than "did the future resolve to `Err`" (e.g. an HTTP status
    /// code), this plus [`Self::record_outcome`] replaces [`Self::call`].
    pub fn try_admit(&self) -> bool {
        self.admit()
    }

    /// Records a call's outcome directly, without wrapping the call itself.
    pub fn record_outcome(&self, success: bool) {
        if success {
            self.on_success();
        } else {
            self.on_failure();
        }
    }

    /// Executes `operation` under circuit-breaker protection: fails fast
    /// with [`CircuitBreakerError::CircuitOpen`] while open (after the
    /// cooldown, transitions to half-open and admits a bounded probe
    /// volume instead of rejecting outright).
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            debug!("circuit breaker {} open, failing fast", self.name);
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match operation.await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(error) => {
                self.on_failure();
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    /// Returns whether this call may proceed, performing the Open→HalfOpen
    /// cooldown transition and half-open probe admission as a side effect.
    fn admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self.opened_at.read().unwrap().map(|t| t.elapsed());
                let cooldown = std::time::Duration::from_millis(self.spec.cooldown_ms);
                if elapsed.map(|e| e >= cooldown).unwrap_or(false) {
                    self.transition_to_half_open();
                    self.admit_half_open_probe()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.admit_half_open_probe(),
        }
    }

    fn admit_half_open_probe(&self) -> bool {
        let admitted = self.half_open_admitted.fetch_add(1, Ordering::AcqRel);
        admitted < self.spec.half_open_probes
    }

    fn on_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.window.lock().unwrap().push(true);
            }
            CircuitState::HalfOpen => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.spec.half_open_probes {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let (ratio, volume) = {
                    let mut window = self.window.lock().unwrap();
                    window.push(false);
                    (window.failure_ratio(), window.volume())
                };
                if volume as u32 >= self.spec.min_volume && ratio >= self.spec.failure_ratio {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.write().unwrap() = Some(Instant::now());
        self.window.lock().unwrap().clear();
        warn!("circuit breaker {} opened", self.name);
    }

    fn transition_to_half_open(&self) {
        self.half_open_successes.store(0, Ordering::Release);
        self.half_open_admitted.store(0, Ordering::Release);
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        info!("circuit breaker {} half-open", self.name);
    }

    fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.window.lock().unwrap().clear();
        info!("circuit breaker {} closed", self.name);
    }
}
