//! Circuit breaker guarding a repeatedly failing node.
//!
//! While Closed, outcomes are recorded into a rolling window; once the window
//! holds at least `minimum_throughput` samples and the failure rate reaches
//! the threshold the circuit opens. After `open_duration` a call is let
//! through (HalfOpen). `half_open_successes` consecutive successes close the
//! circuit again; any half-open failure reopens it and restarts the timer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nodeflow_types::definition::CircuitBreakerPolicy;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. `outcomes` holds recent results (`true` = failure).
    Closed { outcomes: VecDeque<bool> },
    /// Calls are rejected until `open_duration` has elapsed.
    Open { opened_at: Instant },
    /// Probing. Counts consecutive successes toward closing.
    HalfOpen { successes: u32 },
}

impl CircuitState {
    fn closed() -> Self {
        CircuitState::Closed {
            outcomes: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

/// Thread-safe circuit breaker for one node of one workflow instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.policy
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().expect("circuit breaker lock poisoned")
    }

    fn open_duration(&self) -> Duration {
        Duration::from_millis(self.policy.open_duration_ms)
    }

    /// Current state (Open is not promoted to HalfOpen by reading).
    pub fn state(&self) -> CircuitState {
        self.lock().clone()
    }

    /// Whether a call may run now.
    ///
    /// Transitions Open -> HalfOpen once the open duration has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        match &*state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_duration() {
                    *state = CircuitState::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.lock();
        match &mut *state {
            CircuitState::Closed { outcomes } => {
                Self::push_outcome(outcomes, false, self.policy.window_size);
            }
            CircuitState::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.policy.half_open_successes {
                    *state = CircuitState::closed();
                }
            }
            CircuitState::Open { .. } => {
                // A call admitted before the circuit opened; state is unchanged.
            }
        }
    }

    /// Record a failed call. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        let mut state = self.lock();
        match &mut *state {
            CircuitState::Closed { outcomes } => {
                Self::push_outcome(outcomes, true, self.policy.window_size);
                let samples = outcomes.len() as u32;
                let failures = outcomes.iter().filter(|f| **f).count() as u32;
                let reached = samples >= self.policy.minimum_throughput
                    && failures * 100
                        >= u32::from(self.policy.failure_threshold_percent) * samples;
                if reached {
                    *state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                }
                reached
            }
            CircuitState::HalfOpen { .. } => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    fn push_outcome(outcomes: &mut VecDeque<bool>, failed: bool, window: u32) {
        outcomes.push_back(failed);
        while outcomes.len() > window.max(1) as usize {
            outcomes.pop_front();
        }
    }
}
