//! Circuit breaker keyed by step signature
//!
//! States:
//! - Closed: calls proceed, outcomes fill a rolling window
//! - Open: calls are short-circuited until the cool-down has elapsed
//! - HalfOpen: one probe call decides between Closed and Open

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

fn default_enabled() -> bool {
    true
}

fn default_window_size() -> usize {
    10
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_min_calls() -> usize {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Number of most recent calls considered
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Failure rate (0.0 - 1.0) at which the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Calls required in the window before the rate is evaluated
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,

    /// Time spent open before a probe is allowed
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_size: default_window_size(),
            failure_threshold: default_failure_threshold(),
            min_calls: default_min_calls(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Circuit state for one signature
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open {
        /// When the circuit was opened
        since: Instant,
    },
    HalfOpen {
        /// A probe call has been let through and not reported yet
        probe_in_flight: bool,
    },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// true = success
    window: VecDeque<bool>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Per-signature circuit breakers
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

/// Admission for one call, returned by [`CircuitBreaker::allow`]
///
/// A half-open probe dropped without a recorded outcome reopens the circuit.
#[derive(Debug)]
#[must_use]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    signature: String,
    probe: bool,
    reported: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.record_success(&self.signature);
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.record_failure(&self.signature);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.reported {
            self.breaker.abandon_probe(&self.signature);
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a call for this signature, or `None` while the circuit is open
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and lets
    /// exactly one probe through.
    pub fn allow(&self, signature: &str) -> Option<CircuitPermit<'_>> {
        let permit = |probe| CircuitPermit {
            breaker: self,
            signature: signature.to_string(),
            probe,
            reported: false,
        };
        if !self.config.enabled {
            return Some(permit(false));
        }

        let mut circuits = self.circuits();
        let circuit = circuits
            .entry(signature.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => Some(permit(false)),
            CircuitState::Open { since } => {
                let cooldown = Duration::from_millis(self.config.cooldown_ms);
                if since.elapsed() >= cooldown {
                    circuit.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(signature = %signature, "Circuit breaker entering half-open state");
                    Some(permit(true))
                } else {
                    debug!(
                        signature = %signature,
                        remaining_ms = (cooldown - since.elapsed()).as_millis() as u64,
                        "Circuit breaker open"
                    );
                    None
                }
            }
            CircuitState::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    None
                } else {
                    circuit.state = CircuitState::HalfOpen {
                        probe_in_flight: true,
                    };
                    Some(permit(true))
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, signature: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits();
        let circuit = circuits
            .entry(signature.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {
                circuit.state = CircuitState::Closed;
                circuit.window.clear();
                info!(signature = %signature, "Circuit breaker closed after successful probe");
            }
            CircuitState::Closed => self.push(circuit, true),
        }
    }

    /// Record a failed call; may open the circuit
    pub fn record_failure(&self, signature: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits();
        let circuit = circuits
            .entry(signature.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen { .. } => {
                circuit.state = CircuitState::Open {
                    since: Instant::now(),
                };
                warn!(signature = %signature, "Circuit breaker reopened after failed probe");
            }
            CircuitState::Open { .. } => {}
            CircuitState::Closed => {
                self.push(circuit, false);
                let rate = circuit.failure_rate();
                if circuit.window.len() >= self.config.min_calls
                    && rate >= self.config.failure_threshold
                {
                    circuit.state = CircuitState::Open {
                        since: Instant::now(),
                    };
                    warn!(
                        signature = %signature,
                        failure_rate = rate,
                        "Circuit breaker opened"
                    );
                }
            }
        }
    }

    /// A probe ended without an outcome; start a fresh cool-down
    fn abandon_probe(&self, signature: &str) {
        let mut circuits = self.circuits();
        if let Some(circuit) = circuits.get_mut(signature) {
            if circuit.state == (CircuitState::HalfOpen { probe_in_flight: true }) {
                circuit.state = CircuitState::Open {
                    since: Instant::now(),
                };
                warn!(signature = %signature, "Circuit breaker probe abandoned, reopening");
            }
        }
    }

    /// Current state; closed for unknown signatures
    pub fn state(&self, signature: &str) -> CircuitState {
        self.circuits()
            .get(signature)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn push(&self, circuit: &mut Circuit, success: bool) {
        circuit.window.push_back(success);
        while circuit.window.len() > self.config.window_size.max(1) {
            circuit.window.pop_front();
        }
    }
}
