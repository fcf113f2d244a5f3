// Copyright 2020 The Exonum Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-endpoint circuit breaker.
//!
//! Each action endpoint carries its own state machine over
//! CLOSED / OPEN / HALF_OPEN. Only infrastructure failures trip it
//! (see [`BrokerError::trips_breaker`]); an OPEN endpoint is skipped by
//! selection until `half_open_timeout` elapses, after which exactly one
//! probe call is let through.
//!
//! [`BrokerError::trips_breaker`]: crate::errors::BrokerError::trips_breaker

use serde_derive::{Deserialize, Serialize};

use std::time::{Duration, Instant};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Is circuit breaking enabled? When disabled, endpoints are always
    /// selectable regardless of failures.
    pub enabled: bool,
    /// Failures within `window` that open the circuit.
    pub max_failures: u32,
    /// Length of the failure-counting window, in milliseconds.
    pub window: u64,
    /// How long an open circuit blocks selection before a single probe is
    /// allowed, in milliseconds.
    pub half_open_timeout: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            window: 60_000,
            half_open_timeout: 10_000,
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow through; failures are counted.
    Closed,
    /// Requests are blocked until the half-open timeout elapses.
    Open,
    /// One probe request is in flight; its outcome decides the next state.
    HalfOpen,
}

/// Failure state machine of one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Total requests admitted through this breaker.
    requests: u64,
    /// Failures within the current window.
    failures: u32,
    window_started_at: Instant,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    /// Set while the single half-open probe is outstanding.
    probe_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            requests: 0,
            failures: 0,
            window_started_at: Instant::now(),
            opened_at: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

impl CircuitBreaker {
    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Total requests admitted.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Failures counted in the current window.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Instant of the most recent counted failure.
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Non-mutating peek: would [`Self::try_acquire`] currently admit a
    /// caller? Used by the availability filter, which must not consume
    /// half-open probes of endpoints that end up not being chosen.
    pub fn would_admit(&self, config: &BreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(self.window_started_at);
                opened_at.elapsed() >= Duration::from_millis(config.half_open_timeout)
            }
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    /// May this endpoint be offered to selection right now?
    ///
    /// For an OPEN circuit whose `half_open_timeout` has elapsed this
    /// transitions to HALF_OPEN and admits the caller as the probe; a
    /// HALF_OPEN circuit admits nothing while its probe is outstanding.
    pub fn try_acquire(&mut self, config: &BreakerConfig) -> bool {
        if !config.enabled {
            self.requests += 1;
            return true;
        }
        match self.state {
            CircuitState::Closed => {
                self.requests += 1;
                true
            }
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(self.window_started_at);
                if opened_at.elapsed() >= Duration::from_millis(config.half_open_timeout) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    self.requests += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    self.requests += 1;
                    true
                }
            }
        }
    }

    /// Records a successful call. A successful half-open probe closes the
    /// circuit and resets the counters.
    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failures = 0;
                self.opened_at = None;
                self.probe_in_flight = false;
                self.window_started_at = Instant::now();
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    /// Records a counted failure. Opens the circuit once `max_failures`
    /// accumulate within the window; a failed half-open probe reopens it
    /// immediately.
    pub fn on_failure(&mut self, config: &BreakerConfig) {
        if !config.enabled {
            return;
        }
        let now = Instant::now();
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                if now.duration_since(self.window_started_at)
                    > Duration::from_millis(config.window)
                {
                    // Start a fresh window at this failure.
                    self.window_started_at = now;
                    self.failures = 0;
                }
                self.failures += 1;
                if self.failures >= config.max_failures {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }
}
