//! Circuit breaker guarding the remote cache tier.
//!
//! `Closed` lets every call through and counts consecutive failures. Reaching the
//! threshold opens the breaker for `cooldown`; the first call after that becomes
//! the single half-open probe. The probe's success closes the breaker, its failure
//! reopens it for a fresh cooldown. Transitions are lazy: no timer runs.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{Config, ConfigTrait};
use crate::time::{self, Clock};

const COMPONENT: &str = "breaker";

#[derive(Debug, Clone)]
pub struct BreakerOptions {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl BreakerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let mut opts = Self::default();
        if let Some(b) = cfg.breaker() {
            opts.threshold = b.threshold.unwrap_or(opts.threshold).max(1);
            opts.cooldown = b.cooldown.unwrap_or(opts.cooldown);
        }
        opts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { until: Instant },
    /// The probe is in flight; nothing else passes.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    failures: u32,
}

pub struct CircuitBreaker {
    opts: BreakerOptions,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(opts: BreakerOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            opts: BreakerOptions {
                threshold: opts.threshold.max(1),
                ..opts
            },
            clock,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                failures: 0,
            }),
        }
    }

    /// Admits one remote call, or `None` while open (and while a probe is in flight).
    ///
    /// The permit must be settled with [`Permit::succeed`] or [`Permit::fail`]; a probe
    /// permit dropped unsettled counts as a failed probe.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Closed => Some(Permit::new(self, false)),
            Phase::HalfOpen => None,
            Phase::Open { until } => {
                if self.clock.now() < until {
                    return None;
                }
                inner.phase = Phase::HalfOpen;
                info!(component = COMPONENT, event = "half_open", "cooldown elapsed, probing remote");
                Some(Permit::new(self, true))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.inner.lock().phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Current consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        if !matches!(inner.phase, Phase::Closed) {
            inner.phase = Phase::Closed;
            info!(component = COMPONENT, event = "closed", "remote recovered, breaker closed");
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);

        let trip = match inner.phase {
            Phase::HalfOpen => probe,
            Phase::Closed => inner.failures >= self.opts.threshold,
            Phase::Open { .. } => false,
        };
        if trip {
            inner.phase = Phase::Open {
                until: time::after(self.clock.now(), self.opts.cooldown),
            };
            warn!(
                component = COMPONENT,
                event = "opened",
                failures = inner.failures,
                probe,
                cooldown_ms = self.opts.cooldown.as_millis() as u64,
                "remote failing, breaker opened"
            );
        }
    }
}

/// Right to make one remote call.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_failure(true);
        }
    }
}
