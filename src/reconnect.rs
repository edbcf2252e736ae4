//! Failure classification and the reconnect schedule.

use crate::config::ReconnectConfig;
use crate::error::Error;
use std::pin::Pin;
use tokio::time::{sleep, Duration, Sleep};

/// Lowercase fragments that mark a broker rejection as an auth failure
const AUTH_SIGNATURES: &[&str] = &[
    "401",
    "unauthorized",
    "authentication",
    "invalid token",
    "expired token",
];

/// Whether a broker message reads as an authentication rejection
pub fn is_auth_failure(text: &str) -> bool {
    let text = text.to_lowercase();
    AUTH_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// How a failure affects reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying cannot help (bad credentials). Wait for an explicit `connect()`.
    Permanent,
    /// Network or broker trouble; retry on the backoff schedule
    Transient,
}

impl FailureClass {
    /// Classify a session-ending error.
    ///
    /// Only broker ERROR frames can be permanent, and only when their
    /// message or details carry an authentication signature.
    pub fn of(error: &Error) -> FailureClass {
        match error {
            Error::Protocol { message, details } => {
                let auth = is_auth_failure(message)
                    || details.as_deref().is_some_and(is_auth_failure);
                if auth {
                    FailureClass::Permanent
                } else {
                    FailureClass::Transient
                }
            }
            _ => FailureClass::Transient,
        }
    }
}

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Permanent failure: stay closed
    GiveUp,
    /// Attempt cap reached
    Exhausted { attempts: u32 },
    /// Try again after `delay`; `attempt` is 1-indexed
    Retry { attempt: u32, delay: Duration },
}

/// Bounded reconnect policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Decide the next step given the attempts already made in this episode.
    pub fn decide(&self, attempts: u32, class: FailureClass) -> ReconnectDecision {
        if class == FailureClass::Permanent {
            return ReconnectDecision::GiveUp;
        }
        if attempts >= self.config.max_attempts {
            return ReconnectDecision::Exhausted { attempts };
        }
        let attempt = attempts + 1;
        ReconnectDecision::Retry {
            attempt,
            delay: self.config.delay_for_attempt(attempt),
        }
    }
}

/// Owned one-shot reconnect timer. At most one is pending.
#[derive(Debug, Default)]
pub struct ReconnectTimer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl ReconnectTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any pending one
    pub fn schedule(&mut self, delay: Duration) {
        self.sleep = Some(Box::pin(sleep(delay)));
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    /// Wait for the timer to fire, then disarm it. Pends forever when idle.
    pub async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
