//! Application heartbeat: a JSON timestamp sent to the broker on a fixed
//! period while the session is open.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};

#[derive(Serialize)]
struct HeartbeatPayload {
    timestamp: String,
}

/// Body of one heartbeat, e.g. `{"timestamp":"2024-01-01T00:00:00.000Z"}`
pub fn heartbeat_payload(now: DateTime<Utc>) -> String {
    let payload = HeartbeatPayload {
        timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    // A struct with one string field always serializes
    serde_json::to_string(&payload).unwrap_or_default()
}

/// Owned repeating timer for the heartbeat.
///
/// At most one timer exists; `start` replaces it, `stop` drops it.
#[derive(Debug)]
pub struct HeartbeatScheduler {
    period: Duration,
    timer: Option<Interval>,
}

impl HeartbeatScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            timer: None,
        }
    }

    /// Start ticking: the first tick is immediate, then one per period.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self) {
        let mut timer = interval(self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    pub fn stop(&mut self) {
        self.timer = None;
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub async fn tick(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
