//! Outbound call pacing for the weather provider.
//!
//! Two ceilings apply at once: a short rolling window (10 calls a minute by
//! default) and a daily quota (500 calls) that resets at midnight in a fixed
//! reference offset rather than the machine's local time. Both are enforced by
//! making the caller wait, never by rejecting the call.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Source of the current wall-clock time, used to decide the calendar day.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateError {
    #[error("rate-limited wait was cancelled")]
    Cancelled,
}

/// Ceilings and delays for outbound provider calls. A ceiling of 0 disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    /// Minimum pause after every granted call, in milliseconds.
    pub min_interval_ms: u64,
    pub window_secs: u64,
    pub window_ceiling: u32,
    pub daily_ceiling: u32,
    /// Offset east of UTC that defines when a day starts.
    pub utc_offset_secs: i32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            min_interval_ms: 6_100,
            window_secs: 60,
            window_ceiling: 10,
            daily_ceiling: 500,
            utc_offset_secs: 0,
        }
    }
}

impl RateLimits {
    /// No waiting at all. Useful for tests and local mock providers.
    pub fn unlimited() -> Self {
        Self {
            min_interval_ms: 0,
            window_secs: 0,
            window_ceiling: 0,
            daily_ceiling: 0,
            utc_offset_secs: 0,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Reject settings that cannot describe a day boundary.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            FixedOffset::east_opt(self.utc_offset_secs).is_some(),
            "rate_limits.utc_offset_secs must be within one day of UTC (got {})",
            self.utc_offset_secs
        );
        Ok(())
    }

    pub fn reference_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug)]
pub struct RateController {
    limits: RateLimits,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    current_date: Option<NaiveDate>,
    calls_today: u32,
    window_start: Instant,
    calls_in_window: u32,
}

impl RateController {
    pub fn new(limits: RateLimits) -> Self {
        Self::with_clock(limits, Arc::new(SystemClock))
    }

    pub fn with_clock(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            clock,
            cancel: CancellationToken::new(),
            current_date: None,
            calls_today: 0,
            window_start: Instant::now(),
            calls_in_window: 0,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn calls_today(&self) -> u32 {
        self.calls_today
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Wait until one more provider call is allowed.
    ///
    /// Reaching the daily ceiling parks the caller until the next reference
    /// midnight; both counters start fresh when it returns.
    pub async fn acquire(&mut self) -> Result<(), RateError> {
        if self.cancel.is_cancelled() {
            return Err(RateError::Cancelled);
        }

        let now = self.clock.now();
        self.roll_day(now);
        self.calls_today += 1;

        if self.limits.daily_ceiling > 0 && self.calls_today >= self.limits.daily_ceiling {
            let wait = until_next_midnight(now, self.limits.reference_offset());
            info!(
                calls_today = self.calls_today,
                wait_secs = wait.as_secs(),
                "daily call ceiling reached, waiting for the next day"
            );
            self.pause(wait).await?;

            self.current_date = Some(self.today(self.clock.now()));
            self.calls_today = 0;
            self.window_start = Instant::now();
            self.calls_in_window = 0;
            return Ok(());
        }

        let wait = self.reserve_window_slot().max(self.limits.min_interval());
        debug!(
            calls_today = self.calls_today,
            calls_in_window = self.calls_in_window,
            wait_ms = wait.as_millis() as u64,
            "pacing provider call"
        );
        self.pause(wait).await
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.limits.reference_offset()).date_naive()
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = self.today(now);
        if self.current_date != Some(today) {
            if self.current_date.is_some() {
                debug!(%today, "new day, resetting daily call counter");
            }
            self.current_date = Some(today);
            self.calls_today = 0;
        }
    }

    /// Count this call in the short window; returns how long to wait for the
    /// window to have room.
    fn reserve_window_slot(&mut self) -> Duration {
        let window = self.limits.window();
        if self.limits.window_ceiling == 0 || window.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.calls_in_window = 0;
        }

        let wait = if self.calls_in_window >= self.limits.window_ceiling {
            let next = self.window_start + window;
            self.window_start = next;
            self.calls_in_window = 0;
            next.saturating_duration_since(now)
        } else {
            Duration::ZERO
        };

        self.calls_in_window += 1;
        wait
    }

    async fn pause(&self, wait: Duration) -> Result<(), RateError> {
        if self.cancel.is_cancelled() {
            return Err(RateError::Cancelled);
        }
        if wait.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(RateError::Cancelled),
            _ = tokio::time::sleep(wait) => {
                if self.cancel.is_cancelled() {
                    Err(RateError::Cancelled)
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn until_next_midnight(now: DateTime<Utc>, offset: FixedOffset) -> Duration {
    let next_midnight = now
        .with_timezone(&offset)
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single());

    match next_midnight {
        Some(midnight) => (midnight.with_timezone(&Utc) - now).to_std().unwrap_or_default(),
        None => Duration::ZERO,
    }
}
