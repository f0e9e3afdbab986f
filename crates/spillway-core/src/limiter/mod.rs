//! Outbound call gate: sliding-window quota + circuit breaker.
//!
//! # 状態
//! - window: 直近 `window` 内に発行した permit の時刻（古い順）
//! - circuit: Closed → Open（連続失敗が閾値に達した） → HalfOpen（cooldown 経過） → Closed / Open
//!
//! 両方とも 1 つの Mutex で守る。ロックを握ったまま await しない。
//!
//! 時刻は `tokio::time::Instant`（paused clock のテストで進められるように）。
//! `*_at(now)` 版は時刻を明示的に渡すテスト用の入口。

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RateLimitSettings;
use crate::domain::ErrorClass;

/// HalfOpen 中に trial が走っているときの再試行目安
const TRIAL_BUSY_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("rate limit reached; retry after {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    #[error("circuit open; retry after {}ms", retry_after.as_millis())]
    CircuitOpen { retry_after: Duration },
}

impl LimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            LimitError::RateLimited { retry_after } | LimitError::CircuitOpen { retry_after } => {
                *retry_after
            }
        }
    }

    /// Both variants are retried like a provider rate limit.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::RateLimit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant, until: Instant },
    HalfOpen,
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Start of the rolling window (now − window).
    pub window_start: Instant,
    pub request_count: u32,
    pub max_permits: u32,
    pub failure_streak: u32,
    pub circuit_state: CircuitState,
}

#[derive(Debug)]
struct Inner {
    issued: VecDeque<Instant>,
    failure_streak: u32,
    circuit: CircuitState,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    inner: Mutex<Inner>,
}

/// One admitted call. Report its result with [`Permit::record`].
///
/// Dropping a permit without recording is allowed (e.g. the call was cancelled);
/// it only releases the HalfOpen trial slot.
#[derive(Debug)]
#[must_use = "a permit should be recorded with its call outcome"]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    trial: bool,
    recorded: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record(mut self, success: bool) {
        self.recorded = true;
        self.limiter.record_at(success, self.trial, Instant::now());
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.recorded {
            self.limiter.lock().trial_in_flight = false;
        }
    }
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                issued: VecDeque::new(),
                failure_streak: 0,
                circuit: CircuitState::Closed,
                trial_in_flight: false,
            }),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_acquire(&self) -> Result<Permit<'_>, LimitError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<Permit<'_>, LimitError> {
        let mut inner = self.lock();

        // circuit first: an open circuit must not consume quota
        let trial = match inner.circuit {
            CircuitState::Closed => false,
            CircuitState::Open { until, .. } if now < until => {
                return Err(LimitError::CircuitOpen {
                    retry_after: until - now,
                });
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(LimitError::CircuitOpen {
                        retry_after: TRIAL_BUSY_RETRY,
                    });
                }
                if inner.circuit != CircuitState::HalfOpen {
                    info!("circuit half-open; admitting one trial call");
                    inner.circuit = CircuitState::HalfOpen;
                }
                true
            }
        };

        let window = self.settings.window;
        while let Some(&oldest) = inner.issued.front() {
            if now.saturating_duration_since(oldest) >= window {
                inner.issued.pop_front();
            } else {
                break;
            }
        }

        if inner.issued.len() >= self.settings.max_permits as usize {
            let oldest = inner.issued.front().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.saturating_duration_since(oldest));
            debug!(
                in_window = inner.issued.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "rate window saturated"
            );
            return Err(LimitError::RateLimited { retry_after });
        }

        inner.issued.push_back(now);
        if trial {
            inner.trial_in_flight = true;
        }
        Ok(Permit {
            limiter: self,
            trial,
            recorded: false,
        })
    }

    /// Like [`try_acquire`](Self::try_acquire), but sleeps through a saturated
    /// window for at most `max_wait`. An open circuit fails immediately.
    pub async fn acquire_wait(&self, max_wait: Duration) -> Result<Permit<'_>, LimitError> {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.try_acquire() {
                Ok(permit) => return Ok(permit),
                Err(LimitError::RateLimited { retry_after })
                    if Instant::now() + retry_after <= deadline =>
                {
                    tokio::time::sleep(retry_after).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Record the outcome of a call made without holding a [`Permit`].
    /// It never closes a HalfOpen circuit; only the trial does.
    pub fn record_outcome(&self, success: bool) {
        self.record_at(success, false, Instant::now());
    }

    fn record_at(&self, success: bool, trial: bool, now: Instant) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }

        if success {
            inner.failure_streak = 0;
            // HalfOpen は trial の結果だけで閉じる（open 前に出た permit は数えない）
            if trial && inner.circuit == CircuitState::HalfOpen {
                info!("trial call succeeded; circuit closed");
                inner.circuit = CircuitState::Closed;
            }
            return;
        }

        inner.failure_streak += 1;
        let reopen = match inner.circuit {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_streak >= self.settings.failure_threshold,
            CircuitState::Open { .. } => false,
        };
        if reopen {
            warn!(
                failure_streak = inner.failure_streak,
                cooldown_ms = self.settings.cooldown.as_millis() as u64,
                "circuit opened"
            );
            inner.circuit = CircuitState::Open {
                opened_at: now,
                until: now + self.settings.cooldown,
            };
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().circuit
    }

    pub fn snapshot(&self) -> RateWindow {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> RateWindow {
        let inner = self.lock();
        let window = self.settings.window;
        let request_count = inner
            .issued
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count() as u32;
        RateWindow {
            window_start: now.checked_sub(window).unwrap_or(now),
            request_count,
            max_permits: self.settings.max_permits,
            failure_streak: inner.failure_streak,
            circuit_state: inner.circuit,
        }
    }
}
