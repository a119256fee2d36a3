//! Portfolio circuit breaker.
//!
//! Trips when the daily loss (realized + unrealized since 00:00 UTC)
//! exceeds the configured limit, or when losses exceed half the limit
//! within a rolling 15-minute window (rapid-loss rule).
//!
//! Reset is manual only. `is_tripped()` is a single atomic load so agents
//! can gate their hot path on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum aggregate daily loss before tripping (USD, positive).
    pub max_daily_loss: Decimal,
    /// Rapid-loss window length.
    pub rapid_window: Duration,
    /// Fraction of the daily limit that trips within the rapid window.
    pub rapid_loss_fraction: Decimal,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: Decimal::new(100, 0),
            rapid_window: Duration::from_secs(15 * 60),
            rapid_loss_fraction: Decimal::new(50, 2),
        }
    }
}

#[derive(Debug)]
struct DayState {
    date: NaiveDate,
    realized: Decimal,
    unrealized: Decimal,
    /// Realized loss events inside the rapid window: (when, loss > 0).
    losses: VecDeque<(DateTime<Utc>, Decimal)>,
}

impl DayState {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            realized: Decimal::ZERO,
            unrealized: Decimal::ZERO,
            losses: VecDeque::new(),
        }
    }
}

/// Portfolio-wide kill switch.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    tripped: AtomicBool,
    day: Mutex<DayState>,
    reason: Mutex<Option<String>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            tripped: AtomicBool::new(false),
            day: Mutex::new(DayState::new(Utc::now().date_naive())),
            reason: Mutex::new(None),
        }
    }

    /// Whether the breaker is open. Hot-path check.
    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn trip_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Aggregate daily loss as a positive number (zero when profitable).
    pub fn daily_loss(&self) -> Decimal {
        let day = self.day.lock();
        let pnl = day.realized + day.unrealized;
        if pnl < Decimal::ZERO {
            -pnl
        } else {
            Decimal::ZERO
        }
    }

    /// Record one realized P&L event and re-evaluate the trip conditions.
    /// Returns `true` when this event newly tripped the breaker.
    pub fn record_realized(&self, pnl: Decimal) -> bool {
        let now = Utc::now();
        let mut day = self.day.lock();
        self.roll_day(&mut day, now);

        day.realized += pnl;
        if pnl < Decimal::ZERO {
            day.losses.push_back((now, -pnl));
        }
        let cutoff = now
            - chrono::Duration::from_std(self.config.rapid_window).unwrap_or_default();
        while matches!(day.losses.front(), Some((t, _)) if *t < cutoff) {
            day.losses.pop_front();
        }

        let daily_pnl = day.realized + day.unrealized;
        if -daily_pnl > self.config.max_daily_loss {
            let reason = format!(
                "daily loss {} exceeds limit {}",
                -daily_pnl, self.config.max_daily_loss
            );
            drop(day);
            return self.trip(&reason);
        }

        let rapid: Decimal = day.losses.iter().map(|(_, loss)| *loss).sum();
        let rapid_limit = self.config.max_daily_loss * self.config.rapid_loss_fraction;
        if rapid > rapid_limit {
            let reason = format!(
                "rapid loss {} exceeds {} within {:?}",
                rapid, rapid_limit, self.config.rapid_window
            );
            drop(day);
            return self.trip(&reason);
        }
        false
    }

    /// Update the mark-to-market component of the daily loss and re-check
    /// the daily limit. Returns `true` when this newly tripped the breaker.
    pub fn set_unrealized(&self, unrealized: Decimal) -> bool {
        let now = Utc::now();
        let mut day = self.day.lock();
        self.roll_day(&mut day, now);
        day.unrealized = unrealized;
        let daily_pnl = day.realized + day.unrealized;
        if -daily_pnl > self.config.max_daily_loss {
            let reason = format!(
                "daily loss {} exceeds limit {}",
                -daily_pnl, self.config.max_daily_loss
            );
            drop(day);
            return self.trip(&reason);
        }
        false
    }

    /// Trip the breaker. Returns `true` only for the transition.
    pub fn trip(&self, reason: &str) -> bool {
        let newly = !self.tripped.swap(true, Ordering::AcqRel);
        if newly {
            *self.reason.lock() = Some(reason.to_string());
            error!(reason, "CB:TRIPPED circuit breaker open");
        }
        newly
    }

    /// Manual reset by an operator. Logged; there is no automatic reset.
    pub fn reset(&self, operator: &str) {
        self.tripped.store(false, Ordering::Release);
        *self.reason.lock() = None;
        let mut day = self.day.lock();
        day.losses.clear();
        info!(operator, "circuit breaker manually reset");
    }

    fn roll_day(&self, day: &mut DayState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if day.date != today {
            *day = DayState::new(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn breaker(limit: Decimal) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            max_daily_loss: limit,
            ..Default::default()
        })
    }

    #[test]
    fn stays_closed_under_limit() {
        let cb = breaker(dec!(100));
        assert!(!cb.record_realized(dec!(-40)));
        assert!(!cb.is_tripped());
        assert_eq!(cb.daily_loss(), dec!(40));
    }

    #[test]
    fn trips_once_on_daily_limit() {
        let cb = breaker(dec!(100));
        cb.record_realized(dec!(-60));
        // -60 then -140 total: crossing the limit trips exactly once.
        let newly = cb.record_realized(dec!(-80));
        assert!(newly);
        assert!(cb.is_tripped());
        assert!(!cb.record_realized(dec!(-10)));
    }

    #[test]
    fn rapid_loss_rule_trips_below_daily_limit() {
        let cb = breaker(dec!(100));
        // 40 + 30 = 70 > 50 (half the limit) inside the window.
        assert!(!cb.record_realized(dec!(-40)));
        assert!(cb.record_realized(dec!(-30)));
        assert!(cb.is_tripped());
    }

    #[test]
    fn profits_offset_daily_loss_but_not_rapid_rule() {
        let cb = breaker(dec!(100));
        cb.record_realized(dec!(200));
        assert!(!cb.record_realized(dec!(-45)));
        // Daily P&L is +155 yet realized losses of 90 within the window
        // still trigger the rapid rule.
        assert!(cb.record_realized(dec!(-45)));
    }

    #[test]
    fn unrealized_counts_toward_daily_loss() {
        let cb = breaker(dec!(100));
        cb.record_realized(dec!(-40));
        assert!(cb.set_unrealized(dec!(-70)));
        assert!(cb.is_tripped());
    }

    #[test]
    fn manual_reset_reopens() {
        let cb = breaker(dec!(100));
        cb.trip("test");
        assert!(cb.is_tripped());
        cb.reset("operator");
        assert!(!cb.is_tripped());
        assert!(cb.trip_reason().is_none());
    }
}
