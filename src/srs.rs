//! Review scheduling.
//!
//! A card's schedule is updated on every review from its previous interval and
//! ease factor. Failing grades (Again/Hard) send the card back to interval 0;
//! passing grades walk the bootstrap ladder 0 → 1 → 6 days and then grow the
//! interval geometrically by the ease factor. The ease factor itself moves by
//! the SM-2 adjustment on every review and never drops below 1.3.
//!
//! `stage` counts consecutive passing reviews. It is recorded for display and
//! statistics only; interval growth is driven by the previous interval.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EASE_FACTOR: f64 = 2.5;
pub const MIN_EASE_FACTOR: f64 = 1.3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("grade must be between 1 and 4, got {0}")]
    InvalidGrade(i64),
    #[error("invalid schedule state: {0}")]
    InvalidState(String),
}

/// Recall quality reported by the reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Grade {
    Again = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Grade {
    pub fn passed(self) -> bool {
        self >= Grade::Good
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

impl TryFrom<i64> for Grade {
    type Error = SchedulerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Grade::Again),
            2 => Ok(Grade::Hard),
            3 => Ok(Grade::Good),
            4 => Ok(Grade::Easy),
            other => Err(SchedulerError::InvalidGrade(other)),
        }
    }
}

/// Scheduling fields of a card, as persisted alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardScheduleState {
    pub stage: u32,
    pub ease_factor: f64,
    /// Days until the next review. 0 means due the same day.
    pub interval: u32,
    pub next_review: DateTime<Utc>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
}

impl CardScheduleState {
    /// Schedule of a freshly created card: due immediately.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage: 0,
            ease_factor: DEFAULT_EASE_FACTOR,
            interval: 0,
            next_review: now,
            last_reviewed_at: None,
        }
    }

    /// Builds a state from raw storage columns, rejecting values that could
    /// only come from a corrupted row.
    pub fn from_stored(
        stage: i64,
        ease_factor: f64,
        interval: i64,
        next_review: DateTime<Utc>,
        last_reviewed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, SchedulerError> {
        let stage = u32::try_from(stage)
            .map_err(|_| SchedulerError::InvalidState(format!("stage out of range: {stage}")))?;
        let interval = u32::try_from(interval).map_err(|_| {
            SchedulerError::InvalidState(format!("interval out of range: {interval}"))
        })?;
        let state = Self {
            stage,
            ease_factor,
            interval,
            next_review,
            last_reviewed_at,
        };
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<(), SchedulerError> {
        if !self.ease_factor.is_finite() {
            return Err(SchedulerError::InvalidState(format!(
                "ease factor is not finite: {}",
                self.ease_factor
            )));
        }
        if self.ease_factor < MIN_EASE_FACTOR {
            return Err(SchedulerError::InvalidState(format!(
                "ease factor {} is below the floor of {MIN_EASE_FACTOR}",
                self.ease_factor
            )));
        }
        Ok(())
    }
}

/// Calculates the schedule that follows a review graded `grade` at `now`.
///
/// Interval:
/// - grade < Good: 0 (lapse)
/// - interval 0: 1 day
/// - interval 1: 6 days
/// - otherwise: round(interval * ease_factor), using the ease factor the card
///   had before this review
///
/// Ease factor: EF' = max(1.3, EF + (0.1 - (5 - q) * (0.08 + (5 - q) * 0.02)))
pub fn compute_next_review(
    state: &CardScheduleState,
    grade: Grade,
    now: DateTime<Utc>,
) -> Result<CardScheduleState, SchedulerError> {
    state.validate()?;

    let (stage, interval) = if grade.passed() {
        let interval = match state.interval {
            0 => 1,
            1 => 6,
            n => grow_interval(n, state.ease_factor)?,
        };
        (state.stage.saturating_add(1), interval)
    } else {
        (0, 0)
    };

    let q = f64::from(grade.value());
    let ease_factor =
        (state.ease_factor + (0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02))).max(MIN_EASE_FACTOR);

    let next_review = now
        .checked_add_signed(Duration::days(i64::from(interval)))
        .ok_or_else(|| {
            SchedulerError::InvalidState(format!("next review {interval} days out is unrepresentable"))
        })?;

    Ok(CardScheduleState {
        stage,
        ease_factor,
        interval,
        next_review,
        last_reviewed_at: Some(now),
    })
}

fn grow_interval(interval: u32, ease_factor: f64) -> Result<u32, SchedulerError> {
    let grown = (f64::from(interval) * ease_factor).round();
    if grown > f64::from(u32::MAX) {
        return Err(SchedulerError::InvalidState(format!(
            "interval {interval} overflows when multiplied by {ease_factor}"
        )));
    }
    Ok(grown as u32)
}

#[cfg(test)]
#[path = "srs_tests.rs"]
mod tests;
