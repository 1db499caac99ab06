//! SM-2 scheduling.
//!
//! Quality ratings (0-5):
//! - 0: no recall at all
//! - 1: wrong, answer recognised once shown
//! - 2: wrong, answer felt familiar
//! - 3: correct with serious difficulty
//! - 4: correct after hesitation
//! - 5: instant recall
//!
//! Anything below 3 is a lapse.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::progress::{INITIAL_EASE, MIN_EASE, Progress, ReviewProgress};

/// Lowest quality that counts as a successful recall.
pub const SUCCESS_THRESHOLD: u8 = 3;

/// A validated self-assessed recall score in `0..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Quality(u8);

impl Quality {
    pub fn new(value: i64) -> Result<Self> {
        match u8::try_from(value) {
            Ok(value) if value <= 5 => Ok(Self(value)),
            _ => Err(Error::invalid(format!(
                "quality must be between 0 and 5, got {value}"
            ))),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_lapse(self) -> bool {
        self.0 < SUCCESS_THRESHOLD
    }

    pub fn grade(self) -> Grade {
        match self.0 {
            0 => Grade::Again,
            1 => Grade::Hard,
            2 => Grade::Difficult,
            3 => Grade::Good,
            4 => Grade::Easy,
            _ => Grade::Perfect,
        }
    }
}

impl TryFrom<i64> for Quality {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Quality::new(value)
    }
}

impl From<Quality> for u8 {
    fn from(quality: Quality) -> Self {
        quality.0
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display labels for the six quality values.
///
/// Success is always decided by the numeric value, so relabelling a button
/// cannot move the lapse boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Again,
    Hard,
    Difficult,
    Good,
    Easy,
    Perfect,
}

impl Grade {
    pub const ALL: [Grade; 6] = [
        Grade::Again,
        Grade::Hard,
        Grade::Difficult,
        Grade::Good,
        Grade::Easy,
        Grade::Perfect,
    ];

    pub fn quality(self) -> Quality {
        Quality(self as u8)
    }

    pub fn is_success(self) -> bool {
        !self.quality().is_lapse()
    }

    pub fn label(self) -> &'static str {
        match self {
            Grade::Again => "Again",
            Grade::Hard => "Hard",
            Grade::Difficult => "Difficult",
            Grade::Good => "Good",
            Grade::Easy => "Easy",
            Grade::Perfect => "Perfect",
        }
    }
}

/// `ease + (0.1 - (5 - q) * (0.08 + (5 - q) * 0.02))`, floored at [`MIN_EASE`].
pub fn next_ease(ease: f64, quality: Quality) -> f64 {
    let miss = f64::from(5 - quality.value());
    let delta = 0.1 - miss * (0.08 + miss * 0.02);
    (ease + delta).max(MIN_EASE)
}

/// Compute the progress that results from reviewing `prior` with `quality` at `now`.
///
/// Pure: reads no clock and touches no storage. A stored prior that fails
/// [`ReviewProgress::validate`] is rejected rather than repaired.
pub fn compute_next_progress(
    user_id: &str,
    card_id: uuid::Uuid,
    prior: &Progress,
    quality: Quality,
    now: DateTime<Utc>,
) -> Result<ReviewProgress> {
    let (ease, repetitions, interval, lapses, review_count, revision) = match prior {
        Progress::New => (INITIAL_EASE, 0, 0, 0, 0, 0),
        Progress::Existing(progress) => {
            progress.validate()?;
            if progress.user_id != user_id || progress.card_id != card_id {
                return Err(Error::invalid(format!(
                    "progress belongs to ({}, {}), not ({user_id}, {card_id})",
                    progress.user_id, progress.card_id
                )));
            }
            (
                progress.ease_factor,
                progress.repetitions,
                progress.interval_days,
                progress.lapses,
                progress.review_count,
                progress.revision,
            )
        }
    };

    let ease = next_ease(ease, quality);

    let (repetitions, interval_days, lapses) = if quality.is_lapse() {
        (0, 1, lapses.saturating_add(1))
    } else {
        let repetitions = repetitions.saturating_add(1);
        let interval_days = match repetitions {
            1 => 1,
            2 => 6,
            _ => (f64::from(interval) * ease).round() as u32,
        };
        (repetitions, interval_days, lapses)
    };

    let next_review_date = now
        .checked_add_signed(Duration::days(i64::from(interval_days)))
        .ok_or_else(|| Error::invalid(format!("interval of {interval_days} days overflows")))?;

    Ok(ReviewProgress {
        user_id: user_id.to_string(),
        card_id,
        ease_factor: ease,
        repetitions,
        interval_days,
        last_reviewed: Some(now),
        next_review_date: Some(next_review_date),
        last_quality: Some(quality.value()),
        lapses,
        review_count: review_count.saturating_add(1),
        revision: revision.saturating_add(1),
    })
}
