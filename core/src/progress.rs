use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Ease factor assigned on a card's first review.
pub const INITIAL_EASE: f64 = 2.5;

/// Hard floor for the ease factor.
pub const MIN_EASE: f64 = 1.3;

/// Memory-strength state for one (user, card) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewProgress {
    pub user_id: String,
    pub card_id: Uuid,
    pub ease_factor: f64,
    pub repetitions: u32,
    pub interval_days: u32,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub next_review_date: Option<DateTime<Utc>>,
    pub last_quality: Option<u8>,
    pub lapses: u32,
    pub review_count: u32,
    /// Compare-and-swap counter; the stored row must hold `revision - 1`.
    pub revision: u32,
}

/// Progress as seen by the scheduler: a stored row, or a card never reviewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Progress {
    New,
    Existing(ReviewProgress),
}

impl Progress {
    pub fn from_row(row: Option<ReviewProgress>) -> Self {
        match row {
            Some(progress) => Progress::Existing(progress),
            None => Progress::New,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Progress::New)
    }

    pub fn as_existing(&self) -> Option<&ReviewProgress> {
        match self {
            Progress::Existing(progress) => Some(progress),
            Progress::New => None,
        }
    }

    /// New cards are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            Progress::New => true,
            Progress::Existing(progress) => progress
                .next_review_date
                .is_none_or(|due| due <= now),
        }
    }

    pub fn ease_factor(&self) -> f64 {
        match self {
            Progress::New => INITIAL_EASE,
            Progress::Existing(progress) => progress.ease_factor,
        }
    }

    pub fn repetitions(&self) -> u32 {
        self.as_existing().map_or(0, |progress| progress.repetitions)
    }

    pub fn interval_days(&self) -> u32 {
        self.as_existing().map_or(0, |progress| progress.interval_days)
    }

    pub fn revision(&self) -> u32 {
        self.as_existing().map_or(0, |progress| progress.revision)
    }

    pub fn next_review_date(&self) -> Option<DateTime<Utc>> {
        self.as_existing().and_then(|progress| progress.next_review_date)
    }
}

impl From<Option<ReviewProgress>> for Progress {
    fn from(row: Option<ReviewProgress>) -> Self {
        Progress::from_row(row)
    }
}

impl ReviewProgress {
    /// Reject records that could not have been produced by the scheduler.
    pub fn validate(&self) -> Result<()> {
        if !self.ease_factor.is_finite() || self.ease_factor < MIN_EASE {
            return Err(Error::invalid(format!(
                "progress for card {} has ease factor {} below floor {MIN_EASE}",
                self.card_id, self.ease_factor
            )));
        }
        if self.repetitions >= 1 && self.interval_days < 1 {
            return Err(Error::invalid(format!(
                "progress for card {} has {} repetitions but interval {}",
                self.card_id, self.repetitions, self.interval_days
            )));
        }
        if self.revision == 0 {
            return Err(Error::invalid(format!(
                "progress for card {} has revision 0",
                self.card_id
            )));
        }
        match (self.last_reviewed, self.next_review_date) {
            (Some(last), Some(next)) => {
                let expected = last
                    .checked_add_signed(Duration::days(i64::from(self.interval_days)))
                    .ok_or_else(|| {
                        Error::invalid(format!(
                            "progress for card {} reviewed {last} with interval {} overflows",
                            self.card_id, self.interval_days
                        ))
                    })?;
                if next != expected {
                    return Err(Error::invalid(format!(
                        "progress for card {} is due {next}, expected {} days after {last}",
                        self.card_id, self.interval_days
                    )));
                }
            }
            _ => {
                return Err(Error::invalid(format!(
                    "progress for card {} is missing review timestamps",
                    self.card_id
                )));
            }
        }
        match self.last_quality {
            Some(quality) if quality > 5 => Err(Error::invalid(format!(
                "progress for card {} has last quality {quality}",
                self.card_id
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(now: DateTime<Utc>) -> ReviewProgress {
        ReviewProgress {
            user_id: "u1".to_string(),
            card_id: Uuid::new_v4(),
            ease_factor: 2.5,
            repetitions: 2,
            interval_days: 6,
            last_reviewed: Some(now),
            next_review_date: Some(now + Duration::days(6)),
            last_quality: Some(4),
            lapses: 0,
            review_count: 2,
            revision: 2,
        }
    }

    #[test]
    fn new_progress_is_always_due() {
        let epoch = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert!(Progress::New.is_due(epoch));
        assert_eq!(Progress::New.ease_factor(), INITIAL_EASE);
        assert_eq!(Progress::New.revision(), 0);
    }

    #[test]
    fn existing_progress_due_at_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let progress = Progress::Existing(sample(now));
        assert!(!progress.is_due(now + Duration::days(6) - Duration::seconds(1)));
        assert!(progress.is_due(now + Duration::days(6)));
    }

    #[test]
    fn validate_accepts_scheduler_output() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        assert!(sample(now).validate().is_ok());
    }

    #[test]
    fn validate_rejects_broken_rows() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        let mut low_ease = sample(now);
        low_ease.ease_factor = 1.1;
        assert!(matches!(low_ease.validate(), Err(Error::InvalidInput(_))));

        let mut zero_interval = sample(now);
        zero_interval.interval_days = 0;
        assert!(zero_interval.validate().is_err());

        let mut no_dates = sample(now);
        no_dates.next_review_date = None;
        assert!(no_dates.validate().is_err());

        let mut drifted = sample(now);
        drifted.next_review_date = Some(now + Duration::days(7));
        assert!(drifted.validate().is_err());

        let mut nan = sample(now);
        nan.ease_factor = f64::NAN;
        assert!(nan.validate().is_err());
    }

    #[test]
    fn validate_rejects_due_date_past_calendar_end() {
        let last = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let edge = ReviewProgress {
            interval_days: 10,
            last_reviewed: Some(last),
            next_review_date: Some(DateTime::<Utc>::MAX_UTC),
            ..sample(Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap())
        };
        assert!(matches!(edge.validate(), Err(Error::InvalidInput(_))));

        let prior = Progress::Existing(edge.clone());
        let quality = crate::schedule::Quality::new(4).unwrap();
        let result = crate::schedule::compute_next_progress(
            &edge.user_id,
            edge.card_id,
            &prior,
            quality,
            last,
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
