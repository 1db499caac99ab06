//! Storage seams.
//!
//! The scheduler never talks to a database directly. Backends implement
//! [`Catalog`] for card lookups and [`ProgressStore`] for progress rows; the
//! `recall_store` crate ships SQLite, Postgres and in-memory versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::progress::{Progress, ReviewProgress};

/// A group of cards owned by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashcardSet {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl FlashcardSet {
    pub fn visible_to(&self, user_id: &str) -> bool {
        self.is_public || self.owner_id == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub set_id: Uuid,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

/// One applied review, appended alongside the progress upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLogEntry {
    pub id: Uuid,
    pub user_id: String,
    pub card_id: Uuid,
    pub quality: u8,
    pub reviewed_at: DateTime<Utc>,
    pub interval_days: u32,
    pub ease_factor: f64,
}

impl ReviewLogEntry {
    /// Log entry describing the review that produced `progress`.
    ///
    /// Returns `None` for progress that was never reviewed.
    pub fn for_progress(progress: &ReviewProgress) -> Option<Self> {
        Some(Self {
            id: Uuid::new_v4(),
            user_id: progress.user_id.clone(),
            card_id: progress.card_id,
            quality: progress.last_quality?,
            reviewed_at: progress.last_reviewed?,
            interval_days: progress.interval_days,
            ease_factor: progress.ease_factor,
        })
    }
}

/// Outcome of a compare-and-swap upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// The stored revision was not `revision - 1`; nothing was written.
    Conflict,
}

/// A card selected for study, with its progress or the new-card marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DueCard {
    pub card: Card,
    pub progress: Progress,
}

/// Read-only view of the flashcard catalog.
pub trait Catalog {
    fn set_visible_to(&self, user_id: &str, set_id: Uuid) -> Result<bool>;

    /// The card, if it belongs to a set the user can see.
    fn card_visible_to(&self, user_id: &str, card_id: Uuid) -> Result<Option<Card>>;
}

/// Durable (user, card) -> progress mapping.
///
/// `get` synthesizes [`Progress::New`] when no row exists.
/// `upsert` must be all-or-nothing and apply only when the stored revision
/// is `progress.revision - 1` (an absent row counts as revision 0).
pub trait ProgressStore {
    fn get(&self, user_id: &str, card_id: Uuid) -> Result<Progress>;

    fn upsert(&self, user_id: &str, card_id: Uuid, progress: &ReviewProgress)
    -> Result<UpsertOutcome>;

    /// Cards visible to the user, restricted to `set_id` when given, that
    /// have no progress row or whose `next_review_date <= now`.
    fn query_due(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueCard>>;

    /// Applied reviews for the pair, oldest first.
    fn history(&self, user_id: &str, card_id: Uuid) -> Result<Vec<ReviewLogEntry>>;
}

impl<T: Catalog + ?Sized> Catalog for &T {
    fn set_visible_to(&self, user_id: &str, set_id: Uuid) -> Result<bool> {
        (**self).set_visible_to(user_id, set_id)
    }

    fn card_visible_to(&self, user_id: &str, card_id: Uuid) -> Result<Option<Card>> {
        (**self).card_visible_to(user_id, card_id)
    }
}

impl<T: ProgressStore + ?Sized> ProgressStore for &T {
    fn get(&self, user_id: &str, card_id: Uuid) -> Result<Progress> {
        (**self).get(user_id, card_id)
    }

    fn upsert(
        &self,
        user_id: &str,
        card_id: Uuid,
        progress: &ReviewProgress,
    ) -> Result<UpsertOutcome> {
        (**self).upsert(user_id, card_id, progress)
    }

    fn query_due(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueCard>> {
        (**self).query_due(user_id, set_id, now)
    }

    fn history(&self, user_id: &str, card_id: Uuid) -> Result<Vec<ReviewLogEntry>> {
        (**self).history(user_id, card_id)
    }
}
