use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use recall_core::{
    Card, Catalog, DueCard, FlashcardSet, Progress, ProgressStore, ReviewLogEntry,
    ReviewProgress, UpsertOutcome,
};
use tracing::debug;
use uuid::Uuid;

use crate::{Db, DbError, DbResult, now_micros};

#[derive(Default)]
struct State {
    sets: Vec<FlashcardSet>,
    cards: Vec<Card>,
    progress: HashMap<(String, Uuid), ReviewProgress>,
    log: Vec<ReviewLogEntry>,
}

impl State {
    fn set(&self, set_id: Uuid) -> Option<&FlashcardSet> {
        self.sets.iter().find(|set| set.id == set_id)
    }

    fn card_visible(&self, user_id: &str, card: &Card) -> bool {
        self.set(card.set_id).is_some_and(|set| set.visible_to(user_id))
    }
}

/// Process-local backend for tests and the `memory` BACKEND.
///
/// Each call holds the lock for the duration of one operation only, so the
/// revision check is what serializes competing reviews of the same pair.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| DbError::Poisoned("memory store"))
    }
}

impl Catalog for MemoryStore {
    fn set_visible_to(&self, user_id: &str, set_id: Uuid) -> recall_core::Result<bool> {
        let state = self.lock()?;
        Ok(state.set(set_id).is_some_and(|set| set.visible_to(user_id)))
    }

    fn card_visible_to(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Option<Card>> {
        let state = self.lock()?;
        Ok(state
            .cards
            .iter()
            .find(|card| card.id == card_id && state.card_visible(user_id, card))
            .cloned())
    }
}

impl ProgressStore for MemoryStore {
    fn get(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Progress> {
        let state = self.lock()?;
        Ok(Progress::from_row(
            state.progress.get(&(user_id.to_string(), card_id)).cloned(),
        ))
    }

    fn upsert(
        &self,
        user_id: &str,
        card_id: Uuid,
        progress: &ReviewProgress,
    ) -> recall_core::Result<UpsertOutcome> {
        if progress.user_id != user_id || progress.card_id != card_id {
            return Err(recall_core::Error::invalid(format!(
                "progress for ({}, {}) written under ({user_id}, {card_id})",
                progress.user_id, progress.card_id
            )));
        }

        let mut state = self.lock()?;
        let key = (user_id.to_string(), card_id);
        let stored = state.progress.get(&key).map_or(0, |row| row.revision);
        if stored.checked_add(1) != Some(progress.revision) {
            debug!(user_id, %card_id, stored, attempted = progress.revision, "revision mismatch");
            return Ok(UpsertOutcome::Conflict);
        }

        state.progress.insert(key, progress.clone());
        if let Some(entry) = ReviewLogEntry::for_progress(progress) {
            state.log.push(entry);
        }
        Ok(UpsertOutcome::Applied)
    }

    fn query_due(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> recall_core::Result<Vec<DueCard>> {
        let state = self.lock()?;
        let mut cards: Vec<&Card> = state
            .cards
            .iter()
            .filter(|card| set_id.is_none_or(|set_id| card.set_id == set_id))
            .filter(|card| state.card_visible(user_id, card))
            .collect();
        cards.sort_by_key(|card| (card.created_at, card.id));

        Ok(cards
            .into_iter()
            .filter_map(|card| {
                let progress = Progress::from_row(
                    state.progress.get(&(user_id.to_string(), card.id)).cloned(),
                );
                progress.is_due(now).then(|| DueCard {
                    card: card.clone(),
                    progress,
                })
            })
            .collect())
    }

    fn history(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Vec<ReviewLogEntry>> {
        let state = self.lock()?;
        Ok(state
            .log
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.card_id == card_id)
            .cloned()
            .collect())
    }
}

impl Db for MemoryStore {
    fn init(&self) -> DbResult<()> {
        Ok(())
    }

    fn create_set(&self, owner_id: &str, title: &str, is_public: bool) -> DbResult<FlashcardSet> {
        let set = FlashcardSet {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            is_public,
            created_at: now_micros(),
        };
        self.lock()?.sets.push(set.clone());
        Ok(set)
    }

    fn add_card(&self, set_id: Uuid, question: &str, answer: &str) -> DbResult<Card> {
        let mut state = self.lock()?;
        if state.set(set_id).is_none() {
            return Err(DbError::UnknownSet(set_id));
        }
        let card = Card {
            id: Uuid::new_v4(),
            set_id,
            question: question.to_string(),
            answer: answer.to_string(),
            created_at: now_micros(),
        };
        state.cards.push(card.clone());
        Ok(card)
    }

    fn list_sets(&self, user_id: &str) -> DbResult<Vec<FlashcardSet>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .iter()
            .filter(|set| set.visible_to(user_id))
            .cloned()
            .collect())
    }

    fn delete_card(&self, card_id: Uuid) -> DbResult<()> {
        let mut state = self.lock()?;
        state.cards.retain(|card| card.id != card_id);
        state.progress.retain(|(_, card), _| *card != card_id);
        state.log.retain(|entry| entry.card_id != card_id);
        Ok(())
    }

    fn delete_user_progress(&self, user_id: &str) -> DbResult<usize> {
        let mut state = self.lock()?;
        let before = state.progress.len();
        state.progress.retain(|(user, _), _| user != user_id);
        state.log.retain(|entry| entry.user_id != user_id);
        Ok(before - state.progress.len())
    }
}
