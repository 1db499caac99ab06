use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::progress::{Progress, ReviewProgress};
use crate::schedule::{Quality, compute_next_progress};
use crate::store::{Catalog, DueCard, ProgressStore, UpsertOutcome};

/// Re-attempts after the first write conflict. Exactly one.
pub const CONFLICT_RETRIES: usize = 1;

/// Due-card selection and review submission over a store.
///
/// Holds no state of its own; every call takes `now` from the caller.
#[derive(Debug, Clone)]
pub struct Scheduler<S> {
    store: S,
}

impl<S> Scheduler<S>
where
    S: Catalog + ProgressStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Every card in `set_id` (or every visible set) that is new or due at `now`.
    ///
    /// An empty result means the session is already complete.
    pub fn select_due(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueCard>> {
        if let Some(set_id) = set_id {
            if !self.store.set_visible_to(user_id, set_id)? {
                return Err(Error::SetNotFound {
                    user_id: user_id.to_string(),
                    set_id,
                });
            }
        }

        let rows = self.store.query_due(user_id, set_id, now)?;
        for row in &rows {
            if let Progress::Existing(progress) = &row.progress {
                progress.validate()?;
                if !row.progress.is_due(now) {
                    return Err(Error::invalid(format!(
                        "store returned card {} due at {:?}, after {now}",
                        row.card.id, progress.next_review_date
                    )));
                }
            }
        }
        debug!(user_id, set_id = ?set_id, due = rows.len(), "selected due cards");
        Ok(rows)
    }

    /// Apply one review and persist it.
    ///
    /// On a write conflict the read-compute-write cycle runs once more from
    /// fresh state; a second conflict is returned as [`Error::WriteConflict`].
    /// Nothing is written unless the upsert reports [`UpsertOutcome::Applied`].
    pub fn submit_review(
        &self,
        user_id: &str,
        card_id: Uuid,
        quality: i64,
        now: DateTime<Utc>,
    ) -> Result<ReviewProgress> {
        let quality = Quality::new(quality)?;
        // Stores keep microseconds; the returned record must equal the stored row.
        let now = now.trunc_subsecs(6);

        if self.store.card_visible_to(user_id, card_id)?.is_none() {
            return Err(Error::NotFound {
                user_id: user_id.to_string(),
                card_id,
            });
        }

        for attempt in 0..=CONFLICT_RETRIES {
            let prior = self.store.get(user_id, card_id)?;
            let next = compute_next_progress(user_id, card_id, &prior, quality, now)?;

            match self.store.upsert(user_id, card_id, &next)? {
                UpsertOutcome::Applied => {
                    info!(
                        user_id,
                        %card_id,
                        quality = quality.value(),
                        interval_days = next.interval_days,
                        ease_factor = next.ease_factor,
                        revision = next.revision,
                        "review applied"
                    );
                    return Ok(next);
                }
                UpsertOutcome::Conflict => {
                    warn!(user_id, %card_id, attempt, revision = next.revision, "write conflict");
                }
            }
        }

        Err(Error::WriteConflict {
            user_id: user_id.to_string(),
            card_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Card, ReviewLogEntry};
    use chrono::{Duration, TimeZone};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// Single-threaded fake that can be told to lose a number of CAS races.
    #[derive(Default)]
    struct FakeStore {
        cards: Vec<Card>,
        rows: RefCell<HashMap<(String, Uuid), ReviewProgress>>,
        forced_conflicts: Cell<usize>,
        upserts: Cell<usize>,
    }

    impl FakeStore {
        fn with_card(card: Card) -> Self {
            Self {
                cards: vec![card],
                ..Default::default()
            }
        }
    }

    impl Catalog for FakeStore {
        fn set_visible_to(&self, _user_id: &str, set_id: Uuid) -> Result<bool> {
            Ok(self.cards.iter().any(|card| card.set_id == set_id))
        }

        fn card_visible_to(&self, _user_id: &str, card_id: Uuid) -> Result<Option<Card>> {
            Ok(self.cards.iter().find(|card| card.id == card_id).cloned())
        }
    }

    impl ProgressStore for FakeStore {
        fn get(&self, user_id: &str, card_id: Uuid) -> Result<Progress> {
            let rows = self.rows.borrow();
            Ok(Progress::from_row(rows.get(&(user_id.to_string(), card_id)).cloned()))
        }

        fn upsert(
            &self,
            user_id: &str,
            card_id: Uuid,
            progress: &ReviewProgress,
        ) -> Result<UpsertOutcome> {
            self.upserts.set(self.upserts.get() + 1);
            if self.forced_conflicts.get() > 0 {
                self.forced_conflicts.set(self.forced_conflicts.get() - 1);
                return Ok(UpsertOutcome::Conflict);
            }
            let mut rows = self.rows.borrow_mut();
            let key = (user_id.to_string(), card_id);
            let stored = rows.get(&key).map_or(0, |row| row.revision);
            if stored + 1 != progress.revision {
                return Ok(UpsertOutcome::Conflict);
            }
            rows.insert(key, progress.clone());
            Ok(UpsertOutcome::Applied)
        }

        fn query_due(
            &self,
            user_id: &str,
            set_id: Option<Uuid>,
            now: DateTime<Utc>,
        ) -> Result<Vec<DueCard>> {
            let mut due = Vec::new();
            for card in &self.cards {
                if set_id.is_some_and(|set_id| set_id != card.set_id) {
                    continue;
                }
                let progress = self.get(user_id, card.id)?;
                if progress.is_due(now) {
                    due.push(DueCard {
                        card: card.clone(),
                        progress,
                    });
                }
            }
            Ok(due)
        }

        fn history(&self, _user_id: &str, _card_id: Uuid) -> Result<Vec<ReviewLogEntry>> {
            Ok(Vec::new())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn card() -> Card {
        Card {
            id: Uuid::new_v4(),
            set_id: Uuid::new_v4(),
            question: "hond".to_string(),
            answer: "dog".to_string(),
            created_at: t0(),
        }
    }

    #[test]
    fn submit_review_persists_new_card() {
        let card = card();
        let scheduler = Scheduler::new(FakeStore::with_card(card.clone()));
        let progress = scheduler.submit_review("u1", card.id, 5, t0()).unwrap();
        assert_eq!(progress.interval_days, 1);
        assert_eq!(
            scheduler.store().get("u1", card.id).unwrap(),
            Progress::Existing(progress)
        );
    }

    #[test]
    fn submit_review_rejects_bad_quality_without_writing() {
        let card = card();
        let scheduler = Scheduler::new(FakeStore::with_card(card.clone()));
        let err = scheduler.submit_review("u1", card.id, 7, t0()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(scheduler.store().upserts.get(), 0);
    }

    #[test]
    fn submit_review_unknown_card_is_not_found() {
        let scheduler = Scheduler::new(FakeStore::with_card(card()));
        let err = scheduler
            .submit_review("u1", Uuid::new_v4(), 4, t0())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn single_conflict_is_retried() {
        let card = card();
        let store = FakeStore::with_card(card.clone());
        store.forced_conflicts.set(1);
        let scheduler = Scheduler::new(store);
        let progress = scheduler.submit_review("u1", card.id, 4, t0()).unwrap();
        assert_eq!(progress.revision, 1);
        assert_eq!(scheduler.store().upserts.get(), 2);
    }

    #[test]
    fn second_conflict_surfaces_and_keeps_schedule() {
        let card = card();
        let store = FakeStore::with_card(card.clone());
        let scheduler = Scheduler::new(store);
        let first = scheduler.submit_review("u1", card.id, 4, t0()).unwrap();

        scheduler.store().forced_conflicts.set(2);
        let later = t0() + Duration::days(1);
        let err = scheduler.submit_review("u1", card.id, 5, later).unwrap_err();
        assert!(matches!(err, Error::WriteConflict { .. }));
        assert!(err.is_transient());
        assert_eq!(scheduler.store().upserts.get(), 3);

        let stored = scheduler.store().get("u1", card.id).unwrap();
        assert_eq!(stored.next_review_date(), first.next_review_date);
    }

    #[test]
    fn select_due_includes_new_and_excludes_future() {
        let card = card();
        let scheduler = Scheduler::new(FakeStore::with_card(card.clone()));

        let due = scheduler.select_due("u1", Some(card.set_id), t0()).unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].progress.is_new());

        scheduler.submit_review("u1", card.id, 5, t0()).unwrap();
        let due = scheduler.select_due("u1", Some(card.set_id), t0()).unwrap();
        assert!(due.is_empty());

        let tomorrow = t0() + Duration::days(1);
        let first = scheduler.select_due("u1", None, tomorrow).unwrap();
        let second = scheduler.select_due("u1", None, tomorrow).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn select_due_unknown_set_is_not_found() {
        let scheduler = Scheduler::new(FakeStore::with_card(card()));
        let err = scheduler
            .select_due("u1", Some(Uuid::new_v4()), t0())
            .unwrap_err();
        assert!(matches!(err, Error::SetNotFound { .. }));
    }
}
