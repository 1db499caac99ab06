use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use recall_core::{
    Card, Catalog, DueCard, FlashcardSet, Progress, ProgressStore, ReviewLogEntry,
    ReviewProgress, UpsertOutcome,
};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    Db, DbError, DbResult, decode_count, decode_quality, decode_ts, decode_uuid, encode_ts,
    now_micros,
};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS flashcard_sets (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT NOT NULL,
        is_public INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS flashcards (
        id TEXT PRIMARY KEY,
        set_id TEXT NOT NULL REFERENCES flashcard_sets(id) ON DELETE CASCADE,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS flashcards_set_idx ON flashcards(set_id);
    CREATE TABLE IF NOT EXISTS review_progress (
        user_id TEXT NOT NULL,
        card_id TEXT NOT NULL REFERENCES flashcards(id) ON DELETE CASCADE,
        ease_factor REAL NOT NULL,
        repetitions INTEGER NOT NULL,
        interval_days INTEGER NOT NULL,
        last_reviewed INTEGER,
        next_review_date INTEGER,
        last_quality INTEGER,
        lapses INTEGER NOT NULL,
        review_count INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        PRIMARY KEY (user_id, card_id)
    );
    CREATE INDEX IF NOT EXISTS review_progress_due_idx
        ON review_progress(user_id, next_review_date);
    CREATE TABLE IF NOT EXISTS review_log (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        card_id TEXT NOT NULL REFERENCES flashcards(id) ON DELETE CASCADE,
        quality INTEGER NOT NULL,
        reviewed_at INTEGER NOT NULL,
        interval_days INTEGER NOT NULL,
        ease_factor REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS review_log_pair_idx ON review_log(user_id, card_id);";

// Applies only when the stored revision is one behind, or when inserting revision 1.
const UPSERT_PROGRESS: &str = "INSERT INTO review_progress (
        user_id, card_id, ease_factor, repetitions, interval_days,
        last_reviewed, next_review_date, last_quality, lapses, review_count, revision
    )
    SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
    WHERE ?11 = 1
       OR EXISTS (SELECT 1 FROM review_progress WHERE user_id = ?1 AND card_id = ?2)
    ON CONFLICT(user_id, card_id) DO UPDATE SET
        ease_factor = excluded.ease_factor,
        repetitions = excluded.repetitions,
        interval_days = excluded.interval_days,
        last_reviewed = excluded.last_reviewed,
        next_review_date = excluded.next_review_date,
        last_quality = excluded.last_quality,
        lapses = excluded.lapses,
        review_count = excluded.review_count,
        revision = excluded.revision
    WHERE review_progress.revision = excluded.revision - 1";

const PROGRESS_COLUMNS: &str = "p.ease_factor, p.repetitions, p.interval_days, p.last_reviewed,
    p.next_review_date, p.last_quality, p.lapses, p.review_count, p.revision";

/// Single-connection SQLite backend.
///
/// The mutex only serializes access to the connection handle; per-pair
/// atomicity comes from the revision check in the upsert statement.
pub struct SqliteDb {
    conn: Mutex<Connection>,
}

/// Progress columns as stored, before validation.
struct RawProgress {
    ease_factor: f64,
    repetitions: i64,
    interval_days: i64,
    last_reviewed: Option<i64>,
    next_review_date: Option<i64>,
    last_quality: Option<i64>,
    lapses: i64,
    review_count: i64,
    revision: i64,
}

impl RawProgress {
    /// Reads nine progress columns starting at `offset`.
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            ease_factor: row.get(offset)?,
            repetitions: row.get(offset + 1)?,
            interval_days: row.get(offset + 2)?,
            last_reviewed: row.get(offset + 3)?,
            next_review_date: row.get(offset + 4)?,
            last_quality: row.get(offset + 5)?,
            lapses: row.get(offset + 6)?,
            review_count: row.get(offset + 7)?,
            revision: row.get(offset + 8)?,
        })
    }

    fn into_progress(self, user_id: &str, card_id: Uuid) -> DbResult<ReviewProgress> {
        Ok(ReviewProgress {
            user_id: user_id.to_string(),
            card_id,
            ease_factor: self.ease_factor,
            repetitions: decode_count("repetitions", self.repetitions)?,
            interval_days: decode_count("interval_days", self.interval_days)?,
            last_reviewed: self
                .last_reviewed
                .map(|value| decode_ts("last_reviewed", value))
                .transpose()?,
            next_review_date: self
                .next_review_date
                .map(|value| decode_ts("next_review_date", value))
                .transpose()?,
            last_quality: decode_quality(self.last_quality)?,
            lapses: decode_count("lapses", self.lapses)?,
            review_count: decode_count("review_count", self.review_count)?,
            revision: decode_count("revision", self.revision)?,
        })
    }
}

struct RawCard {
    id: String,
    set_id: String,
    question: String,
    answer: String,
    created_at: i64,
}

impl RawCard {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            set_id: row.get(1)?,
            question: row.get(2)?,
            answer: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_card(self) -> DbResult<Card> {
        Ok(Card {
            id: decode_uuid("flashcards.id", &self.id)?,
            set_id: decode_uuid("flashcards.set_id", &self.set_id)?,
            question: self.question,
            answer: self.answer,
            created_at: decode_ts("flashcards.created_at", self.created_at)?,
        })
    }
}

struct RawSet {
    id: String,
    owner_id: String,
    title: String,
    is_public: bool,
    created_at: i64,
}

impl RawSet {
    fn into_set(self) -> DbResult<FlashcardSet> {
        Ok(FlashcardSet {
            id: decode_uuid("flashcard_sets.id", &self.id)?,
            owner_id: self.owner_id,
            title: self.title,
            is_public: self.is_public,
            created_at: decode_ts("flashcard_sets.created_at", self.created_at)?,
        })
    }
}

impl SqliteDb {
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> DbResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned("sqlite connection"))
    }

    fn fetch_progress(&self, user_id: &str, card_id: Uuid) -> DbResult<Option<ReviewProgress>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM review_progress p WHERE p.user_id = ?1 AND p.card_id = ?2"
        );
        debug!(sql = %sql, user_id, %card_id, "sqlite query");
        let raw = conn
            .query_row(&sql, params![user_id, card_id.to_string()], |row| {
                RawProgress::from_row(row, 0)
            })
            .optional()?;
        raw.map(|raw| raw.into_progress(user_id, card_id)).transpose()
    }

    fn write_progress(
        &self,
        user_id: &str,
        card_id: Uuid,
        progress: &ReviewProgress,
    ) -> DbResult<UpsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let card = card_id.to_string();

        debug!(sql = UPSERT_PROGRESS, user_id, %card_id, revision = progress.revision, "sqlite upsert");
        let changed = tx.execute(
            UPSERT_PROGRESS,
            params![
                user_id,
                card,
                progress.ease_factor,
                progress.repetitions,
                progress.interval_days,
                progress.last_reviewed.map(encode_ts),
                progress.next_review_date.map(encode_ts),
                progress.last_quality,
                progress.lapses,
                progress.review_count,
                progress.revision,
            ],
        )?;
        if changed == 0 {
            return Ok(UpsertOutcome::Conflict);
        }

        if let Some(entry) = ReviewLogEntry::for_progress(progress) {
            tx.execute(
                "INSERT INTO review_log (id, user_id, card_id, quality, reviewed_at, interval_days, ease_factor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.user_id,
                    card,
                    entry.quality,
                    encode_ts(entry.reviewed_at),
                    entry.interval_days,
                    entry.ease_factor,
                ],
            )?;
        }
        tx.commit()?;
        Ok(UpsertOutcome::Applied)
    }

    fn due_rows(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<DueCard>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT c.id, c.set_id, c.question, c.answer, c.created_at, p.user_id, {PROGRESS_COLUMNS}
             FROM flashcards c
             JOIN flashcard_sets s ON s.id = c.set_id
             LEFT JOIN review_progress p ON p.card_id = c.id AND p.user_id = ?1
             WHERE (s.owner_id = ?1 OR s.is_public = 1)
               AND (?2 IS NULL OR c.set_id = ?2)
               AND (p.user_id IS NULL OR p.next_review_date <= ?3)
             ORDER BY c.created_at, c.id"
        );
        let now_us = encode_ts(now);
        debug!(sql = %sql, user_id, set_id = ?set_id, now = now_us, "sqlite query");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![user_id, set_id.map(|id| id.to_string()), now_us],
            |row| {
                let card = RawCard::from_row(row)?;
                let owner: Option<String> = row.get(5)?;
                let progress = match owner {
                    Some(_) => Some(RawProgress::from_row(row, 6)?),
                    None => None,
                };
                Ok((card, progress))
            },
        )?;

        let mut due = Vec::new();
        for row in rows {
            let (card, progress) = row?;
            let card = card.into_card()?;
            let progress = progress
                .map(|raw| raw.into_progress(user_id, card.id))
                .transpose()?;
            due.push(DueCard {
                card,
                progress: Progress::from_row(progress),
            });
        }
        Ok(due)
    }

    fn log_rows(&self, user_id: &str, card_id: Uuid) -> DbResult<Vec<ReviewLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, quality, reviewed_at, interval_days, ease_factor
             FROM review_log
             WHERE user_id = ?1 AND card_id = ?2
             ORDER BY reviewed_at, rowid",
        )?;
        let rows = stmt.query_map(params![user_id, card_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, quality, reviewed_at, interval_days, ease_factor) = row?;
            entries.push(ReviewLogEntry {
                id: decode_uuid("review_log.id", &id)?,
                user_id: user_id.to_string(),
                card_id,
                quality: decode_quality(Some(quality))?.unwrap_or_default(),
                reviewed_at: decode_ts("review_log.reviewed_at", reviewed_at)?,
                interval_days: decode_count("review_log.interval_days", interval_days)?,
                ease_factor,
            });
        }
        Ok(entries)
    }

    fn visible_card(&self, user_id: &str, card_id: Uuid) -> DbResult<Option<Card>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT c.id, c.set_id, c.question, c.answer, c.created_at
                 FROM flashcards c
                 JOIN flashcard_sets s ON s.id = c.set_id
                 WHERE c.id = ?1 AND (s.owner_id = ?2 OR s.is_public = 1)",
                params![card_id.to_string(), user_id],
                RawCard::from_row,
            )
            .optional()?;
        raw.map(RawCard::into_card).transpose()
    }

    fn visible_set(&self, user_id: &str, set_id: Uuid) -> DbResult<bool> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT 1 FROM flashcard_sets WHERE id = ?1 AND (owner_id = ?2 OR is_public = 1) LIMIT 1",
        )?;
        let mut rows = stmt.query(params![set_id.to_string(), user_id])?;
        Ok(rows.next()?.is_some())
    }
}

impl Catalog for SqliteDb {
    fn set_visible_to(&self, user_id: &str, set_id: Uuid) -> recall_core::Result<bool> {
        Ok(self.visible_set(user_id, set_id)?)
    }

    fn card_visible_to(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Option<Card>> {
        Ok(self.visible_card(user_id, card_id)?)
    }
}

impl ProgressStore for SqliteDb {
    fn get(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Progress> {
        Ok(Progress::from_row(self.fetch_progress(user_id, card_id)?))
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
        self.write_progress(user_id, card_id, progress).map_err(|err| {
            error!(error = %err, user_id, %card_id, "sqlite progress upsert failed");
            err.into()
        })
    }

    fn query_due(
        &self,
        user_id: &str,
        set_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> recall_core::Result<Vec<DueCard>> {
        Ok(self.due_rows(user_id, set_id, now)?)
    }

    fn history(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Vec<ReviewLogEntry>> {
        Ok(self.log_rows(user_id, card_id)?)
    }
}

impl Db for SqliteDb {
    fn init(&self) -> DbResult<()> {
        self.lock()?.execute_batch(SCHEMA)?;
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
        self.lock()?.execute(
            "INSERT INTO flashcard_sets (id, owner_id, title, is_public, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                set.id.to_string(),
                set.owner_id,
                set.title,
                set.is_public,
                encode_ts(set.created_at)
            ],
        )?;
        Ok(set)
    }

    fn add_card(&self, set_id: Uuid, question: &str, answer: &str) -> DbResult<Card> {
        let conn = self.lock()?;
        let exists = conn
            .query_row(
                "SELECT 1 FROM flashcard_sets WHERE id = ?1",
                params![set_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(DbError::UnknownSet(set_id));
        }

        let card = Card {
            id: Uuid::new_v4(),
            set_id,
            question: question.to_string(),
            answer: answer.to_string(),
            created_at: now_micros(),
        };
        conn.execute(
            "INSERT INTO flashcards (id, set_id, question, answer, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                card.id.to_string(),
                card.set_id.to_string(),
                card.question,
                card.answer,
                encode_ts(card.created_at)
            ],
        )?;
        Ok(card)
    }

    fn list_sets(&self, user_id: &str) -> DbResult<Vec<FlashcardSet>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, title, is_public, created_at
             FROM flashcard_sets
             WHERE owner_id = ?1 OR is_public = 1
             ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(RawSet {
                id: row.get(0)?,
                owner_id: row.get(1)?,
                title: row.get(2)?,
                is_public: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut sets = Vec::new();
        for row in rows {
            sets.push(row?.into_set()?);
        }
        Ok(sets)
    }

    fn delete_card(&self, card_id: Uuid) -> DbResult<()> {
        self.lock()?
            .execute("DELETE FROM flashcards WHERE id = ?1", params![card_id.to_string()])?;
        Ok(())
    }

    fn delete_user_progress(&self, user_id: &str) -> DbResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM review_log WHERE user_id = ?1", params![user_id])?;
        let removed = tx.execute("DELETE FROM review_progress WHERE user_id = ?1", params![user_id])?;
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use recall_core::{Error, Scheduler};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn seeded() -> (SqliteDb, Card) {
        let db = SqliteDb::open_in_memory().unwrap();
        db.init().unwrap();
        let set = db.create_set("u1", "verbs", false).unwrap();
        let card = db.add_card(set.id, "lopen", "to walk").unwrap();
        (db, card)
    }

    fn insert_raw(db: &SqliteDb, card: &Card, ease: f64, next_review: i64) {
        db.lock()
            .unwrap()
            .execute(
                "INSERT INTO review_progress (user_id, card_id, ease_factor, repetitions, interval_days,
                    last_reviewed, next_review_date, last_quality, lapses, review_count, revision)
                 VALUES ('u1', ?1, ?2, 1, 1, ?3, ?4, 4, 0, 1, 1)",
                params![
                    card.id.to_string(),
                    ease,
                    encode_ts(now() - chrono::Duration::days(1)),
                    next_review
                ],
            )
            .unwrap();
    }

    #[test]
    fn init_is_idempotent() {
        let (db, card) = seeded();
        db.init().unwrap();
        assert_eq!(db.visible_card("u1", card.id).unwrap(), Some(card));
    }

    #[test]
    fn timestamps_round_trip_as_integers() {
        let (db, card) = seeded();
        insert_raw(&db, &card, 2.5, encode_ts(now()));
        let progress = db.get("u1", card.id).unwrap();
        assert_eq!(progress.next_review_date(), Some(now()));
    }

    #[test]
    fn out_of_range_timestamp_is_invalid_input() {
        let (db, card) = seeded();
        insert_raw(&db, &card, 2.5, i64::MAX);
        let err = db.get("u1", card.id).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err:?}");
    }

    #[test]
    fn ease_below_floor_is_rejected_before_scheduling() {
        let (db, card) = seeded();
        insert_raw(&db, &card, 0.4, encode_ts(now()));

        let scheduler = Scheduler::new(&db);
        let err = scheduler.submit_review("u1", card.id, 5, now()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err:?}");
        let err = scheduler.select_due("u1", None, now()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err:?}");

        // The stored row is left as it was.
        assert_eq!(db.get("u1", card.id).unwrap().revision(), 1);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let (db, _) = seeded();
        let result = db.lock().unwrap().execute(
            "INSERT INTO flashcards (id, set_id, question, answer, created_at)
             VALUES (?1, ?2, 'q', 'a', ?3)",
            params![
                Uuid::new_v4().to_string(),
                Uuid::new_v4().to_string(),
                encode_ts(now())
            ],
        );
        assert!(result.is_err());
    }
}
