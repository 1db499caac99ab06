use chrono::{DateTime, Utc};
use postgres::Row;
use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use recall_core::{
    Card, Catalog, DueCard, FlashcardSet, Progress, ProgressStore, ReviewLogEntry,
    ReviewProgress, UpsertOutcome,
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{Db, DbError, DbResult, decode_count, decode_quality, decode_uuid, now_micros};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS flashcard_sets (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        title TEXT NOT NULL,
        is_public BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS flashcards (
        id TEXT PRIMARY KEY,
        set_id TEXT NOT NULL REFERENCES flashcard_sets(id) ON DELETE CASCADE,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    );
    CREATE INDEX IF NOT EXISTS flashcards_set_idx ON flashcards(set_id);
    CREATE TABLE IF NOT EXISTS review_progress (
        user_id TEXT NOT NULL,
        card_id TEXT NOT NULL REFERENCES flashcards(id) ON DELETE CASCADE,
        ease_factor DOUBLE PRECISION NOT NULL,
        repetitions INTEGER NOT NULL,
        interval_days INTEGER NOT NULL,
        last_reviewed TIMESTAMPTZ,
        next_review_date TIMESTAMPTZ,
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
        reviewed_at TIMESTAMPTZ NOT NULL,
        interval_days INTEGER NOT NULL,
        ease_factor DOUBLE PRECISION NOT NULL
    );
    CREATE INDEX IF NOT EXISTS review_log_pair_idx ON review_log(user_id, card_id);";

const UPSERT_PROGRESS: &str = "INSERT INTO review_progress (
        user_id, card_id, ease_factor, repetitions, interval_days,
        last_reviewed, next_review_date, last_quality, lapses, review_count, revision
    )
    SELECT $1::TEXT, $2::TEXT, $3::DOUBLE PRECISION, $4::INTEGER, $5::INTEGER,
           $6::TIMESTAMPTZ, $7::TIMESTAMPTZ, $8::INTEGER, $9::INTEGER, $10::INTEGER, $11::INTEGER
    WHERE $11::INTEGER = 1
       OR EXISTS (SELECT 1 FROM review_progress WHERE user_id = $1::TEXT AND card_id = $2::TEXT)
    ON CONFLICT (user_id, card_id) DO UPDATE SET
        ease_factor = EXCLUDED.ease_factor,
        repetitions = EXCLUDED.repetitions,
        interval_days = EXCLUDED.interval_days,
        last_reviewed = EXCLUDED.last_reviewed,
        next_review_date = EXCLUDED.next_review_date,
        last_quality = EXCLUDED.last_quality,
        lapses = EXCLUDED.lapses,
        review_count = EXCLUDED.review_count,
        revision = EXCLUDED.revision
    WHERE review_progress.revision = EXCLUDED.revision - 1";

const PROGRESS_COLUMNS: &str = "p.ease_factor, p.repetitions, p.interval_days, p.last_reviewed,
    p.next_review_date, p.last_quality, p.lapses, p.review_count, p.revision";

/// Connections kept open per process. Reviews of different pairs run in
/// parallel up to this limit.
const POOL_SIZE: u32 = 8;

type Manager = PostgresConnectionManager<MakeTlsConnector>;

pub struct PostgresDb {
    pool: Pool<Manager>,
}

fn to_sql_int(column: &str, value: u32) -> DbResult<i32> {
    i32::try_from(value).map_err(|_| DbError::Config(format!("{column} too large: {value}")))
}

fn progress_from_row(
    row: &Row,
    offset: usize,
    user_id: &str,
    card_id: Uuid,
) -> DbResult<ReviewProgress> {
    let int = |index: usize, column: &str| -> DbResult<u32> {
        let value: i32 = row.try_get(offset + index)?;
        decode_count(column, i64::from(value))
    };
    let last_quality: Option<i32> = row.try_get(offset + 5)?;
    Ok(ReviewProgress {
        user_id: user_id.to_string(),
        card_id,
        ease_factor: row.try_get(offset)?,
        repetitions: int(1, "repetitions")?,
        interval_days: int(2, "interval_days")?,
        last_reviewed: row.try_get(offset + 3)?,
        next_review_date: row.try_get(offset + 4)?,
        last_quality: decode_quality(last_quality.map(i64::from))?,
        lapses: int(6, "lapses")?,
        review_count: int(7, "review_count")?,
        revision: int(8, "revision")?,
    })
}

fn card_from_row(row: &Row) -> DbResult<Card> {
    Ok(Card {
        id: decode_uuid("flashcards.id", row.try_get(0)?)?,
        set_id: decode_uuid("flashcards.set_id", row.try_get(1)?)?,
        question: row.try_get(2)?,
        answer: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

impl PostgresDb {
    pub fn connect(url: &str, tls: MakeTlsConnector) -> DbResult<Self> {
        let manager = PostgresConnectionManager::new(url.parse::<postgres::Config>()?, tls);
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;
        Ok(Self { pool })
    }

    fn conn(&self) -> DbResult<PooledConnection<Manager>> {
        Ok(self.pool.get()?)
    }

    fn fetch_progress(&self, user_id: &str, card_id: Uuid) -> DbResult<Option<ReviewProgress>> {
        let mut client = self.conn()?;
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM review_progress p WHERE p.user_id = $1 AND p.card_id = $2"
        );
        debug!(sql = %sql, user_id, %card_id, "postgres query");
        let row = client.query_opt(&sql, &[&user_id, &card_id.to_string()])?;
        row.map(|row| progress_from_row(&row, 0, user_id, card_id))
            .transpose()
    }

    fn write_progress(&self, progress: &ReviewProgress) -> DbResult<UpsertOutcome> {
        let repetitions = to_sql_int("repetitions", progress.repetitions)?;
        let interval_days = to_sql_int("interval_days", progress.interval_days)?;
        let lapses = to_sql_int("lapses", progress.lapses)?;
        let review_count = to_sql_int("review_count", progress.review_count)?;
        let revision = to_sql_int("revision", progress.revision)?;
        let last_quality = progress.last_quality.map(i32::from);
        let card_id = progress.card_id.to_string();

        let mut client = self.conn()?;
        let mut tx = client.transaction()?;
        debug!(sql = UPSERT_PROGRESS, user_id = %progress.user_id, card_id = %card_id, revision, "postgres upsert");
        let changed = tx.execute(
            UPSERT_PROGRESS,
            &[
                &progress.user_id,
                &card_id,
                &progress.ease_factor,
                &repetitions,
                &interval_days,
                &progress.last_reviewed,
                &progress.next_review_date,
                &last_quality,
                &lapses,
                &review_count,
                &revision,
            ],
        )?;
        if changed == 0 {
            tx.rollback()?;
            return Ok(UpsertOutcome::Conflict);
        }

        if let Some(entry) = ReviewLogEntry::for_progress(progress) {
            tx.execute(
                "INSERT INTO review_log (id, user_id, card_id, quality, reviewed_at, interval_days, ease_factor)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &entry.id.to_string(),
                    &entry.user_id,
                    &card_id,
                    &i32::from(entry.quality),
                    &entry.reviewed_at,
                    &interval_days,
                    &entry.ease_factor,
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
        let mut client = self.conn()?;
        let sql = format!(
            "SELECT c.id, c.set_id, c.question, c.answer, c.created_at, p.user_id, {PROGRESS_COLUMNS}
             FROM flashcards c
             JOIN flashcard_sets s ON s.id = c.set_id
             LEFT JOIN review_progress p ON p.card_id = c.id AND p.user_id = $1
             WHERE (s.owner_id = $1 OR s.is_public)
               AND ($2::TEXT IS NULL OR c.set_id = $2::TEXT)
               AND (p.user_id IS NULL OR p.next_review_date <= $3)
             ORDER BY c.created_at, c.id"
        );
        let set_param = set_id.map(|id| id.to_string());
        debug!(sql = %sql, user_id, set_id = ?set_id, %now, "postgres query");

        let mut due = Vec::new();
        for row in client.query(&sql, &[&user_id, &set_param, &now])? {
            let card = card_from_row(&row)?;
            let owner: Option<String> = row.try_get(5)?;
            let progress = match owner {
                Some(_) => Some(progress_from_row(&row, 6, user_id, card.id)?),
                None => None,
            };
            due.push(DueCard {
                card,
                progress: Progress::from_row(progress),
            });
        }
        Ok(due)
    }

    fn log_rows(&self, user_id: &str, card_id: Uuid) -> DbResult<Vec<ReviewLogEntry>> {
        let mut client = self.conn()?;
        let mut entries = Vec::new();
        for row in client.query(
            "SELECT id, quality, reviewed_at, interval_days, ease_factor
             FROM review_log
             WHERE user_id = $1 AND card_id = $2
             ORDER BY reviewed_at, id",
            &[&user_id, &card_id.to_string()],
        )? {
            let quality: i32 = row.try_get(1)?;
            let interval_days: i32 = row.try_get(3)?;
            entries.push(ReviewLogEntry {
                id: decode_uuid("review_log.id", row.try_get(0)?)?,
                user_id: user_id.to_string(),
                card_id,
                quality: decode_quality(Some(i64::from(quality)))?.unwrap_or_default(),
                reviewed_at: row.try_get(2)?,
                interval_days: decode_count("review_log.interval_days", i64::from(interval_days))?,
                ease_factor: row.try_get(4)?,
            });
        }
        Ok(entries)
    }

    fn visible_card(&self, user_id: &str, card_id: Uuid) -> DbResult<Option<Card>> {
        let mut client = self.conn()?;
        let row = client.query_opt(
            "SELECT c.id, c.set_id, c.question, c.answer, c.created_at
             FROM flashcards c
             JOIN flashcard_sets s ON s.id = c.set_id
             WHERE c.id = $1 AND (s.owner_id = $2 OR s.is_public)",
            &[&card_id.to_string(), &user_id],
        )?;
        row.as_ref().map(card_from_row).transpose()
    }
}

impl Catalog for PostgresDb {
    fn set_visible_to(&self, user_id: &str, set_id: Uuid) -> recall_core::Result<bool> {
        let mut client = self.conn()?;
        let rows = client
            .query(
                "SELECT 1 FROM flashcard_sets WHERE id = $1 AND (owner_id = $2 OR is_public) LIMIT 1",
                &[&set_id.to_string(), &user_id],
            )
            .map_err(DbError::from)?;
        Ok(!rows.is_empty())
    }

    fn card_visible_to(&self, user_id: &str, card_id: Uuid) -> recall_core::Result<Option<Card>> {
        Ok(self.visible_card(user_id, card_id)?)
    }
}

impl ProgressStore for PostgresDb {
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
        self.write_progress(progress).map_err(|err| {
            error!(error = %err, user_id, %card_id, "postgres progress upsert failed");
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

impl Db for PostgresDb {
    fn init(&self) -> DbResult<()> {
        self.conn()?.batch_execute(SCHEMA)?;
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
        self.conn()?.execute(
            "INSERT INTO flashcard_sets (id, owner_id, title, is_public, created_at)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &set.id.to_string(),
                &set.owner_id,
                &set.title,
                &set.is_public,
                &set.created_at,
            ],
        )?;
        Ok(set)
    }

    fn add_card(&self, set_id: Uuid, question: &str, answer: &str) -> DbResult<Card> {
        let mut client = self.conn()?;
        let exists = client
            .query_opt("SELECT 1 FROM flashcard_sets WHERE id = $1", &[&set_id.to_string()])?
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
        client.execute(
            "INSERT INTO flashcards (id, set_id, question, answer, created_at) VALUES ($1, $2, $3, $4, $5)",
            &[
                &card.id.to_string(),
                &card.set_id.to_string(),
                &card.question,
                &card.answer,
                &card.created_at,
            ],
        )?;
        Ok(card)
    }

    fn list_sets(&self, user_id: &str) -> DbResult<Vec<FlashcardSet>> {
        let mut client = self.conn()?;
        let mut sets = Vec::new();
        for row in client.query(
            "SELECT id, owner_id, title, is_public, created_at
             FROM flashcard_sets
             WHERE owner_id = $1 OR is_public
             ORDER BY created_at, id",
            &[&user_id],
        )? {
            sets.push(FlashcardSet {
                id: decode_uuid("flashcard_sets.id", row.try_get(0)?)?,
                owner_id: row.try_get(1)?,
                title: row.try_get(2)?,
                is_public: row.try_get(3)?,
                created_at: row.try_get(4)?,
            });
        }
        Ok(sets)
    }

    fn delete_card(&self, card_id: Uuid) -> DbResult<()> {
        self.conn()?
            .execute("DELETE FROM flashcards WHERE id = $1", &[&card_id.to_string()])?;
        Ok(())
    }

    fn delete_user_progress(&self, user_id: &str) -> DbResult<usize> {
        let mut client = self.conn()?;
        let mut tx = client.transaction()?;
        tx.execute("DELETE FROM review_log WHERE user_id = $1", &[&user_id])?;
        let removed = tx.execute("DELETE FROM review_progress WHERE user_id = $1", &[&user_id])?;
        tx.commit()?;
        Ok(removed as usize)
    }
}
