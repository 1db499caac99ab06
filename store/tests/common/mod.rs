#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use recall_core::{Card, FlashcardSet};
use recall_store::{Db, MemoryStore, SqliteDb};
use tempfile::TempDir;

pub const OWNER: &str = "owner-1";
pub const OTHER: &str = "someone-else";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap()
}

/// A backend under test, keeping its temp directory alive.
pub struct Backend {
    pub name: &'static str,
    pub db: Box<dyn Db>,
    _dir: Option<TempDir>,
}

pub fn backends() -> Vec<Backend> {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteDb::open(&dir.path().join("recall.db")).unwrap();
    sqlite.init().unwrap();

    vec![
        Backend {
            name: "memory",
            db: Box::new(MemoryStore::new()),
            _dir: None,
        },
        Backend {
            name: "sqlite",
            db: Box::new(sqlite),
            _dir: Some(dir),
        },
    ]
}

pub struct Fixture {
    pub set: FlashcardSet,
    pub cards: Vec<Card>,
}

pub fn seed(db: &dyn Db, owner: &str, is_public: bool, count: usize) -> Fixture {
    let set = db.create_set(owner, "Dutch basics", is_public).unwrap();
    let cards = (0..count)
        .map(|i| {
            db.add_card(set.id, &format!("question {i}"), &format!("answer {i}"))
                .unwrap()
        })
        .collect();
    Fixture { set, cards }
}
