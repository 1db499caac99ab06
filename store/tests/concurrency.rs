//! Concurrent review submission against real backends.

mod common;

use std::sync::Barrier;
use std::thread;

use chrono::Duration;
use common::{OWNER, backends, seed, t0};
use recall_core::{Error, ProgressStore, Scheduler};

#[test]
fn duplicate_submissions_compound_instead_of_overwriting() {
    for backend in backends() {
        let db = &*backend.db;
        let card = seed(db, OWNER, false, 1).cards[0].id;
        let scheduler = Scheduler::new(db);
        let barrier = Barrier::new(2);

        let (barrier, scheduler) = (&barrier, &scheduler);
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        scheduler.submit_review(OWNER, card, 5, t0())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Two writers: the loser retries once from fresh state and then wins.
        let mut revisions: Vec<u32> = results
            .into_iter()
            .map(|result| result.unwrap().revision)
            .collect();
        revisions.sort_unstable();
        assert_eq!(revisions, vec![1, 2], "{}", backend.name);

        let stored = db.get(OWNER, card).unwrap();
        let stored = stored.as_existing().unwrap();
        assert_eq!(stored.repetitions, 2, "{}", backend.name);
        assert_eq!(stored.interval_days, 6);
        assert_eq!(stored.review_count, 2);
        assert_eq!(stored.next_review_date, Some(t0() + Duration::days(6)));
        assert_eq!(db.history(OWNER, card).unwrap().len(), 2);
    }
}

#[test]
fn contended_pair_never_loses_or_duplicates_a_review() {
    const WRITERS: usize = 8;

    for backend in backends() {
        let db = &*backend.db;
        let card = seed(db, OWNER, false, 1).cards[0].id;
        let scheduler = Scheduler::new(db);
        let barrier = Barrier::new(WRITERS);

        let (barrier, scheduler) = (&barrier, &scheduler);
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..WRITERS)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        scheduler.submit_review(OWNER, card, 4, t0())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut applied = Vec::new();
        for result in results {
            match result {
                Ok(progress) => applied.push(progress.revision),
                Err(Error::WriteConflict { .. }) => {}
                Err(other) => panic!("{}: unexpected error {other}", backend.name),
            }
        }
        applied.sort_unstable();
        let expected: Vec<u32> = (1..=applied.len() as u32).collect();
        assert_eq!(applied, expected, "{}", backend.name);

        let stored = db.get(OWNER, card).unwrap();
        assert_eq!(stored.revision(), applied.len() as u32, "{}", backend.name);
        assert_eq!(db.history(OWNER, card).unwrap().len(), applied.len());
    }
}

#[test]
fn different_cards_proceed_independently() {
    const CARDS: usize = 6;

    for backend in backends() {
        let db = &*backend.db;
        let fixture = seed(db, OWNER, false, CARDS);
        let scheduler = Scheduler::new(db);

        thread::scope(|scope| {
            for card in &fixture.cards {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    for day in 0..3 {
                        scheduler
                            .submit_review(OWNER, card.id, 5, t0() + Duration::days(day * 10))
                            .unwrap();
                    }
                });
            }
        });

        for card in &fixture.cards {
            let stored = db.get(OWNER, card.id).unwrap();
            assert_eq!(stored.repetitions(), 3, "{}", backend.name);
            assert_eq!(stored.revision(), 3);
        }
    }
}
