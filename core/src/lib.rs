//! Spaced-repetition scheduling for flashcards.
//!
//! [`compute_next_progress`] is the SM-2 step: a pure function from the prior
//! [`Progress`] of a (user, card) pair and a [`Quality`] score to the next
//! [`ReviewProgress`]. [`Scheduler`] wraps a store implementing [`Catalog`] and
//! [`ProgressStore`] to select due cards and apply reviews with a bounded
//! compare-and-swap retry.
//!
//! ```
//! use chrono::Utc;
//! use recall_core::{Progress, Quality, compute_next_progress};
//! use uuid::Uuid;
//!
//! let now = Utc::now();
//! let next = compute_next_progress("user", Uuid::new_v4(), &Progress::New, Quality::new(5)?, now)?;
//! assert_eq!(next.interval_days, 1);
//! # Ok::<(), recall_core::Error>(())
//! ```

mod error;
mod progress;
mod schedule;
mod scheduler;
mod session;
mod store;

pub use error::{Error, Result};
pub use progress::{INITIAL_EASE, MIN_EASE, Progress, ReviewProgress};
pub use schedule::{Grade, Quality, SUCCESS_THRESHOLD, compute_next_progress, next_ease};
pub use scheduler::{CONFLICT_RETRIES, Scheduler};
pub use session::{SessionConfig, plan_session};
pub use store::{
    Card, Catalog, DueCard, FlashcardSet, ProgressStore, ReviewLogEntry, UpsertOutcome,
};
