//! Error types for recall_core.
//!
//! Every failure the scheduler can report falls into one of five classes:
//!
//! 1. **InvalidInput**: a quality score outside `0..=5`, or a stored progress
//!    record that does not satisfy the progress invariants.
//! 2. **NotFound**: the card is not in any set visible to the user.
//! 3. **SetNotFound**: a set filter names a set the user cannot see.
//! 4. **WriteConflict**: the store rejected an upsert twice in a row because
//!    another writer got there first.
//! 5. **StoreUnavailable**: the persistence layer failed.

use thiserror::Error;
use uuid::Uuid;

/// Result type for recall_core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scheduler and the store traits.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller or stored data failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A card is not in any set the user can access.
    #[error("card {card_id} not found for user {user_id}")]
    NotFound {
        /// The requesting user.
        user_id: String,
        /// The card that could not be resolved.
        card_id: Uuid,
    },

    /// A set is unknown or not visible to the user.
    #[error("set {set_id} not found for user {user_id}")]
    SetNotFound {
        /// The requesting user.
        user_id: String,
        /// The set that could not be resolved.
        set_id: Uuid,
    },

    /// Concurrent writers kept winning the compare-and-swap.
    #[error("write conflict on card {card_id} for user {user_id}, retry later")]
    WriteConflict {
        /// The user whose progress was contended.
        user_id: String,
        /// The contended card.
        card_id: Uuid,
    },

    /// The persistence layer could not complete the operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Build an [`Error::InvalidInput`] from anything printable.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    /// Wrap a backend failure as [`Error::StoreUnavailable`].
    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::StoreUnavailable(Box::new(err))
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WriteConflict { .. } | Error::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_store_errors_are_transient() {
        let conflict = Error::WriteConflict {
            user_id: "u1".to_string(),
            card_id: Uuid::nil(),
        };
        assert!(conflict.is_transient());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
        assert!(Error::store(io).is_transient());
    }

    #[test]
    fn caller_errors_are_not_transient() {
        assert!(!Error::invalid("quality 9").is_transient());
        let missing = Error::NotFound {
            user_id: "u1".to_string(),
            card_id: Uuid::nil(),
        };
        assert!(!missing.is_transient());
        assert_eq!(
            missing.to_string(),
            "card 00000000-0000-0000-0000-000000000000 not found for user u1"
        );

        let missing_set = Error::SetNotFound {
            user_id: "u1".to_string(),
            set_id: Uuid::nil(),
        };
        assert!(!missing_set.is_transient());
        assert_eq!(
            missing_set.to_string(),
            "set 00000000-0000-0000-0000-000000000000 not found for user u1"
        );
    }
}
