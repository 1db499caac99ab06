use serde::{Deserialize, Serialize};

use crate::store::DueCard;

/// Limits applied when turning a due list into a study session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_cards: usize,
    pub max_new_cards: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_cards: 20,
            max_new_cards: 10,
        }
    }
}

/// Order due cards for presentation.
///
/// Reviewed cards come first, most overdue first, then new cards in the
/// order given. New cards are capped at `max_new_cards` and the whole
/// session at `max_cards`.
pub fn plan_session(due: Vec<DueCard>, config: &SessionConfig) -> Vec<DueCard> {
    let (new, mut reviews): (Vec<_>, Vec<_>) =
        due.into_iter().partition(|entry| entry.progress.is_new());

    reviews.sort_by_key(|entry| entry.progress.next_review_date());

    reviews
        .into_iter()
        .chain(new.into_iter().take(config.max_new_cards))
        .take(config.max_cards)
        .collect()
}
