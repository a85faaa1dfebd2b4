use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Item lifecycle.
///
/// ```text
/// Queued -> Dispatching -> Committed
///                       -> ConflictCheck -> Queued | DeadLetter
///                       -> Failed -> Retry -> Queued
///                                 -> DeadLetter
///                       -> DeadLetter            (permanent rejection)
/// ```
///
/// `Committed` and `DeadLetter` are terminal. Restart recovery and manual
/// dead-letter requeue re-enter `Queued` outside of these edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Dispatching,
    ConflictCheck,
    Failed,
    Retry,
    Committed,
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: ItemState, to: ItemState },
}

impl ItemState {
    pub const ALL: [ItemState; 7] = [
        ItemState::Queued,
        ItemState::Dispatching,
        ItemState::ConflictCheck,
        ItemState::Failed,
        ItemState::Retry,
        ItemState::Committed,
        ItemState::DeadLetter,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatching => "dispatching",
            Self::ConflictCheck => "conflict_check",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::Committed => "committed",
            Self::DeadLetter => "dead_letter",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::DeadLetter)
    }

    /// States in which a network attempt owns the item.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatching | Self::ConflictCheck)
    }

    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Queued, Dispatching)
                | (Dispatching, Committed)
                | (Dispatching, ConflictCheck)
                | (Dispatching, Failed)
                | (Dispatching, DeadLetter)
                | (ConflictCheck, Queued)
                | (ConflictCheck, DeadLetter)
                | (Failed, Retry)
                | (Failed, DeadLetter)
                | (Retry, Queued)
        )
    }

    /// State to resume from after a process restart. Anything that was
    /// mid-attempt goes back to `Queued`; the remote may or may not have seen it.
    pub const fn recovered(self) -> Self {
        match self {
            Self::Dispatching | Self::ConflictCheck | Self::Failed | Self::Retry => Self::Queued,
            other => other,
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
