use serde::{Deserialize, Serialize};

use crate::id::ParticipantId;

/// Points state of a participant within the current round.
///
/// `Unsubmitted` is a distinguished sentinel, distinct from the "0"
/// card. `Disconnected` marks a participant whose link dropped; the
/// roster entry is kept but the participant is excluded from the
/// round-complete predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "points", rename_all = "kebab-case")]
pub enum Estimate {
    Unsubmitted,
    Submitted(u32),
    Disconnected,
}

impl Estimate {
    /// Whether this participant has submitted for the current round.
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted(_))
    }

    /// Submitted points, if any.
    #[must_use]
    pub const fn points(&self) -> Option<u32> {
        match self {
            Self::Submitted(points) => Some(*points),
            Self::Unsubmitted | Self::Disconnected => None,
        }
    }
}

/// A roster entry. Created when the host first accepts a `join`;
/// never deleted for the lifetime of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub estimate: Estimate,
}

impl Participant {
    /// A freshly admitted participant that has not estimated yet.
    #[must_use]
    pub fn new(id: ParticipantId, name: String) -> Self {
        Self {
            id,
            name,
            estimate: Estimate::Unsubmitted,
        }
    }
}
