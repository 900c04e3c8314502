//! Transfer FSM State Definitions
//!
//! State IDs are stored as SMALLINT in PostgreSQL.

use serde::Serialize;
use std::fmt;

/// Transfer lifecycle
///
/// ```text
/// RECEIVED → VALIDATED → EVENT_PUBLISHED → SETTLED
///     ↓           ↓              ↓
///  REJECTED    REJECTED        FAILED
/// ```
///
/// Terminal states: SETTLED (30), REJECTED (-10), FAILED (-20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransferState {
    /// Request accepted for processing; never persisted
    Received = 0,

    /// Validated and authorized, row persisted, event not yet published
    Validated = 10,

    /// Transfer-initiated event published; settlement pending
    EventPublished = 20,

    /// Terminal: journal entry POSTED
    Settled = 30,

    /// Terminal: rejected synchronously, or abandoned before publication
    Rejected = -10,

    /// Terminal: journal entry FAILED (business rejection during settlement)
    Failed = -20,
}

impl TransferState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Settled | TransferState::Rejected | TransferState::Failed
        )
    }

    /// Legal single-step transitions
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, EventPublished)
                | (Validated, Rejected)
                | (EventPublished, Settled)
                | (EventPublished, Failed)
                // the consumer may settle before the publisher records EVENT_PUBLISHED
                | (Validated, Settled)
                | (Validated, Failed)
        )
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TransferState::Received),
            10 => Some(TransferState::Validated),
            20 => Some(TransferState::EventPublished),
            30 => Some(TransferState::Settled),
            -10 => Some(TransferState::Rejected),
            -20 => Some(TransferState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Received => "RECEIVED",
            TransferState::Validated => "VALIDATED",
            TransferState::EventPublished => "EVENT_PUBLISHED",
            TransferState::Settled => "SETTLED",
            TransferState::Rejected => "REJECTED",
            TransferState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for TransferState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransferState::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TransferState; 6] = [
        TransferState::Received,
        TransferState::Validated,
        TransferState::EventPublished,
        TransferState::Settled,
        TransferState::Rejected,
        TransferState::Failed,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Settled.is_terminal());
        assert!(TransferState::Rejected.is_terminal());
        assert!(TransferState::Failed.is_terminal());

        assert!(!TransferState::Received.is_terminal());
        assert!(!TransferState::Validated.is_terminal());
        assert!(!TransferState::EventPublished.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_failed_only_after_validation() {
        assert!(TransferState::EventPublished.can_transition_to(TransferState::Failed));
        assert!(!TransferState::Received.can_transition_to(TransferState::Failed));
        assert!(!TransferState::EventPublished.can_transition_to(TransferState::Rejected));
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in ALL {
            assert_eq!(TransferState::from_id(state.id()), Some(state));
        }
        assert!(TransferState::from_id(999).is_none());
        assert!(TransferState::try_from(-999).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferState::EventPublished.to_string(), "EVENT_PUBLISHED");
        assert_eq!(
            serde_json::to_string(&TransferState::Settled).unwrap(),
            "\"SETTLED\""
        );
    }
}
