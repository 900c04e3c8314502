//! Idempotency record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::IdempotencyError;
use crate::core_types::UserId;

pub const MAX_KEY_LEN: usize = 128;

/// Caller-scoped idempotency key. Two callers may use the same key string
/// without interfering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    pub caller: UserId,
    pub key: String,
}

impl ScopedKey {
    pub fn new(caller: UserId, key: &str) -> Result<Self, IdempotencyError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "length must be 1..={} bytes",
                MAX_KEY_LEN
            )));
        }
        if key.chars().any(|c| c.is_control()) {
            return Err(IdempotencyError::InvalidKey(
                "control characters not allowed".to_string(),
            ));
        }
        Ok(Self {
            caller,
            key: key.to_string(),
        })
    }
}

/// Cached terminal outcome, replayed verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl StoredResponse {
    /// Only success and client-error outcomes are final
    pub fn is_terminal(&self) -> bool {
        (200..300).contains(&self.status) || (400..500).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RecordState {
    InProgress = 0,
    Completed = 10,
}

impl RecordState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RecordState::InProgress),
            10 => Some(RecordState::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: ScopedKey,
    pub request_hash: String,
    pub state: RecordState,
    pub response: Option<StoredResponse>,
    /// In-progress lease; another request may take over once it lapses
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// What a new `begin` with `request_hash` sees for this live record
    pub fn outcome_for(&self, request_hash: &str, now: DateTime<Utc>) -> BeginOutcome {
        if self.request_hash != request_hash {
            return BeginOutcome::Conflict;
        }
        match (self.state, &self.response) {
            (RecordState::Completed, Some(response)) => BeginOutcome::Replay(response.clone()),
            _ if self.lease_expired(now) => BeginOutcome::Proceed,
            _ => BeginOutcome::InFlight,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::InProgress && self.locked_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Caller owns the key and must execute, then complete or release it
    Proceed,
    /// Same key and same request already finished
    Replay(StoredResponse),
    /// Same key reused with a different request body
    Conflict,
    /// Same request still executing elsewhere
    InFlight,
}

/// Stable fingerprint of a request body
pub fn request_hash<T: Serialize>(request: &T) -> Result<String, IdempotencyError> {
    let bytes =
        serde_json::to_vec(request).map_err(|e| IdempotencyError::Storage(e.to_string()))?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(state: RecordState, locked_for: i64) -> IdempotencyRecord {
        let now = Utc::now();
        IdempotencyRecord {
            key: ScopedKey::new(1, "k1").unwrap(),
            request_hash: "h1".to_string(),
            state,
            response: (state == RecordState::Completed).then(|| StoredResponse {
                status: 202,
                body: serde_json::json!({"id": "t1"}),
            }),
            locked_until: Some(now + Duration::seconds(locked_for)),
            expires_at: now + Duration::hours(24),
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(ScopedKey::new(1, "").is_err());
        assert!(ScopedKey::new(1, &"x".repeat(129)).is_err());
        assert!(ScopedKey::new(1, "bad\nkey").is_err());
        assert!(ScopedKey::new(1, &"x".repeat(128)).is_ok());
    }

    #[test]
    fn test_outcomes() {
        let now = Utc::now();
        let done = record(RecordState::Completed, 30);
        assert!(matches!(done.outcome_for("h1", now), BeginOutcome::Replay(r) if r.status == 202));
        assert_eq!(done.outcome_for("h2", now), BeginOutcome::Conflict);

        let running = record(RecordState::InProgress, 30);
        assert_eq!(running.outcome_for("h1", now), BeginOutcome::InFlight);
        assert_eq!(running.outcome_for("h2", now), BeginOutcome::Conflict);

        let abandoned = record(RecordState::InProgress, -1);
        assert_eq!(abandoned.outcome_for("h1", now), BeginOutcome::Proceed);
    }

    #[test]
    fn test_only_terminal_responses_cached() {
        let r = |status| StoredResponse {
            status,
            body: serde_json::Value::Null,
        };
        assert!(r(202).is_terminal());
        assert!(r(422).is_terminal());
        assert!(!r(503).is_terminal());
        assert!(!r(500).is_terminal());
    }

    #[test]
    fn test_request_hash_stable() {
        let a = request_hash(&serde_json::json!({"amount": "30.00", "to": "b"})).unwrap();
        let b = request_hash(&serde_json::json!({"amount": "30.00", "to": "b"})).unwrap();
        let c = request_hash(&serde_json::json!({"amount": "30.01", "to": "b"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
