//! Core types used throughout the system
//!
//! Identifiers are ULID newtypes: monotonic, sortable, generated without
//! coordination between instances, and stored as their 26-char string form.

use std::fmt;
use std::str::FromStr;

/// User ID - verified caller identity supplied by the identity context.
///
/// Also the owner of an account; ownership checks compare these directly.
pub type UserId = u64;

/// Minor units of a currency (cents, satoshi). Signed so postings can debit.
pub type MinorUnits = i64;

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(ulid::Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

ulid_id!(
    /// Ledger account identifier
    AccountId
);

ulid_id!(
    /// Journal entry identifier
    EntryId
);

ulid_id!(
    /// Posting identifier
    PostingId
);

ulid_id!(
    /// Transfer identifier; its string form is also the journal reference
    TransferId
);

/// External reference correlating a journal entry with the request that
/// caused it. Unique across journal entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<TransferId> for ReferenceId {
    fn from(id: TransferId) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
