//! Transfer Core Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::TransferState;
use crate::core_types::{AccountId, MinorUnits, ReferenceId, TransferId, UserId};
use crate::money::StrictDecimal;

/// Client-supplied transfer request, as received
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TransferRequest {
    #[schema(value_type = String)]
    pub source_account: AccountId,
    #[schema(value_type = String)]
    pub destination_account: AccountId,
    /// Decimal amount in major units, e.g. "30.00"
    #[schema(value_type = String, example = "30.00")]
    pub amount: StrictDecimal,
    #[schema(example = "USD")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Persisted transfer row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub caller: UserId,
    pub idempotency_key: String,
    /// Hash of the request that created this transfer
    pub request_hash: String,
    pub source_account: AccountId,
    pub destination_account: AccountId,
    /// Minor units, always positive
    pub amount: MinorUnits,
    pub currency: String,
    pub description: Option<String>,
    pub state: TransferState,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Journal reference shared by the event and the resulting entry
    pub fn reference_id(&self) -> ReferenceId {
        ReferenceId::from(self.transfer_id)
    }

    pub fn event(&self) -> TransferInitiated {
        TransferInitiated {
            reference_id: self.reference_id(),
            transfer_id: self.transfer_id,
            source_account: self.source_account,
            destination_account: self.destination_account,
            amount: self.amount,
            currency: self.currency.clone(),
            issued_at: Utc::now(),
        }
    }
}

/// Transfer-intent event, consumed by the settlement consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInitiated {
    pub reference_id: ReferenceId,
    pub transfer_id: TransferId,
    pub source_account: AccountId,
    pub destination_account: AccountId,
    pub amount: MinorUnits,
    pub currency: String,
    pub issued_at: DateTime<Utc>,
}

/// Transfer view returned by submit and status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TransferReceipt {
    #[schema(value_type = String)]
    pub transfer_id: TransferId,
    #[schema(value_type = String)]
    pub source_account: AccountId,
    #[schema(value_type = String)]
    pub destination_account: AccountId,
    /// Decimal amount in major units
    pub amount: String,
    pub currency: String,
    /// RECEIVED | VALIDATED | EVENT_PUBLISHED | SETTLED | REJECTED | FAILED
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferReceipt {
    pub fn from_record(record: &TransferRecord, decimals: u32) -> Self {
        Self {
            transfer_id: record.transfer_id,
            source_account: record.source_account,
            destination_account: record.destination_account,
            amount: crate::money::format_minor(record.amount, decimals),
            currency: record.currency.clone(),
            state: record.state.as_str().to_string(),
            failure_reason: record.failure_reason.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransferRecord {
        let now = Utc::now();
        TransferRecord {
            transfer_id: TransferId::new(),
            caller: 1,
            idempotency_key: "k1".to_string(),
            request_hash: "h1".to_string(),
            source_account: AccountId::new(),
            destination_account: AccountId::new(),
            amount: 3_000,
            currency: "USD".to_string(),
            description: None,
            state: TransferState::EventPublished,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_event_carries_transfer_reference() {
        let r = record();
        let event = r.event();
        assert_eq!(event.reference_id.as_str(), r.transfer_id.to_string());
        assert_eq!(event.amount, 3_000);
        assert_eq!(event.source_account, r.source_account);
    }

    #[test]
    fn test_receipt_formats_amount() {
        let receipt = TransferReceipt::from_record(&record(), 2);
        assert_eq!(receipt.amount, "30.00");
        assert_eq!(receipt.state, "EVENT_PUBLISHED");
    }

    #[test]
    fn test_request_rejects_float_amount() {
        let src = AccountId::new();
        let dst = AccountId::new();
        let ok = format!(
            r#"{{"source_account":"{}","destination_account":"{}","amount":"30.00","currency":"USD"}}"#,
            src, dst
        );
        let parsed: TransferRequest = serde_json::from_str(&ok).unwrap();
        assert_eq!(parsed.amount.to_string(), "30.00");

        let bad = ok.replace("\"30.00\"", "\".5\"");
        assert!(serde_json::from_str::<TransferRequest>(&bad).is_err());
    }
}
