use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use stockledger_core::{BusinessId, DocumentId, DocumentType};

use crate::outbox::{OutboxAction, OutboxRecord};

/// Message the relay publishes for one outbox record.
///
/// `message_id` is the outbox record id, so consumers can de-duplicate
/// redeliveries (delivery is at-least-once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountingMessage {
    pub message_id: Uuid,
    pub business_id: BusinessId,
    pub reference_type: DocumentType,
    pub reference_id: DocumentId,
    pub action: OutboxAction,
    pub transaction_date_time: DateTime<Utc>,
    pub new_obj: Option<Value>,
    pub old_obj: Option<Value>,
    pub correlation_id: Option<String>,
}

impl From<&OutboxRecord> for AccountingMessage {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            message_id: record.id,
            business_id: record.business_id,
            reference_type: record.reference_type,
            reference_id: record.reference_id,
            action: record.action,
            transaction_date_time: record.transaction_date_time,
            new_obj: record.new_obj.clone(),
            old_obj: record.old_obj.clone(),
            correlation_id: record.correlation_id.clone(),
        }
    }
}
