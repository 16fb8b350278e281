//! Transactional outbox rows (`pub_sub_message_records`).
//!
//! A record is written inside the same transaction as the document change it
//! describes and is immutable afterwards, apart from its delivery bookkeeping.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use stockledger_core::{BusinessId, DocumentId, DocumentType, DomainError, DomainResult};

/// What happened to the referenced document, from accounting's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxAction {
    Create,
    Update,
    Delete,
}

impl OutboxAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxAction::Create => "CREATE",
            OutboxAction::Update => "UPDATE",
            OutboxAction::Delete => "DELETE",
        }
    }

    pub fn parse(tag: &str) -> DomainResult<Self> {
        match tag {
            "CREATE" => Ok(OutboxAction::Create),
            "UPDATE" => Ok(OutboxAction::Update),
            "DELETE" => Ok(OutboxAction::Delete),
            other => Err(DomainError::validation(format!("unknown outbox action '{other}'"))),
        }
    }
}

/// Delivery state of an outbox record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PublishStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    /// Gave up after the maximum number of attempts.
    Dead,
}

impl PublishStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Pending => "PENDING",
            PublishStatus::Processing => "PROCESSING",
            PublishStatus::Sent => "SENT",
            PublishStatus::Failed => "FAILED",
            PublishStatus::Dead => "DEAD",
        }
    }

    pub fn parse(tag: &str) -> DomainResult<Self> {
        match tag {
            "PENDING" => Ok(PublishStatus::Pending),
            "PROCESSING" => Ok(PublishStatus::Processing),
            "SENT" => Ok(PublishStatus::Sent),
            "FAILED" => Ok(PublishStatus::Failed),
            "DEAD" => Ok(PublishStatus::Dead),
            other => Err(DomainError::validation(format!("unknown publish status '{other}'"))),
        }
    }

    /// Whether a relay may pick the record up, timing aside.
    ///
    /// `Processing` is included because a relay that dies mid-batch leaves
    /// its records there; they become claimable again once the lease expires.
    pub fn is_claimable(self) -> bool {
        matches!(
            self,
            PublishStatus::Pending | PublishStatus::Failed | PublishStatus::Processing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub business_id: BusinessId,
    pub transaction_date_time: DateTime<Utc>,
    pub reference_id: DocumentId,
    pub reference_type: DocumentType,
    pub action: OutboxAction,
    pub new_obj: Option<Value>,
    pub old_obj: Option<Value>,
    pub is_processed: bool,
    pub publish_status: PublishStatus,
    pub correlation_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a failed record may be retried.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current relay claimed the record.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// New pending record.
    ///
    /// `Create` needs `new_obj`, `Delete` needs `old_obj`, `Update` needs both.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        business_id: BusinessId,
        transaction_date_time: DateTime<Utc>,
        reference_id: DocumentId,
        reference_type: DocumentType,
        action: OutboxAction,
        new_obj: Option<Value>,
        old_obj: Option<Value>,
        correlation_id: Option<String>,
    ) -> DomainResult<Self> {
        let shape_ok = match action {
            OutboxAction::Create => new_obj.is_some(),
            OutboxAction::Update => new_obj.is_some() && old_obj.is_some(),
            OutboxAction::Delete => old_obj.is_some(),
        };
        if !shape_ok {
            return Err(DomainError::invariant(format!(
                "{} outbox record for {reference_type} {reference_id} is missing its snapshot",
                action.as_str()
            )));
        }

        Ok(Self {
            id: Uuid::now_v7(),
            business_id,
            transaction_date_time,
            reference_id,
            reference_type,
            action,
            new_obj,
            old_obj,
            is_processed: false,
            publish_status: PublishStatus::Pending,
            correlation_id,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            claimed_at: None,
            created_at: Utc::now(),
        })
    }

    /// Whether a relay may claim the record at `now`.
    ///
    /// Failed records wait for `next_attempt_at`; processing records wait
    /// until their claim is older than `lease`.
    pub fn is_due(&self, now: DateTime<Utc>, lease: TimeDelta) -> bool {
        match self.publish_status {
            PublishStatus::Failed => self.next_attempt_at.is_none_or(|at| at <= now),
            PublishStatus::Processing => self
                .claimed_at
                .is_none_or(|at| at.checked_add_signed(lease).is_some_and(|expiry| expiry <= now)),
            status => status.is_claimable(),
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.publish_status = PublishStatus::Processing;
        self.claimed_at = Some(now);
    }

    pub fn mark_sent(&mut self) {
        self.publish_status = PublishStatus::Sent;
        self.is_processed = true;
        self.last_error = None;
        self.next_attempt_at = None;
        self.claimed_at = None;
    }

    /// Record a failed delivery, retryable from `retry_at`.
    ///
    /// The record goes `Dead` once `max_attempts` is reached.
    pub fn mark_failed(&mut self, error: impl Into<String>, max_attempts: u32, retry_at: DateTime<Utc>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.claimed_at = None;
        if self.attempts >= max_attempts {
            self.publish_status = PublishStatus::Dead;
            self.next_attempt_at = None;
        } else {
            self.publish_status = PublishStatus::Failed;
            self.next_attempt_at = Some(retry_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_record(action: OutboxAction, new_obj: Option<Value>, old_obj: Option<Value>) -> DomainResult<OutboxRecord> {
        OutboxRecord::new(
            BusinessId::new(),
            Utc::now(),
            DocumentId::new(),
            DocumentType::Bill,
            action,
            new_obj,
            old_obj,
            None,
        )
    }

    #[test]
    fn snapshots_must_match_action() {
        assert!(test_record(OutboxAction::Create, Some(json!({})), None).is_ok());
        assert!(test_record(OutboxAction::Create, None, Some(json!({}))).is_err());
        assert!(test_record(OutboxAction::Delete, None, Some(json!({}))).is_ok());
        assert!(test_record(OutboxAction::Update, Some(json!({})), None).is_err());
    }

    #[test]
    fn failed_delivery_goes_dead_at_max_attempts() {
        let now = Utc::now();
        let mut record = test_record(OutboxAction::Create, Some(json!({})), None).unwrap();
        assert_eq!(record.publish_status, PublishStatus::Pending);

        record.mark_failed("broker down", 2, now);
        assert_eq!(record.publish_status, PublishStatus::Failed);
        assert!(record.publish_status.is_claimable());

        record.mark_failed("broker down", 2, now);
        assert_eq!(record.publish_status, PublishStatus::Dead);
        assert!(!record.publish_status.is_claimable());
        assert!(!record.is_due(now, TimeDelta::zero()));
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn failed_record_waits_for_its_retry_time() {
        let now = Utc::now();
        let mut record = test_record(OutboxAction::Create, Some(json!({})), None).unwrap();
        record.mark_processing(now);
        record.mark_failed("broker down", 5, now + TimeDelta::seconds(30));

        assert!(!record.is_due(now, TimeDelta::seconds(60)));
        assert!(!record.is_due(now + TimeDelta::seconds(29), TimeDelta::seconds(60)));
        assert!(record.is_due(now + TimeDelta::seconds(30), TimeDelta::seconds(60)));
        assert_eq!(record.claimed_at, None);
    }

    #[test]
    fn processing_record_is_reclaimable_after_its_lease() {
        let now = Utc::now();
        let lease = TimeDelta::seconds(60);
        let mut record = test_record(OutboxAction::Create, Some(json!({})), None).unwrap();
        assert!(record.is_due(now, lease));

        record.mark_processing(now);
        assert!(!record.is_due(now + TimeDelta::seconds(59), lease));
        assert!(record.is_due(now + lease, lease));
    }

    #[test]
    fn sent_marks_processed() {
        let mut record = test_record(OutboxAction::Create, Some(json!({})), None).unwrap();
        record.mark_processing(Utc::now());
        record.mark_sent();
        assert!(record.is_processed);
        assert_eq!(record.publish_status, PublishStatus::Sent);
        assert!(!record.is_due(Utc::now(), TimeDelta::zero()));
    }

    #[test]
    fn status_tags_match_database_enum() {
        assert_eq!(
            serde_json::to_value(PublishStatus::Processing).unwrap(),
            json!("PROCESSING")
        );
        assert_eq!(PublishStatus::parse("DEAD").unwrap(), PublishStatus::Dead);
    }
}
