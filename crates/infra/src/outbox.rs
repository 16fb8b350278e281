//! Transactional outbox: writer and relay.
//!
//! [`publish_to_accounting`] appends a record in the caller's transaction, so
//! the record exists exactly when the document change commits. The
//! [`OutboxRelay`] later claims due records and publishes them.
//!
//! Delivery is at least once: failed records are retried with exponential
//! backoff, and records left in `PROCESSING` by a relay that died are
//! reclaimed once their lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use stockledger_core::{BusinessId, DocumentId, DocumentType, DomainError};
use stockledger_events::{AccountingMessage, EventBus, OutboxAction, OutboxRecord, PublishStatus};
use stockledger_inventory::StockDocument;

use crate::config::OutboxConfig;
use crate::error::LedgerResult;
use crate::tx::{Database, LedgerTx};

/// Append an accounting outbox record inside `tx`.
///
/// Snapshots are the serialised typed documents; attachments are stored
/// outside the document value and never reach the record.
#[allow(clippy::too_many_arguments)]
#[instrument(
    skip(tx, new_obj, old_obj, correlation_id),
    fields(business_id = %business_id, reference_id = %reference_id, reference_type = %reference_type, action = action.as_str()),
    err
)]
pub async fn publish_to_accounting<D: StockDocument>(
    tx: &mut dyn LedgerTx,
    business_id: BusinessId,
    transaction_date_time: DateTime<Utc>,
    reference_id: DocumentId,
    reference_type: DocumentType,
    new_obj: Option<&D>,
    old_obj: Option<&D>,
    action: OutboxAction,
    correlation_id: Option<String>,
) -> LedgerResult<OutboxRecord> {
    if !reference_type.is_posting() {
        return Err(DomainError::invariant(format!(
            "{reference_type} does not post to accounting"
        ))
        .into());
    }

    let new_obj = new_obj.map(serde_json::to_value).transpose()?;
    let old_obj = old_obj.map(serde_json::to_value).transpose()?;
    let record = OutboxRecord::new(
        business_id,
        transaction_date_time,
        reference_id,
        reference_type,
        action,
        new_obj,
        old_obj,
        correlation_id,
    )?;

    tx.append_outbox(&record).await?;
    Ok(record)
}

/// Outcome of one relay pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead: usize,
}

/// Publishes claimed outbox records as [`AccountingMessage`]s.
pub struct OutboxRelay<B> {
    db: Arc<dyn Database>,
    bus: B,
    batch_size: usize,
    max_attempts: u32,
    poll_interval: Duration,
    retry_backoff: Duration,
    max_backoff: Duration,
    lease: Duration,
}

impl<B> OutboxRelay<B>
where
    B: EventBus<AccountingMessage>,
{
    pub fn new(db: Arc<dyn Database>, bus: B, config: &OutboxConfig) -> Self {
        Self {
            db,
            bus,
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            poll_interval: config.poll_interval(),
            retry_backoff: config.retry_backoff(),
            max_backoff: config.max_backoff(),
            lease: config.lease(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Delay before retrying a record that has failed `attempts` times.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    fn retry_at(&self, attempts: u32) -> DateTime<Utc> {
        let now = Utc::now();
        TimeDelta::from_std(self.retry_delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claim one batch and publish it.
    #[instrument(skip(self), fields(batch_size = self.batch_size), err)]
    pub async fn run_once(&self) -> LedgerResult<RelayReport> {
        let claimed = self.db.claim_outbox_batch(self.batch_size, self.lease).await?;
        let mut report = RelayReport {
            claimed: claimed.len(),
            ..RelayReport::default()
        };

        for mut record in claimed {
            match self.bus.publish(AccountingMessage::from(&record)) {
                Ok(()) => record.mark_sent(),
                Err(err) => {
                    let attempts = record.attempts + 1;
                    let retry_at = self.retry_at(attempts);
                    warn!(record_id = %record.id, attempts, %retry_at, error = %err, "outbox publish failed");
                    record.mark_failed(err.to_string(), self.max_attempts, retry_at);
                }
            }
            self.db.complete_outbox(&record).await?;

            match record.publish_status {
                PublishStatus::Sent => report.sent += 1,
                PublishStatus::Dead => {
                    error!(record_id = %record.id, reference_id = %record.reference_id, "outbox record is dead");
                    report.dead += 1;
                }
                _ => report.failed += 1,
            }
        }

        if report.claimed > 0 {
            debug!(?report, "relay pass finished");
        }
        Ok(report)
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "outbox relay started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            // A pass that delivered nothing waits out the poll interval.
            let idle = match self.run_once().await {
                Ok(report) => report.sent == 0,
                Err(err) => {
                    error!(error = %err, "outbox relay pass failed");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("outbox relay stopped");
    }
}
