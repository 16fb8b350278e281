//! Postgres-backed transactions.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError | Scenario |
//! |------------|----------------------|-------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent insert of the same row |
//! | Database (lock not available) | `55P03` | `LockTimeout` | Business lock wait exceeded `lock_timeout` |
//! | Database (lock not available) | `55P03` | `Conflict` | Row lock wait exceeded `lock_timeout` outside the business lock |
//! | Database (other) | Any other | `Database` | Includes `40001`/`40P01`, which stay retryable |
//! | Other | N/A | `Database` | Network errors, pool closed, etc. |
//!
//! ## Locking
//!
//! The business lock is a transaction-scoped advisory lock on
//! `hashtextextended('<business>:<domain>', 0)`. It is released by Postgres
//! on commit or rollback; waiters are queued in arrival order.

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{BusinessId, DocumentId, DocumentType, DomainError, ExpectedVersion, WarehouseId};
use stockledger_events::{OutboxAction, OutboxRecord, PublishStatus};
use stockledger_inventory::{StockKey, StockSummary};
use stockledger_products::{ProductId, ProductType};

use super::{Database, DocumentRow, LedgerTx};
use crate::config::DatabaseConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::lock::{LockDomain, lock_key};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

/// Pool-backed [`Database`].
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgDatabase {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DatabaseConfig, lock_timeout: Duration) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, lock_timeout))
    }

    /// Apply the schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgLedgerTx {
            tx,
            lock_timeout: self.lock_timeout,
            held: HashSet::new(),
        }))
    }

    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_outbox_batch(
        &self,
        limit: usize,
        lease: Duration,
    ) -> LedgerResult<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE pub_sub_message_records
            SET publish_status = 'PROCESSING',
                claimed_at = NOW()
            WHERE id IN (
                SELECT id
                FROM pub_sub_message_records
                WHERE publish_status = 'PENDING'
                   OR (publish_status = 'FAILED'
                       AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()))
                   OR (publish_status = 'PROCESSING'
                       AND (claimed_at IS NULL
                            OR claimed_at <= NOW() - $2::bigint * INTERVAL '1 millisecond'))
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING
                id, business_id, transaction_date_time, reference_id, reference_type,
                action, new_obj, old_obj, is_processed, publish_status::text AS publish_status,
                correlation_id, attempts, last_error, next_attempt_at, claimed_at, created_at
            "#,
        )
        .bind(limit as i64)
        .bind(lease.as_millis() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_outbox_batch", e))?;

        let mut records = rows
            .iter()
            .map(outbox_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        records.sort_by_key(|r| r.created_at);

        Span::current().record("claimed", records.len());
        Ok(records)
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, status = record.publish_status.as_str()), err)]
    async fn complete_outbox(&self, record: &OutboxRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            UPDATE pub_sub_message_records
            SET publish_status = $2::publish_status,
                is_processed = $3,
                attempts = $4,
                last_error = $5,
                next_attempt_at = $6,
                claimed_at = $7
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(record.publish_status.as_str())
        .bind(record.is_processed)
        .bind(record.attempts as i32)
        .bind(&record.last_error)
        .bind(record.next_attempt_at)
        .bind(record.claimed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_outbox", e))?;
        Ok(())
    }
}

/// One open Postgres transaction; sqlx rolls it back on drop.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
    lock_timeout: Duration,
    held: HashSet<(BusinessId, LockDomain)>,
}

#[async_trait::async_trait]
impl LedgerTx for PgLedgerTx {
    #[instrument(skip(self), fields(business_id = %business_id, domain = %domain), err)]
    async fn lock_business(
        &mut self,
        business_id: BusinessId,
        domain: LockDomain,
    ) -> LedgerResult<()> {
        if self.held.contains(&(business_id, domain)) {
            return Ok(());
        }

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let locked = sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(lock_key(business_id, domain))
            .execute(&mut *self.tx)
            .await;

        match locked {
            Ok(_) => {
                self.held.insert((business_id, domain));
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("55P03") => {
                Err(LedgerError::LockTimeout {
                    business_id,
                    domain,
                })
            }
            Err(e) => Err(map_sqlx_error("lock_business", e)),
        }
    }

    fn holds_lock(&self, business_id: BusinessId, domain: LockDomain) -> bool {
        self.held.contains(&(business_id, domain))
    }

    async fn stock_summary(&mut self, key: &StockKey) -> LedgerResult<Option<StockSummary>> {
        let row = sqlx::query(
            r#"
            SELECT
                business_id, warehouse_id, product_id, product_type, batch_number,
                order_qty, committed_qty, received_qty, sale_qty,
                adjusted_qty_in, adjusted_qty_out, transfer_qty_in, transfer_qty_out,
                current_qty, last_movement_date, version
            FROM stock_summaries
            WHERE business_id = $1 AND warehouse_id = $2 AND product_id = $3
              AND product_type = $4 AND batch_number = $5
            "#,
        )
        .bind(key.business_id.as_uuid())
        .bind(key.warehouse_id.get())
        .bind(key.product_id.get())
        .bind(key.product_type.as_str())
        .bind(&key.batch_number)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_stock_summary", e))?;

        row.as_ref().map(stock_from_row).transpose()
    }

    #[instrument(skip(self, row), fields(key = %row.key, version = row.version), err)]
    async fn put_stock_summary(
        &mut self,
        row: &StockSummary,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let query = match expected {
            ExpectedVersion::Exact(0) => {
                r#"
                INSERT INTO stock_summaries (
                    business_id, warehouse_id, product_id, product_type, batch_number,
                    order_qty, committed_qty, received_qty, sale_qty,
                    adjusted_qty_in, adjusted_qty_out, transfer_qty_in, transfer_qty_out,
                    current_qty, last_movement_date, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT DO NOTHING
                "#
            }
            ExpectedVersion::Exact(_) => {
                r#"
                UPDATE stock_summaries
                SET order_qty = $6, committed_qty = $7, received_qty = $8, sale_qty = $9,
                    adjusted_qty_in = $10, adjusted_qty_out = $11,
                    transfer_qty_in = $12, transfer_qty_out = $13,
                    current_qty = $14, last_movement_date = $15, version = $16
                WHERE business_id = $1 AND warehouse_id = $2 AND product_id = $3
                  AND product_type = $4 AND batch_number = $5 AND version = $17
                "#
            }
            ExpectedVersion::Any => {
                r#"
                INSERT INTO stock_summaries (
                    business_id, warehouse_id, product_id, product_type, batch_number,
                    order_qty, committed_qty, received_qty, sale_qty,
                    adjusted_qty_in, adjusted_qty_out, transfer_qty_in, transfer_qty_out,
                    current_qty, last_movement_date, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                ON CONFLICT (business_id, warehouse_id, product_id, product_type, batch_number)
                DO UPDATE SET
                    order_qty = EXCLUDED.order_qty, committed_qty = EXCLUDED.committed_qty,
                    received_qty = EXCLUDED.received_qty, sale_qty = EXCLUDED.sale_qty,
                    adjusted_qty_in = EXCLUDED.adjusted_qty_in,
                    adjusted_qty_out = EXCLUDED.adjusted_qty_out,
                    transfer_qty_in = EXCLUDED.transfer_qty_in,
                    transfer_qty_out = EXCLUDED.transfer_qty_out,
                    current_qty = EXCLUDED.current_qty,
                    last_movement_date = EXCLUDED.last_movement_date,
                    version = EXCLUDED.version
                "#
            }
        };

        let mut q = sqlx::query(query)
            .bind(row.key.business_id.as_uuid())
            .bind(row.key.warehouse_id.get())
            .bind(row.key.product_id.get())
            .bind(row.key.product_type.as_str())
            .bind(&row.key.batch_number)
            .bind(row.order_qty)
            .bind(row.committed_qty)
            .bind(row.received_qty)
            .bind(row.sale_qty)
            .bind(row.adjusted_qty_in)
            .bind(row.adjusted_qty_out)
            .bind(row.transfer_qty_in)
            .bind(row.transfer_qty_out)
            .bind(row.current_qty)
            .bind(row.last_movement_date)
            .bind(row.version as i64);
        if let ExpectedVersion::Exact(v) = expected {
            if v > 0 {
                q = q.bind(v as i64);
            }
        }

        let result = q
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("put_stock_summary", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::conflict(format!(
                "stock row {} is not at {expected:?}",
                row.key
            )));
        }
        Ok(())
    }

    async fn document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
    ) -> LedgerResult<Option<DocumentRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, business_id, document_type, status, body, attachments, version
            FROM documents
            WHERE business_id = $1 AND id = $2
            "#,
        )
        .bind(business_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_document", e))?;

        row.as_ref().map(document_from_row).transpose()
    }

    #[instrument(skip(self, row), fields(document_id = %row.id, document_type = %row.document_type), err)]
    async fn put_document(
        &mut self,
        row: &DocumentRow,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let attachments = serde_json::to_value(&row.attachments)?;
        let query = match expected {
            ExpectedVersion::Exact(0) => {
                r#"
                INSERT INTO documents (id, business_id, document_type, status, body, attachments, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT DO NOTHING
                "#
            }
            ExpectedVersion::Exact(_) => {
                r#"
                UPDATE documents
                SET status = $4, body = $5, attachments = $6, version = $7, updated_at = NOW()
                WHERE id = $1 AND business_id = $2 AND document_type = $3 AND version = $8
                "#
            }
            ExpectedVersion::Any => {
                r#"
                INSERT INTO documents (id, business_id, document_type, status, body, attachments, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (business_id, id) DO UPDATE SET
                    status = EXCLUDED.status, body = EXCLUDED.body,
                    attachments = EXCLUDED.attachments, version = EXCLUDED.version,
                    updated_at = NOW()
                "#
            }
        };

        let mut q = sqlx::query(query)
            .bind(row.id.as_uuid())
            .bind(row.business_id.as_uuid())
            .bind(row.document_type.as_str())
            .bind(&row.status)
            .bind(&row.body)
            .bind(attachments)
            .bind(row.version as i64);
        if let ExpectedVersion::Exact(v) = expected {
            if v > 0 {
                q = q.bind(v as i64);
            }
        }

        let result = q
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("put_document", e))?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::conflict(format!(
                "document {} is not at {expected:?}",
                row.id
            )));
        }
        Ok(())
    }

    async fn remove_document(
        &mut self,
        business_id: BusinessId,
        id: DocumentId,
        expected: ExpectedVersion,
    ) -> LedgerResult<()> {
        let version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE business_id = $1 AND id = $2 AND ($3::BIGINT IS NULL OR version = $3)
            "#,
        )
        .bind(business_id.as_uuid())
        .bind(id.as_uuid())
        .bind(version)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("remove_document", e))?;

        if result.rows_affected() == 0 {
            return match self.document(business_id, id).await? {
                None => Err(DomainError::not_found().into()),
                Some(current) => Err(LedgerError::conflict(format!(
                    "document {id} is at version {}, expected {expected:?}",
                    current.version
                ))),
            };
        }
        Ok(())
    }

    async fn next_sequence(
        &mut self,
        business_id: BusinessId,
        document_type: DocumentType,
    ) -> LedgerResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO document_sequences (business_id, document_type, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (business_id, document_type)
            DO UPDATE SET last_value = document_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(business_id.as_uuid())
        .bind(document_type.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;

        row.try_get("last_value")
            .map_err(|e| map_sqlx_error("decode_sequence", e))
    }

    #[instrument(skip(self, record), fields(record_id = %record.id, action = record.action.as_str()), err)]
    async fn append_outbox(&mut self, record: &OutboxRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pub_sub_message_records (
                id, business_id, transaction_date_time, reference_id, reference_type,
                action, new_obj, old_obj, is_processed, publish_status,
                correlation_id, attempts, last_error, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::publish_status, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(record.business_id.as_uuid())
        .bind(record.transaction_date_time)
        .bind(record.reference_id.as_uuid())
        .bind(record.reference_type.as_str())
        .bind(record.action.as_str())
        .bind(&record.new_obj)
        .bind(&record.old_obj)
        .bind(record.is_processed)
        .bind(record.publish_status.as_str())
        .bind(&record.correlation_id)
        .bind(record.attempts as i32)
        .bind(&record.last_error)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_outbox", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn stock_from_row(row: &PgRow) -> LedgerResult<StockSummary> {
    let decode = |e| map_sqlx_error("decode_stock_summary", e);
    let product_type: String = row.try_get("product_type").map_err(decode)?;
    let key = StockKey::new(
        BusinessId::from_uuid(row.try_get::<Uuid, _>("business_id").map_err(decode)?),
        WarehouseId(row.try_get::<i64, _>("warehouse_id").map_err(decode)?),
        ProductId(row.try_get::<i64, _>("product_id").map_err(decode)?),
        ProductType::parse(&product_type)?,
        row.try_get::<String, _>("batch_number").map_err(decode)?,
    );
    let qty = |column: &str| row.try_get::<Decimal, _>(column).map_err(decode);

    Ok(StockSummary {
        key,
        order_qty: qty("order_qty")?,
        committed_qty: qty("committed_qty")?,
        received_qty: qty("received_qty")?,
        sale_qty: qty("sale_qty")?,
        adjusted_qty_in: qty("adjusted_qty_in")?,
        adjusted_qty_out: qty("adjusted_qty_out")?,
        transfer_qty_in: qty("transfer_qty_in")?,
        transfer_qty_out: qty("transfer_qty_out")?,
        current_qty: qty("current_qty")?,
        last_movement_date: row
            .try_get::<Option<NaiveDate>, _>("last_movement_date")
            .map_err(decode)?,
        version: row.try_get::<i64, _>("version").map_err(decode)? as u64,
    })
}

fn document_from_row(row: &PgRow) -> LedgerResult<DocumentRow> {
    let decode = |e| map_sqlx_error("decode_document", e);
    let document_type: String = row.try_get("document_type").map_err(decode)?;
    let attachments: serde_json::Value = row.try_get("attachments").map_err(decode)?;

    Ok(DocumentRow {
        id: DocumentId::from_uuid(row.try_get("id").map_err(decode)?),
        business_id: BusinessId::from_uuid(row.try_get("business_id").map_err(decode)?),
        document_type: DocumentType::parse(&document_type)?,
        status: row.try_get("status").map_err(decode)?,
        body: row.try_get("body").map_err(decode)?,
        attachments: serde_json::from_value(attachments)?,
        version: row.try_get::<i64, _>("version").map_err(decode)? as u64,
    })
}

fn outbox_from_row(row: &PgRow) -> LedgerResult<OutboxRecord> {
    let decode = |e| map_sqlx_error("decode_outbox_record", e);
    let reference_type: String = row.try_get("reference_type").map_err(decode)?;
    let action: String = row.try_get("action").map_err(decode)?;
    let publish_status: String = row.try_get("publish_status").map_err(decode)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(decode)?,
        business_id: BusinessId::from_uuid(row.try_get("business_id").map_err(decode)?),
        transaction_date_time: row.try_get("transaction_date_time").map_err(decode)?,
        reference_id: DocumentId::from_uuid(row.try_get("reference_id").map_err(decode)?),
        reference_type: DocumentType::parse(&reference_type)?,
        action: OutboxAction::parse(&action)?,
        new_obj: row.try_get("new_obj").map_err(decode)?,
        old_obj: row.try_get("old_obj").map_err(decode)?,
        is_processed: row.try_get("is_processed").map_err(decode)?,
        publish_status: PublishStatus::parse(&publish_status)?,
        correlation_id: row.try_get("correlation_id").map_err(decode)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(decode)? as u32,
        last_error: row.try_get("last_error").map_err(decode)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(decode)?,
        claimed_at: row.try_get("claimed_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            // Unique violation: another transaction inserted the same row first.
            Some("23505") => {
                return LedgerError::conflict(format!(
                    "duplicate row in {operation}: {}",
                    db_err.message()
                ));
            }
            // `lock_timeout` is transaction-local, so row locks time out too.
            Some("55P03") => {
                return LedgerError::conflict(format!(
                    "lock not available in {operation}: {}",
                    db_err.message()
                ));
            }
            _ => {}
        }
    }
    tracing::warn!(operation, error = %err, "database error");
    LedgerError::Database(err)
}
