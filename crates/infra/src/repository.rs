//! Typed document persistence over [`LedgerTx`].
//!
//! Attachments ride beside the document, never inside it, so serialising a
//! document for the outbox cannot leak them.

use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateRoot, BusinessId, DocumentId, DocumentStatus, DomainError, ExpectedVersion,
};
use stockledger_inventory::StockDocument;

use crate::error::LedgerResult;
use crate::tx::{DocumentRow, LedgerTx};

/// File metadata attached to a document. Blob storage is external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub url: String,
}

/// A document as persisted: value, attachments and row version.
#[derive(Debug, Clone)]
pub struct Stored<D> {
    pub document: D,
    pub attachments: Vec<Attachment>,
    pub version: u64,
}

impl<D: StockDocument> Stored<D> {
    /// Not yet persisted.
    pub fn new(document: D) -> Self {
        Self {
            document,
            attachments: Vec::new(),
            version: 0,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    fn to_row(&self, version: u64) -> LedgerResult<DocumentRow> {
        Ok(DocumentRow {
            id: self.document.id(),
            business_id: self.document.business_id(),
            document_type: D::DOCUMENT_TYPE,
            status: self.document.status().as_str().to_string(),
            body: serde_json::to_value(&self.document)?,
            attachments: self.attachments.clone(),
            version,
        })
    }

    fn from_row(row: DocumentRow) -> LedgerResult<Self> {
        if row.document_type != D::DOCUMENT_TYPE {
            return Err(DomainError::validation(format!(
                "document {} is a {}, not a {}",
                row.id,
                row.document_type,
                D::DOCUMENT_TYPE
            ))
            .into());
        }
        Ok(Self {
            document: serde_json::from_value(row.body)?,
            attachments: row.attachments,
            version: row.version,
        })
    }
}

impl<D: StockDocument> AggregateRoot for Stored<D> {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.document.header().id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

pub async fn find<D: StockDocument>(
    tx: &mut dyn LedgerTx,
    business_id: BusinessId,
    id: DocumentId,
) -> LedgerResult<Option<Stored<D>>> {
    tx.document(business_id, id)
        .await?
        .map(Stored::from_row)
        .transpose()
}

pub async fn load<D: StockDocument>(
    tx: &mut dyn LedgerTx,
    business_id: BusinessId,
    id: DocumentId,
) -> LedgerResult<Stored<D>> {
    find(tx, business_id, id)
        .await?
        .ok_or_else(|| DomainError::not_found().into())
}

/// Write the document at `stored.version + 1`, expecting the row to still be at `stored.version`.
pub async fn save<D: StockDocument>(
    tx: &mut dyn LedgerTx,
    stored: &mut Stored<D>,
) -> LedgerResult<()> {
    let next = stored.version + 1;
    let row = stored.to_row(next)?;
    tx.put_document(&row, ExpectedVersion::Exact(stored.version))
        .await?;
    stored.version = next;
    Ok(())
}

pub async fn remove<D: StockDocument>(
    tx: &mut dyn LedgerTx,
    stored: &Stored<D>,
) -> LedgerResult<()> {
    tx.remove_document(
        stored.document.business_id(),
        stored.document.id(),
        ExpectedVersion::Exact(stored.version),
    )
    .await
}
