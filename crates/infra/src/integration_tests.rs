//! Integration tests for the document → stock ledger → outbox pipeline.
//!
//! Runs against the in-memory database. Verifies:
//! - Status transitions move exactly the documented dimensions
//! - Failures leave stock, documents and outbox untouched
//! - Concurrent stock writers serialise on the business lock
//! - Void+Clone and the outbox relay behave end to end

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    use stockledger_core::{
        BranchId, BusinessId, DocumentHeader, DomainError, ExpectedVersion, PartyId, WarehouseId,
    };
    use stockledger_events::{
        AccountingMessage, EventBus, InMemoryEventBus, OutboxAction, PublishStatus, Subscription,
    };
    use stockledger_inventory::{
        AdjustmentLine, AdjustmentStatus, DocumentLine, InventoryAdjustment, LinkedLine,
        StockDimension, StockDocument, StockKey, StockLevel, StockSummary, TransferOrder,
        TransferStatus, STOCK_NOT_TRACKED,
    };
    use stockledger_invoicing::{CreditNote, CreditNoteStatus, InvoiceStatus, SalesInvoice};
    use stockledger_products::{InMemoryProductCatalog, Product, ProductId, ProductType};
    use stockledger_purchasing::{
        Bill, BillStatus, PurchaseOrder, PurchaseOrderStatus, SupplierCredit, SupplierCreditStatus,
    };
    use stockledger_sales::{SalesOrder, SalesOrderStatus};

    use crate::config::OutboxConfig;
    use crate::error::LedgerError;
    use crate::lock::acquire_stock_lock;
    use crate::numbering::Numbering;
    use crate::outbox::OutboxRelay;
    use crate::repository::{self, Stored};
    use crate::retry::RetryPolicy;
    use crate::services::{DocumentService, OperationContext};
    use crate::stock_commands::StockCommandEngine;
    use crate::stock_store::{get_product_stock, update_stock_summary, update_stock_summary_received_qty};
    use crate::tx::{Database, InMemoryDatabase};

    const MAIN: WarehouseId = WarehouseId(1);
    const BACK: WarehouseId = WarehouseId(2);
    const WIDGET: ProductId = ProductId(7);
    const GADGET: ProductId = ProductId(11);
    const CONSULTING: ProductId = ProductId(20);
    const FLOUR: ProductId = ProductId(30);
    const SUPPLIER: PartyId = PartyId(100);
    const CUSTOMER: PartyId = PartyId(200);

    struct Harness {
        db: InMemoryDatabase,
        service: Arc<DocumentService>,
        ctx: OperationContext,
    }

    impl Harness {
        fn business(&self) -> BusinessId {
            self.ctx.business_id
        }

        fn header(&self) -> DocumentHeader {
            DocumentHeader::new(self.business(), BranchId(1), day(1))
        }

        fn key(&self, warehouse: WarehouseId, product: ProductId) -> StockKey {
            StockKey::new(self.business(), warehouse, product, ProductType::Single, "")
        }

        fn row(&self, warehouse: WarehouseId, product: ProductId) -> StockSummary {
            let key = self.key(warehouse, product);
            self.db
                .stock_row(&key)
                .unwrap_or_else(|| StockSummary::empty(key))
        }

        fn outbox_actions(&self) -> Vec<OutboxAction> {
            self.db.outbox_records().iter().map(|r| r.action).collect()
        }

        /// Confirmed, unlinked bill receiving `qty` of `product` into MAIN.
        async fn receive(&self, product: ProductId, qty: i64) -> Stored<Bill> {
            let mut bill = Bill::new(
                self.header(),
                SUPPLIER,
                MAIN,
                vec![LinkedLine::unlinked(line(1, product, qty))],
            );
            bill.set_status(BillStatus::Confirmed);
            self.service.create(&self.ctx, bill, vec![]).await.unwrap()
        }

        async fn confirmed_purchase_order(&self, qty: i64) -> Stored<PurchaseOrder> {
            let po = PurchaseOrder::new(self.header(), SUPPLIER, MAIN, vec![line(1, WIDGET, qty)]);
            let po = self.service.create(&self.ctx, po, vec![]).await.unwrap();
            self.service
                .change_status::<PurchaseOrder>(&self.ctx, po.document.id(), PurchaseOrderStatus::Confirmed)
                .await
                .unwrap()
        }

        fn draft_bill_for(&self, po: &Stored<PurchaseOrder>, qty: i64) -> Bill {
            Bill::new(
                self.header(),
                SUPPLIER,
                MAIN,
                vec![LinkedLine::linked(line(1, WIDGET, qty), 1)],
            )
            .for_purchase_order(po.document.id())
        }
    }

    fn setup() -> Harness {
        setup_with(InMemoryDatabase::default(), RetryPolicy::new(5, Duration::from_millis(1)))
    }

    fn setup_with(db: InMemoryDatabase, retry: RetryPolicy) -> Harness {
        let business = BusinessId::new();
        let catalog = InMemoryProductCatalog::new();
        for (id, name, account) in [(WIDGET, "Widget", 1400), (GADGET, "Gadget", 1400), (CONSULTING, "Consulting", 0)] {
            catalog.insert_product(Product::new(business, id, ProductType::Single, name, account).unwrap());
        }
        catalog.insert_product(Product::new(business, FLOUR, ProductType::Input, "Flour", 1400).unwrap());

        let engine = StockCommandEngine::new(Arc::new(catalog));
        let service = DocumentService::new(Arc::new(db.clone()), engine, Numbering::default(), retry);
        Harness {
            db,
            service: Arc::new(service),
            ctx: OperationContext::new(business).with_correlation_id("test-run"),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn qty(n: i64) -> Decimal {
        Decimal::from(n)
    }

    fn line(line_no: u32, product: ProductId, n: i64) -> DocumentLine {
        DocumentLine::new(line_no, product, ProductType::Single, qty(n))
    }

    /// Every quantity column plus on-hand; versions and dates excluded.
    fn quantities(row: &StockSummary) -> Vec<Decimal> {
        StockDimension::ALL
            .iter()
            .map(|d| row.quantity(*d))
            .chain([row.current_qty])
            .collect()
    }

    #[tokio::test]
    async fn purchase_order_confirm_and_cancel_moves_order_qty() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.order_qty, qty(10));
        assert_eq!(row.current_qty, Decimal::ZERO);
        assert_eq!(po.document.header.document_number, "PO-000001");

        h.service
            .change_status::<PurchaseOrder>(&h.ctx, po.document.id(), PurchaseOrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).order_qty, Decimal::ZERO);
        assert!(h.db.outbox_records().is_empty(), "orders never post to accounting");
    }

    #[tokio::test]
    async fn bill_against_purchase_order_records_billed_qty() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;

        let bill = h
            .service
            .create(&h.ctx, h.draft_bill_for(&po, 4), vec![])
            .await
            .unwrap();
        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.received_qty, qty(4));
        assert_eq!(row.order_qty, qty(6));
        assert_eq!(row.current_qty, qty(4));

        let po = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(po.document.billed_qty(1), Some(qty(4)));
        assert_eq!(po.document.status, PurchaseOrderStatus::PartiallyBilled);
        assert_eq!(h.outbox_actions(), vec![OutboxAction::Create]);

        // The remainder closes the order.
        let mut rest = h.draft_bill_for(&po, 6);
        rest.set_status(BillStatus::Confirmed);
        h.service.create(&h.ctx, rest, vec![]).await.unwrap();

        let po = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(po.document.status, PurchaseOrderStatus::Closed);
        assert_eq!(h.row(MAIN, WIDGET).order_qty, Decimal::ZERO);
        assert_eq!(h.row(MAIN, WIDGET).received_qty, qty(10));
    }

    #[tokio::test]
    async fn over_billing_is_rejected_without_side_effects() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;
        let before = h.row(MAIN, WIDGET);

        let mut bill = h.draft_bill_for(&po, 11);
        bill.set_status(BillStatus::Confirmed);
        let err = h.service.create(&h.ctx, bill, vec![]).await.unwrap_err();

        match err {
            LedgerError::Domain(DomainError::Validation(msg)) => {
                assert_eq!(msg, "bill qty must be equal or less than purchase order qty")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(h.row(MAIN, WIDGET), before);
        assert!(h.db.outbox_records().is_empty());
        assert_eq!(h.db.document_count(h.business()), 1);
    }

    #[tokio::test]
    async fn voiding_a_bill_releases_its_order_lines() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;
        let mut bill = h.draft_bill_for(&po, 10);
        bill.set_status(BillStatus::Confirmed);
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        let closed = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(closed.document.status, PurchaseOrderStatus::Closed);

        h.service
            .void_and_clone::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap();

        let reopened = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(reopened.document.status, PurchaseOrderStatus::Confirmed);
        assert_eq!(reopened.document.billed_qty(1), Some(Decimal::ZERO));

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.order_qty, qty(10));
        assert_eq!(row.received_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn bill_line_for_another_product_cannot_fulfil_an_order_line() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;
        let widget_before = h.row(MAIN, WIDGET);
        let gadget_before = h.row(MAIN, GADGET);

        let mut bill = Bill::new(
            h.header(),
            SUPPLIER,
            MAIN,
            vec![LinkedLine::linked(line(1, GADGET, 4), 1)],
        )
        .for_purchase_order(po.document.id());
        bill.set_status(BillStatus::Confirmed);
        let err = h.service.create(&h.ctx, bill, vec![]).await.unwrap_err();

        match err {
            LedgerError::Domain(DomainError::Validation(msg)) => {
                assert!(msg.contains("cannot fulfil order line 1"), "{msg}")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(h.row(MAIN, WIDGET), widget_before);
        assert_eq!(h.row(MAIN, GADGET), gadget_before);
        assert!(h.db.outbox_records().is_empty());
        assert_eq!(h.db.document_count(h.business()), 1);

        let po = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(po.document.billed_qty(1), Some(Decimal::ZERO));
        assert_eq!(po.document.status, PurchaseOrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn orders_cannot_be_created_with_fulfilled_quantities() {
        let h = setup();

        for status in [PurchaseOrderStatus::Draft, PurchaseOrderStatus::Confirmed] {
            let mut po = PurchaseOrder::new(h.header(), SUPPLIER, MAIN, vec![line(1, WIDGET, 10)]);
            po.lines[0].fulfilled_qty = qty(3);
            po.set_status(status);
            let err = h.service.create(&h.ctx, po, vec![]).await.unwrap_err();
            assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))), "{err:?}");
        }

        let mut so = SalesOrder::new(h.header(), CUSTOMER, MAIN, vec![line(1, WIDGET, 5)]);
        so.lines[0].fulfilled_qty = qty(5);
        so.set_status(SalesOrderStatus::Confirmed);
        let err = h.service.create(&h.ctx, so, vec![]).await.unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))), "{err:?}");

        assert_eq!(h.row(MAIN, WIDGET).order_qty, Decimal::ZERO);
        assert_eq!(h.row(MAIN, WIDGET).committed_qty, Decimal::ZERO);
        assert_eq!(h.db.document_count(h.business()), 0);
    }

    #[tokio::test]
    async fn stored_draft_with_fulfilled_quantities_cannot_be_confirmed() {
        let h = setup();
        let po = PurchaseOrder::new(h.header(), SUPPLIER, MAIN, vec![line(1, WIDGET, 10)]);
        let po = h.service.create(&h.ctx, po, vec![]).await.unwrap();

        // Written straight to storage, skipping the service.
        let mut tx = h.db.begin().await.unwrap();
        let mut stored =
            repository::load::<PurchaseOrder>(tx.as_mut(), h.business(), po.document.id())
                .await
                .unwrap();
        stored.document.lines[0].fulfilled_qty = qty(4);
        repository::save(tx.as_mut(), &mut stored).await.unwrap();
        tx.commit().await.unwrap();

        let err = h
            .service
            .change_status::<PurchaseOrder>(&h.ctx, po.document.id(), PurchaseOrderStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))), "{err:?}");
        assert_eq!(h.row(MAIN, WIDGET).order_qty, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_bill_confirmations_serialise() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;

        let mut ids = Vec::new();
        for n in [3, 5] {
            let bill = h
                .service
                .create(&h.ctx, h.draft_bill_for(&po, n), vec![])
                .await
                .unwrap();
            ids.push(bill.document.id());
        }

        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let service = h.service.clone();
                let ctx = h.ctx.clone();
                tokio::spawn(async move {
                    service
                        .change_status::<Bill>(&ctx, id, BillStatus::Confirmed)
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.received_qty, qty(8));
        assert_eq!(row.order_qty, qty(2));
        assert_eq!(row.current_qty, qty(8));

        let po = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(po.document.billed_qty(1), Some(qty(8)));
        assert_eq!(h.db.outbox_records().len(), 2);
    }

    #[tokio::test]
    async fn confirm_then_void_restores_every_row() {
        let h = setup();
        h.receive(WIDGET, 20).await;
        let baseline = quantities(&h.row(MAIN, WIDGET));

        let mut invoice = SalesInvoice::new(
            h.header(),
            CUSTOMER,
            MAIN,
            vec![LinkedLine::unlinked(line(1, WIDGET, 4))],
        );
        invoice.set_status(InvoiceStatus::Confirmed);
        let invoice = h.service.create(&h.ctx, invoice, vec![]).await.unwrap();

        let mut note = CreditNote::new(h.header(), CUSTOMER, MAIN, vec![line(1, WIDGET, 2)]);
        note.set_status(CreditNoteStatus::Confirmed);
        let note = h.service.create(&h.ctx, note, vec![]).await.unwrap();

        let mut credit = SupplierCredit::new(h.header(), SUPPLIER, MAIN, vec![line(1, WIDGET, 3)]);
        credit.set_status(SupplierCreditStatus::Confirmed);
        let credit = h.service.create(&h.ctx, credit, vec![]).await.unwrap();

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.sale_qty, qty(4));
        assert_eq!(row.received_qty, qty(20 + 2 - 3));
        assert_eq!(row.current_qty, qty(20 - 4 + 2 - 3));

        h.service
            .change_status::<SalesInvoice>(&h.ctx, invoice.document.id(), InvoiceStatus::Void)
            .await
            .unwrap();
        h.service
            .change_status::<CreditNote>(&h.ctx, note.document.id(), CreditNoteStatus::Void)
            .await
            .unwrap();
        h.service
            .change_status::<SupplierCredit>(&h.ctx, credit.document.id(), SupplierCreditStatus::Void)
            .await
            .unwrap();

        assert_eq!(quantities(&h.row(MAIN, WIDGET)), baseline);
        let deletes = h
            .outbox_actions()
            .into_iter()
            .filter(|a| *a == OutboxAction::Delete)
            .count();
        assert_eq!(deletes, 3);
    }

    #[tokio::test]
    async fn noop_transitions_leave_rows_untouched() {
        let h = setup();
        let bill = h.receive(WIDGET, 5).await;
        let before = h.row(MAIN, WIDGET);
        let records = h.db.outbox_records().len();

        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();
        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::PartialPaid)
            .await
            .unwrap();

        assert_eq!(h.row(MAIN, WIDGET), before);
        assert_eq!(h.db.outbox_records().len(), records);
    }

    #[tokio::test]
    async fn negative_stock_rolls_back_every_line() {
        let h = setup();
        h.receive(WIDGET, 10).await;
        let widget_before = h.row(MAIN, WIDGET);
        let records = h.db.outbox_records().len();

        let invoice = SalesInvoice::new(
            h.header(),
            CUSTOMER,
            MAIN,
            vec![
                LinkedLine::unlinked(line(1, WIDGET, 2)),
                LinkedLine::unlinked(line(2, GADGET, 1)),
            ],
        );
        let invoice = h.service.create(&h.ctx, invoice, vec![]).await.unwrap();
        let err = h
            .service
            .change_status::<SalesInvoice>(&h.ctx, invoice.document.id(), InvoiceStatus::Confirmed)
            .await
            .unwrap_err();

        assert!(
            matches!(err, LedgerError::Domain(DomainError::NegativeStock { .. })),
            "got {err:?}"
        );
        assert!(!err.is_retryable());
        assert_eq!(h.row(MAIN, WIDGET), widget_before);
        assert!(h.db.stock_row(&h.key(MAIN, GADGET)).is_none());
        assert_eq!(h.db.outbox_records().len(), records);

        let stored = h.service.get::<SalesInvoice>(&h.ctx, invoice.document.id()).await.unwrap();
        assert_eq!(stored.document.status, InvoiceStatus::Draft);
    }

    #[tokio::test]
    async fn failed_outbox_write_rolls_back_the_transition() {
        let h = setup();
        let bill = Bill::new(
            h.header(),
            SUPPLIER,
            MAIN,
            vec![LinkedLine::unlinked(line(1, WIDGET, 5))],
        );
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        h.db.fail_next_outbox_write();
        let err = h
            .service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        assert!(h.db.stock_row(&h.key(MAIN, WIDGET)).is_none());
        assert!(h.db.outbox_records().is_empty());

        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).received_qty, qty(5));

        let records = h.db.outbox_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reference_id, bill.document.id());
        assert_eq!(records[0].correlation_id.as_deref(), Some("test-run"));
    }

    #[tokio::test]
    async fn void_and_clone_replaces_a_posted_bill() {
        let h = setup();
        let before = h.row(MAIN, WIDGET);
        let original = h.receive(WIDGET, 6).await;

        let (voided, clone) = h
            .service
            .void_and_clone::<Bill>(&h.ctx, original.document.id())
            .await
            .unwrap();

        assert_eq!(voided.document.status, BillStatus::Void);
        assert_eq!(clone.document.status, BillStatus::Draft);
        assert_ne!(clone.document.id(), original.document.id());
        assert_eq!(clone.document.header.document_number, "BL-000002");
        assert_eq!(clone.document.lines, original.document.lines);
        assert_eq!(clone.document.supplier_id, original.document.supplier_id);
        assert_eq!(clone.document.paid_amount, Decimal::ZERO);

        assert_eq!(quantities(&h.row(MAIN, WIDGET)), quantities(&before));

        let records = h.db.outbox_records();
        assert_eq!(h.outbox_actions(), vec![OutboxAction::Create, OutboxAction::Delete]);
        let old = records[1].old_obj.as_ref().unwrap();
        assert_eq!(old["status"], "confirmed");

        let stored = h.service.get::<Bill>(&h.ctx, clone.document.id()).await.unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn confirming_the_clone_restores_the_voided_bills_effect() {
        let h = setup();
        let original = h.receive(WIDGET, 6).await;
        let posted = quantities(&h.row(MAIN, WIDGET));

        let (_, clone) = h
            .service
            .void_and_clone::<Bill>(&h.ctx, original.document.id())
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).current_qty, Decimal::ZERO);

        let confirmed = h
            .service
            .change_status::<Bill>(&h.ctx, clone.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(confirmed.document.status, BillStatus::Confirmed);
        assert_eq!(quantities(&h.row(MAIN, WIDGET)), posted);
        assert_eq!(
            h.outbox_actions(),
            vec![OutboxAction::Create, OutboxAction::Delete, OutboxAction::Create]
        );
        let records = h.db.outbox_records();
        assert_eq!(records[2].reference_id, clone.document.id());
    }

    #[tokio::test]
    async fn void_and_clone_of_an_order_linked_bill_rebills_the_order() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;
        let mut bill = h.draft_bill_for(&po, 4);
        bill.set_status(BillStatus::Confirmed);
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        let posted = quantities(&h.row(MAIN, WIDGET));
        let billed = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(billed.document.status, PurchaseOrderStatus::PartiallyBilled);

        let (_, clone) = h
            .service
            .void_and_clone::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap();
        assert_eq!(clone.document.purchase_order_id, Some(po.document.id()));
        assert_eq!(clone.document.lines, bill.document.lines);

        let released = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(released.document.billed_qty(1), Some(Decimal::ZERO));
        assert_eq!(released.document.status, PurchaseOrderStatus::Confirmed);
        let row = h.row(MAIN, WIDGET);
        assert_eq!((row.order_qty, row.received_qty), (qty(10), Decimal::ZERO));

        h.service
            .change_status::<Bill>(&h.ctx, clone.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();

        let rebilled = h.service.get::<PurchaseOrder>(&h.ctx, po.document.id()).await.unwrap();
        assert_eq!(rebilled.document.billed_qty(1), billed.document.billed_qty(1));
        assert_eq!(rebilled.document.status, billed.document.status);
        assert_eq!(quantities(&h.row(MAIN, WIDGET)), posted);
    }

    #[tokio::test]
    async fn void_and_clone_refuses_when_reversal_goes_negative() {
        let h = setup();
        let bill = h.receive(WIDGET, 5).await;
        let mut invoice = SalesInvoice::new(
            h.header(),
            CUSTOMER,
            MAIN,
            vec![LinkedLine::unlinked(line(1, WIDGET, 4))],
        );
        invoice.set_status(InvoiceStatus::Confirmed);
        h.service.create(&h.ctx, invoice, vec![]).await.unwrap();
        let documents = h.db.document_count(h.business());

        let err = h
            .service
            .void_and_clone::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::NegativeStock { .. })));

        let stored = h.service.get::<Bill>(&h.ctx, bill.document.id()).await.unwrap();
        assert_eq!(stored.document.status, BillStatus::Confirmed);
        assert_eq!(h.db.document_count(h.business()), documents);
        assert_eq!(h.row(MAIN, WIDGET).current_qty, qty(1));
    }

    #[tokio::test]
    async fn settled_bills_cannot_be_voided() {
        let h = setup();
        let bill = h.receive(WIDGET, 5).await;

        let mut paid = bill.document.clone();
        paid.paid_amount = Decimal::new(1250, 2);
        h.service.update(&h.ctx, paid).await.unwrap();

        let err = h
            .service
            .void_and_clone::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));

        let err = h
            .service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Void)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn posted_documents_reject_structural_edits() {
        let h = setup();
        let bill = h.receive(WIDGET, 5).await;

        let mut edited = bill.document.clone();
        edited.lines[0].line.qty = qty(50);
        let err = h.service.update(&h.ctx, edited).await.unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));

        let mut edited = bill.document.clone();
        edited.warehouse_id = BACK;
        assert!(h.service.update(&h.ctx, edited).await.is_err());

        let mut annotated = bill.document.clone();
        annotated.header.notes = Some("delivered late".to_string());
        let stored = h.service.update(&h.ctx, annotated).await.unwrap();
        assert_eq!(stored.version, 2);

        let records = h.db.outbox_records();
        assert_eq!(h.outbox_actions(), vec![OutboxAction::Create, OutboxAction::Update]);
        assert!(records[1].new_obj.is_some() && records[1].old_obj.is_some());
        assert_eq!(h.row(MAIN, WIDGET).received_qty, qty(5));
    }

    #[tokio::test]
    async fn drafts_accept_structural_edits() {
        let h = setup();
        let bill = Bill::new(h.header(), SUPPLIER, MAIN, vec![LinkedLine::unlinked(line(1, WIDGET, 5))]);
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        let mut edited = bill.document.clone();
        edited.lines[0].line.qty = qty(8);
        edited.header.document_number = "tampered".to_string();
        let stored = h.service.update(&h.ctx, edited).await.unwrap();

        assert_eq!(stored.document.lines[0].line.qty, qty(8));
        assert_eq!(stored.document.header.document_number, "BL-000001");
        assert!(h.db.outbox_records().is_empty());
        assert!(h.db.stock_rows(h.business()).is_empty());
    }

    #[tokio::test]
    async fn transfer_moves_stock_between_warehouses() {
        let h = setup();
        h.receive(WIDGET, 10).await;

        let mut transfer = TransferOrder::new(h.header(), MAIN, BACK, vec![line(1, WIDGET, 4)]);
        transfer.set_status(TransferStatus::Confirmed);
        let transfer = h.service.create(&h.ctx, transfer, vec![]).await.unwrap();

        let source = h.row(MAIN, WIDGET);
        let destination = h.row(BACK, WIDGET);
        assert_eq!(source.transfer_qty_out, qty(4));
        assert_eq!(source.current_qty, qty(6));
        assert_eq!(destination.transfer_qty_in, qty(4));
        assert_eq!(destination.current_qty, qty(4));

        h.service
            .delete::<TransferOrder>(&h.ctx, transfer.document.id())
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).current_qty, qty(10));
        assert_eq!(h.row(BACK, WIDGET).current_qty, Decimal::ZERO);
        assert_eq!(
            h.outbox_actions(),
            vec![OutboxAction::Create, OutboxAction::Create, OutboxAction::Delete]
        );
    }

    #[tokio::test]
    async fn transfer_beyond_source_stock_fails() {
        let h = setup();
        h.receive(WIDGET, 3).await;

        let mut transfer = TransferOrder::new(h.header(), MAIN, BACK, vec![line(1, WIDGET, 4)]);
        transfer.set_status(TransferStatus::Confirmed);
        let err = h.service.create(&h.ctx, transfer, vec![]).await.unwrap_err();

        assert!(matches!(err, LedgerError::Domain(DomainError::NegativeStock { .. })));
        assert!(h.db.stock_row(&h.key(BACK, WIDGET)).is_none());
        assert_eq!(h.row(MAIN, WIDGET).current_qty, qty(3));
    }

    #[tokio::test]
    async fn adjustment_deletion_reverses_unless_stock_would_go_negative() {
        let h = setup();
        let adjust = |n: i64| {
            let mut adjustment = InventoryAdjustment::new(
                h.header(),
                MAIN,
                "stock count",
                vec![AdjustmentLine {
                    line_no: 1,
                    product_id: WIDGET,
                    product_type: ProductType::Single,
                    batch_number: String::new(),
                    qty_adjusted: qty(n),
                }],
            );
            adjustment.set_status(AdjustmentStatus::Adjusted);
            adjustment
        };

        let found = h.service.create(&h.ctx, adjust(5), vec![]).await.unwrap();
        let lost = h.service.create(&h.ctx, adjust(-2), vec![]).await.unwrap();

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.adjusted_qty_in, qty(5));
        assert_eq!(row.adjusted_qty_out, qty(2));
        assert_eq!(row.current_qty, qty(3));

        let err = h
            .service
            .delete::<InventoryAdjustment>(&h.ctx, found.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::NegativeStock { .. })));
        assert_eq!(h.db.document_count(h.business()), 2);

        h.service
            .delete::<InventoryAdjustment>(&h.ctx, lost.document.id())
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).current_qty, qty(5));
        assert_eq!(h.db.document_count(h.business()), 1);
    }

    #[tokio::test]
    async fn posted_bills_cannot_be_deleted() {
        let h = setup();
        let bill = h.receive(WIDGET, 5).await;

        let err = h
            .service
            .delete::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));

        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Void)
            .await
            .unwrap();
        h.service
            .delete::<Bill>(&h.ctx, bill.document.id())
            .await
            .unwrap();
        assert_eq!(h.db.document_count(h.business()), 0);
        assert_eq!(h.row(MAIN, WIDGET).current_qty, Decimal::ZERO);
    }

    #[tokio::test]
    async fn sales_order_commitment_is_consumed_by_invoices() {
        let h = setup();
        h.receive(WIDGET, 10).await;

        let so = SalesOrder::new(h.header(), CUSTOMER, MAIN, vec![line(1, WIDGET, 5)]);
        let so = h.service.create(&h.ctx, so, vec![]).await.unwrap();
        h.service
            .change_status::<SalesOrder>(&h.ctx, so.document.id(), SalesOrderStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).committed_qty, qty(5));

        let mut invoice = SalesInvoice::new(
            h.header(),
            CUSTOMER,
            MAIN,
            vec![LinkedLine::linked(line(1, WIDGET, 5), 1)],
        )
        .for_sales_order(so.document.id());
        invoice.set_status(InvoiceStatus::Confirmed);
        h.service.create(&h.ctx, invoice, vec![]).await.unwrap();

        let row = h.row(MAIN, WIDGET);
        assert_eq!(row.committed_qty, Decimal::ZERO);
        assert_eq!(row.sale_qty, qty(5));
        assert_eq!(row.current_qty, qty(5));

        let so = h.service.get::<SalesOrder>(&h.ctx, so.document.id()).await.unwrap();
        assert_eq!(so.document.status, SalesOrderStatus::Closed);
        assert_eq!(so.document.invoiced_qty(1), Some(qty(5)));
    }

    #[tokio::test]
    async fn untracked_and_input_products_never_create_rows() {
        let h = setup();
        let mut bill = Bill::new(
            h.header(),
            SUPPLIER,
            MAIN,
            vec![
                LinkedLine::unlinked(line(1, CONSULTING, 3)),
                LinkedLine::unlinked(DocumentLine::new(2, FLOUR, ProductType::Input, qty(25))),
            ],
        );
        bill.set_status(BillStatus::Confirmed);
        h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        assert!(h.db.stock_rows(h.business()).is_empty());
        assert_eq!(h.outbox_actions(), vec![OutboxAction::Create]);

        let level = h.service.stock_level(&h.key(MAIN, CONSULTING)).await.unwrap();
        assert_eq!(level, StockLevel::NotTracked);
        assert_eq!(level.as_sentinel(), STOCK_NOT_TRACKED);

        let flour = StockKey::new(h.business(), MAIN, FLOUR, ProductType::Input, "");
        assert_eq!(h.service.stock_level(&flour).await.unwrap(), StockLevel::NotTracked);

        let widget = h.service.stock_level(&h.key(MAIN, WIDGET)).await.unwrap();
        assert_eq!(widget, StockLevel::Tracked(Decimal::ZERO));
    }

    #[tokio::test]
    async fn lock_timeout_is_retryable_and_recoverable() {
        let db = InMemoryDatabase::new(Duration::from_millis(30));
        let h = setup_with(db, RetryPolicy::no_retry());
        let bill = Bill::new(h.header(), SUPPLIER, MAIN, vec![LinkedLine::unlinked(line(1, WIDGET, 5))]);
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        let mut holder = h.db.begin().await.unwrap();
        acquire_stock_lock(holder.as_mut(), h.business()).await.unwrap();

        let err = h
            .service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout { .. }), "got {err:?}");
        assert!(err.is_retryable());

        holder.rollback().await.unwrap();
        h.service
            .change_status::<Bill>(&h.ctx, bill.document.id(), BillStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(h.row(MAIN, WIDGET).current_qty, qty(5));
    }

    #[tokio::test]
    async fn lock_holders_are_served_after_release() {
        let h = setup();
        let bill = Bill::new(h.header(), SUPPLIER, MAIN, vec![LinkedLine::unlinked(line(1, WIDGET, 5))]);
        let bill = h.service.create(&h.ctx, bill, vec![]).await.unwrap();

        let mut holder = h.db.begin().await.unwrap();
        acquire_stock_lock(holder.as_mut(), h.business()).await.unwrap();

        let service = h.service.clone();
        let ctx = h.ctx.clone();
        let id = bill.document.id();
        let waiter = tokio::spawn(async move {
            service.change_status::<Bill>(&ctx, id, BillStatus::Confirmed).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.db.stock_row(&h.key(MAIN, WIDGET)).is_none());

        holder.commit().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(h.row(MAIN, WIDGET).received_qty, qty(5));
    }

    #[tokio::test]
    async fn documents_are_scoped_to_their_business() {
        let h = setup();
        let bill = h.receive(WIDGET, 1).await;

        let stranger = OperationContext::new(BusinessId::new());
        let err = h
            .service
            .get::<Bill>(&stranger, bill.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::NotFound)));

        let foreign = Bill::new(h.header(), SUPPLIER, MAIN, vec![LinkedLine::unlinked(line(1, WIDGET, 1))]);
        assert!(h.service.create(&stranger, foreign, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn loading_with_the_wrong_type_is_rejected() {
        let h = setup();
        let bill = h.receive(WIDGET, 1).await;
        let err = h
            .service
            .get::<SalesInvoice>(&h.ctx, bill.document.id())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));
    }

    #[tokio::test]
    async fn derived_statuses_cannot_be_requested() {
        let h = setup();
        let po = h.confirmed_purchase_order(10).await;
        let err = h
            .service
            .change_status::<PurchaseOrder>(&h.ctx, po.document.id(), PurchaseOrderStatus::PartiallyBilled)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::Validation(_))));
        assert_eq!(h.row(MAIN, WIDGET).order_qty, qty(10));
    }

    #[tokio::test]
    async fn store_requires_the_lock_of_the_rows_business() {
        let db = InMemoryDatabase::default();
        let business = BusinessId::new();
        let other = BusinessId::new();

        let mut tx = db.begin().await.unwrap();
        let lock = acquire_stock_lock(tx.as_mut(), business).await.unwrap();
        let foreign = StockKey::new(other, MAIN, WIDGET, ProductType::Single, "");
        let err = update_stock_summary_received_qty(tx.as_mut(), &lock, &foreign, qty(1), day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::InvariantViolation(_))));

        // A proof from another transaction is not enough either.
        let mut second = db.begin().await.unwrap();
        let own = StockKey::new(business, MAIN, WIDGET, ProductType::Single, "");
        drop(tx);
        let err = update_stock_summary(second.as_mut(), &lock, StockDimension::Received, &own, qty(1), day(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Domain(DomainError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn store_reads_its_own_writes_and_skips_zero_deltas() {
        let db = InMemoryDatabase::default();
        let business = BusinessId::new();
        let catalog = InMemoryProductCatalog::new();
        catalog.insert_product(Product::new(business, WIDGET, ProductType::Single, "Widget", 1400).unwrap());
        let key = StockKey::new(business, MAIN, WIDGET, ProductType::Single, "B-7");

        let mut tx = db.begin().await.unwrap();
        let lock = acquire_stock_lock(tx.as_mut(), business).await.unwrap();
        let row = update_stock_summary_received_qty(tx.as_mut(), &lock, &key, qty(4), day(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.last_movement_date, Some(day(3)));

        let level = get_product_stock(tx.as_mut(), &catalog, &key).await.unwrap();
        assert_eq!(level, StockLevel::Tracked(qty(4)));
        assert!(db.stock_row(&key).is_none(), "uncommitted");

        let same = update_stock_summary_received_qty(tx.as_mut(), &lock, &key, Decimal::ZERO, day(9))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(same, row);

        let input = StockKey::new(business, MAIN, FLOUR, ProductType::Input, "");
        assert!(
            update_stock_summary_received_qty(tx.as_mut(), &lock, &input, qty(1), day(1))
                .await
                .unwrap()
                .is_none()
        );

        tx.commit().await.unwrap();
        assert_eq!(db.stock_row(&key).unwrap().current_qty, qty(4));
    }

    #[tokio::test]
    async fn writers_that_bypass_the_lock_surface_as_conflicts() {
        let db = InMemoryDatabase::default();
        let key = StockKey::new(BusinessId::new(), MAIN, WIDGET, ProductType::Single, "");
        let row = StockSummary::empty(key.clone())
            .apply(StockDimension::Received, qty(1), day(1))
            .unwrap();

        let mut first = db.begin().await.unwrap();
        let mut second = db.begin().await.unwrap();
        first.put_stock_summary(&row, ExpectedVersion::Exact(0)).await.unwrap();
        second.put_stock_summary(&row, ExpectedVersion::Exact(0)).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(err.is_retryable());
        assert_eq!(db.stock_row(&key).unwrap().received_qty, qty(1));
    }

    #[tokio::test]
    async fn relay_publishes_pending_records_once() {
        let h = setup();
        h.receive(WIDGET, 1).await;
        h.receive(GADGET, 2).await;

        let bus = Arc::new(InMemoryEventBus::<AccountingMessage>::new());
        let subscription = bus.subscribe();
        let relay = OutboxRelay::new(Arc::new(h.db.clone()), bus, &relay_config());

        let report = relay.run_once().await.unwrap();
        assert_eq!((report.claimed, report.sent), (2, 2));

        let records = h.db.outbox_records();
        assert!(records.iter().all(|r| r.publish_status == PublishStatus::Sent && r.is_processed));
        let delivered = subscription.drain();
        assert_eq!(
            delivered.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            records.iter().map(|r| r.id).collect::<Vec<_>>()
        );

        assert_eq!(relay.run_once().await.unwrap().claimed, 0);
    }

    #[derive(Debug, Default)]
    struct BrokenBus;

    impl EventBus<AccountingMessage> for BrokenBus {
        type Error = String;

        fn publish(&self, _message: AccountingMessage) -> Result<(), Self::Error> {
            Err("broker unavailable".to_string())
        }

        fn subscribe(&self) -> Subscription<AccountingMessage> {
            let (_tx, rx) = std::sync::mpsc::channel();
            Subscription::new(rx)
        }
    }

    #[tokio::test]
    async fn relay_marks_failures_then_dead_letters() {
        let h = setup();
        h.receive(WIDGET, 1).await;
        let relay = OutboxRelay::new(Arc::new(h.db.clone()), BrokenBus, &relay_config());

        let first = relay.run_once().await.unwrap();
        assert_eq!((first.claimed, first.failed, first.dead), (1, 1, 0));
        let record = &h.db.outbox_records()[0];
        assert_eq!(record.publish_status, PublishStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error.as_deref(), Some("broker unavailable"));

        let second = relay.run_once().await.unwrap();
        assert_eq!((second.claimed, second.dead), (1, 1));
        assert_eq!(h.db.outbox_records()[0].publish_status, PublishStatus::Dead);

        assert_eq!(relay.run_once().await.unwrap().claimed, 0);
    }

    #[tokio::test]
    async fn failed_records_wait_for_their_backoff() {
        let h = setup();
        h.receive(WIDGET, 1).await;
        let config = OutboxConfig {
            max_attempts: 3,
            retry_backoff_ms: 60_000,
            max_backoff_ms: 600_000,
            ..relay_config()
        };
        let relay = OutboxRelay::new(Arc::new(h.db.clone()), BrokenBus, &config);

        let first = relay.run_once().await.unwrap();
        assert_eq!((first.claimed, first.failed), (1, 1));
        let record = &h.db.outbox_records()[0];
        assert!(record.next_attempt_at.unwrap() > chrono::Utc::now());
        assert_eq!(record.claimed_at, None);

        assert_eq!(relay.run_once().await.unwrap().claimed, 0);

        // The polling loop must not burn through the remaining attempts either.
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { relay.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let record = &h.db.outbox_records()[0];
        assert_eq!(record.attempts, 1);
        assert_eq!(record.publish_status, PublishStatus::Failed);
    }

    #[tokio::test]
    async fn retry_delay_doubles_up_to_the_cap() {
        let h = setup();
        let config = OutboxConfig {
            retry_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..relay_config()
        };
        let relay = OutboxRelay::new(Arc::new(h.db.clone()), BrokenBus, &config);

        let delays: Vec<u128> = (1..=6).map(|n| relay.retry_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(relay.retry_delay(u32::MAX).as_millis(), 1_000);
    }

    #[tokio::test]
    async fn records_abandoned_in_processing_are_reclaimed_after_the_lease() {
        let h = setup();
        h.receive(WIDGET, 1).await;

        // A relay claims the batch and dies before completing it.
        let abandoned = h.db.claim_outbox_batch(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(h.db.outbox_records()[0].publish_status, PublishStatus::Processing);

        let bus = Arc::new(InMemoryEventBus::<AccountingMessage>::new());
        let subscription = bus.subscribe();
        let config = OutboxConfig {
            lease_ms: 40,
            ..relay_config()
        };
        let relay = OutboxRelay::new(Arc::new(h.db.clone()), bus, &config);

        assert_eq!(relay.run_once().await.unwrap().claimed, 0, "lease still held");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let report = relay.run_once().await.unwrap();
        assert_eq!((report.claimed, report.sent), (1, 1));

        let record = &h.db.outbox_records()[0];
        assert_eq!(record.publish_status, PublishStatus::Sent);
        assert!(record.is_processed);
        assert_eq!(subscription.drain().len(), 1);
    }

    #[tokio::test]
    async fn relay_stops_on_shutdown() {
        let h = setup();
        let relay = OutboxRelay::new(
            Arc::new(h.db.clone()),
            Arc::new(InMemoryEventBus::<AccountingMessage>::new()),
            &relay_config(),
        );
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { relay.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Immediate retries, long lease.
    fn relay_config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 10,
            max_attempts: 2,
            poll_interval_ms: 5,
            retry_backoff_ms: 0,
            max_backoff_ms: 0,
            lease_ms: 60_000,
        }
    }
}
