use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use stockledger_core::{BranchId, BusinessId, DocumentHeader, PartyId, WarehouseId};
use stockledger_infra::{
    acquire_stock_lock, update_stock_summary_received_qty, Database, DocumentService,
    InMemoryDatabase, Numbering, OperationContext, RetryPolicy, StockCommandEngine,
};
use stockledger_inventory::{DocumentLine, LinkedLine, StockDocument, StockKey, StockSummary, StockDimension};
use stockledger_products::{InMemoryProductCatalog, Product, ProductId, ProductType};
use stockledger_purchasing::{Bill, BillStatus};

const MAIN: WarehouseId = WarehouseId(1);

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn setup(products: i64) -> (InMemoryDatabase, Arc<DocumentService>, OperationContext) {
    let business = BusinessId::new();
    let catalog = InMemoryProductCatalog::new();
    for id in 1..=products {
        catalog.insert_product(
            Product::new(business, ProductId(id), ProductType::Single, format!("P{id}"), 1400).unwrap(),
        );
    }
    let db = InMemoryDatabase::new(Duration::from_secs(5));
    let service = DocumentService::new(
        Arc::new(db.clone()),
        StockCommandEngine::new(Arc::new(catalog)),
        Numbering::default(),
        RetryPolicy::default(),
    );
    (db, Arc::new(service), OperationContext::new(business))
}

fn bill(ctx: &OperationContext, lines: i64) -> Bill {
    let header = DocumentHeader::new(ctx.business_id, BranchId(1), date());
    let lines = (1..=lines)
        .map(|n| {
            LinkedLine::unlinked(DocumentLine::new(
                n as u32,
                ProductId(n),
                ProductType::Single,
                Decimal::from(5),
            ))
        })
        .collect();
    Bill::new(header, PartyId(1), MAIN, lines)
}

/// Pure arithmetic on one row: no storage, no locks.
fn bench_summary_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("summary_apply");
    let key = StockKey::new(BusinessId::new(), MAIN, ProductId(1), ProductType::Single, "");
    let row = StockSummary::empty(key)
        .apply(StockDimension::Received, Decimal::from(1_000), date())
        .unwrap();

    for dimension in [StockDimension::Received, StockDimension::Sale, StockDimension::Order] {
        group.bench_with_input(
            BenchmarkId::from_parameter(dimension),
            &dimension,
            |b, dimension| {
                b.iter(|| row.apply(*dimension, black_box(Decimal::new(25, 1)), date()).unwrap());
            },
        );
    }
    group.finish();
}

/// Single guarded update: begin, lock, read-modify-write, commit.
fn bench_guarded_update(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (db, _, ctx) = setup(1);
    let key = StockKey::new(ctx.business_id, MAIN, ProductId(1), ProductType::Single, "");

    c.bench_function("guarded_update", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut tx = db.begin().await.unwrap();
            let lock = acquire_stock_lock(tx.as_mut(), ctx.business_id).await.unwrap();
            update_stock_summary_received_qty(tx.as_mut(), &lock, &key, Decimal::ONE, date())
                .await
                .unwrap();
            tx.commit().await.unwrap();
        });
    });
}

/// Confirm a bill then void it; stock returns to where it started.
fn bench_confirm_void_cycle(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("confirm_void_cycle");
    group.sample_size(50);

    for lines in [1_i64, 10, 50] {
        let (_, service, ctx) = setup(lines);
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &lines, |b, lines| {
            b.to_async(&runtime).iter(|| async {
                let stored = service.create(&ctx, bill(&ctx, *lines), vec![]).await.unwrap();
                let id = stored.document.id();
                service
                    .change_status::<Bill>(&ctx, id, BillStatus::Confirmed)
                    .await
                    .unwrap();
                service
                    .change_status::<Bill>(&ctx, id, BillStatus::Void)
                    .await
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Concurrent confirmations contending on one business lock.
fn bench_contended_confirmations(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("contended_confirmations");
    group.sample_size(20);

    for writers in [2_usize, 8] {
        let (_, service, ctx) = setup(1);
        group.throughput(Throughput::Elements(writers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, writers| {
            b.to_async(&runtime).iter(|| async {
                let tasks: Vec<_> = (0..*writers)
                    .map(|_| {
                        let service = service.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let mut draft = bill(&ctx, 1);
                            draft.set_status(BillStatus::Confirmed);
                            service.create(&ctx, draft, vec![]).await.unwrap();
                        })
                    })
                    .collect();
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_summary_apply,
    bench_guarded_update,
    bench_confirm_void_cycle,
    bench_contended_confirmations
);
criterion_main!(benches);
