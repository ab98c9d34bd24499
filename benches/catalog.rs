//! Catalog Benchmarks
//!
//! Measures sample data generation and the count queries of the product
//! report over a seeded in-process store.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use docpool::catalog::{self, PRODUCT_COUNT, STORE_DATABASE};
use docpool::connection::memory::MemoryServer;
use docpool::{uri, Pool, PoolOptions};

fn bench_generate_products(c: &mut Criterion) {
    c.bench_function("catalog_generate_1000_products", |b| {
        b.iter(|| catalog::generate_products(black_box(PRODUCT_COUNT)).expect("valid count"));
    });

    let products = catalog::generate_products(PRODUCT_COUNT).expect("valid count");
    c.bench_function("catalog_products_to_documents", |b| {
        b.iter(|| {
            products
                .iter()
                .map(|p| p.to_document().expect("encodable"))
                .collect::<Vec<_>>()
        });
    });
}

fn bench_product_report(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to build runtime");
    let server = MemoryServer::new();
    let config = uri::parse("mongodb://bench/store").expect("valid uri");
    let pool = Pool::new(config, Arc::new(server.connector()), PoolOptions::default())
        .expect("valid pool");

    rt.block_on(async {
        let mut connection = pool.acquire_default().await.expect("acquire");
        catalog::seed_store(&mut connection, STORE_DATABASE).await.expect("seed");
        catalog::index_products(&mut connection, STORE_DATABASE).await.expect("index");
        pool.release(connection);
    });

    c.bench_function("catalog_product_report", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut connection = pool.acquire_default().await.expect("acquire");
                let report = catalog::product_report(&mut connection, STORE_DATABASE).await;
                pool.release(connection);
                black_box(report.expect("report"))
            })
        });
    });
}

criterion_group!(benches, bench_generate_products, bench_product_report);
criterion_main!(benches);
