//! Connection Pool Benchmarks
//!
//! Measures pool overhead against the in-process server:
//! - Acquire/release of an idle connection
//! - Acquire, ping, release
//! - Contended acquire/release from several tasks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use docpool::connection::memory::MemoryServer;
use docpool::{executor, uri, Pool, PoolOptions};

fn pool(max_size: usize) -> Pool {
    let server = MemoryServer::new();
    let config = uri::parse("mongodb://bench/store").expect("valid uri");
    let options = PoolOptions { max_size, acquire_timeout: Duration::from_secs(5) };
    Pool::new(config, Arc::new(server.connector()), options).expect("valid pool")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let pool = pool(4);

    c.bench_function("pool_acquire_release_idle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let connection = pool.acquire_default().await.expect("acquire");
                pool.release(black_box(connection));
            });
        });
    });
}

fn bench_acquire_ping_release(c: &mut Criterion) {
    let rt = runtime();
    let pool = pool(4);

    c.bench_function("pool_acquire_ping_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut connection = pool.acquire_default().await.expect("acquire");
                let reply = executor::ping(&mut connection, "store").await.expect("ping");
                pool.release(connection);
                black_box(reply)
            })
        });
    });
}

fn bench_contended(c: &mut Criterion) {
    let rt = runtime();
    let pool = pool(2);
    let command = docpool::Command::new("store", doc! { "ping": 1 }).expect("valid command");

    c.bench_function("pool_contended_8_tasks_2_connections", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut tasks = Vec::with_capacity(8);
                for _ in 0..8 {
                    let pool = pool.clone();
                    let command = command.clone();
                    tasks.push(tokio::spawn(async move {
                        let mut connection = pool.acquire_default().await.expect("acquire");
                        connection.send_command(&command).await.expect("ping");
                        pool.release(connection);
                    }));
                }
                for task in tasks {
                    task.await.expect("task");
                }
            });
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_acquire_ping_release, bench_contended);
criterion_main!(benches);
