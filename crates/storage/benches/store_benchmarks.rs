#![allow(clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tollgate_storage::{
    MemoryBackend,
    auth::{MemorySigningKeyStore, MemoryTokenStore, SigningKeyStore, TokenStore},
    testutil::{access_token, key_pair, refresh_token},
};
use tokio::runtime::Runtime;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rt() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime")
}

// ---------------------------------------------------------------------------
// 1. refresh lookup and swap
// ---------------------------------------------------------------------------

fn refresh_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("refresh_operations");
    let rt = rt();
    let store = MemoryTokenStore::new(MemoryBackend::new());
    let now = Utc::now();

    // -- lookup with a populated table --
    for &rows in &[10usize, 1_000] {
        rt.block_on(async {
            for i in 0..rows {
                let token = refresh_token(&format!("lookup-{rows}-{i}"), "k1", now, 3600);
                store.put_refresh_token(&token).await.expect("put");
            }
        });
        let jti = format!("lookup-{rows}-0");
        group.bench_with_input(BenchmarkId::new("find_by_jti", rows), &rows, |b, _| {
            b.to_async(&rt).iter(|| {
                let store = store.clone();
                let jti = jti.clone();
                async move {
                    let found =
                        store.find_refresh_by_jti_not_expired(&jti, now).await.expect("find");
                    assert!(found.is_some());
                }
            });
        });
    }

    // -- insert + one redemption --
    let counter = AtomicUsize::new(0);
    group.bench_function("insert_and_redeem", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            let token = refresh_token(
                &format!("redeem-{}", counter.fetch_add(1, Ordering::Relaxed)),
                "k1",
                now,
                3600,
            );
            async move {
                store.put_refresh_token(&token).await.expect("put");
                store.compare_and_swap_refresh(&token, &token.redeemed(now)).await.expect("swap");
            }
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// 2. key lookup per block
// ---------------------------------------------------------------------------

fn key_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_operations");
    let rt = rt();
    let store = MemorySigningKeyStore::new(MemoryBackend::new());
    let expires = Utc::now() + Duration::hours(1);

    rt.block_on(async {
        for block in 0..64i64 {
            let kid = format!("k{block}");
            store.put_key_pair(&key_pair(&kid, expires)).await.expect("put");
            store.assign(block * 240, &kid).await.expect("assign");
        }
    });

    group.bench_function("signing_key_for_block", |b| {
        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                let key = store.signing_key_for_block(32 * 240).await.expect("lookup");
                assert!(key.is_some());
            }
        });
    });

    group.bench_function("referenced_key_ids", |b| {
        let tokens = MemoryTokenStore::new(MemoryBackend::new());
        let now = Utc::now();
        rt.block_on(async {
            for i in 0..256 {
                tokens
                    .put_access_token(&access_token(&format!("a{i}"), "k1", now, 300))
                    .await
                    .expect("put");
            }
        });
        b.to_async(&rt).iter(|| {
            let tokens = tokens.clone();
            async move {
                tokens.referenced_key_ids(now).await.expect("scan");
            }
        });
    });

    group.finish();
}

criterion_group!(benches, refresh_operations, key_operations);
criterion_main!(benches);
