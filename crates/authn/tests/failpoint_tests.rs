#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the authn crate.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p tollgate-authn --features failpoints,testutil --test failpoint_tests
//! ```

use std::sync::Arc;

use tollgate_authn::{Clock, IssueRequest, assert_auth_error, testutil::TestEngine};
use tollgate_storage::auth::TokenStore;

#[tokio::test]
async fn jwks_recompute_failure_without_snapshot_is_unavailable() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("jwks-before-recompute", "return").expect("failed to configure fail point");

    let engine = TestEngine::new(1_000);
    let result = engine.jwks.get().await;
    assert_auth_error!(result, StorageUnavailable);
    assert_eq!(engine.jwks.recompute_count(), 0);

    fail::remove("jwks-before-recompute");
    assert!(engine.jwks.get().await.is_ok());
    scenario.teardown();
}

#[tokio::test]
async fn jwks_recompute_failure_serves_stale_snapshot() {
    let scenario = fail::FailScenario::setup();
    let engine = TestEngine::new(1_000);
    engine.rotate().await;
    let first = engine.jwks.get().await.expect("initial snapshot");

    fail::cfg("jwks-before-recompute", "return").expect("failed to configure fail point");
    engine.jwks.invalidate();
    let served = engine.jwks.get().await.expect("stale snapshot");
    assert!(Arc::ptr_eq(&first, &served));

    fail::remove("jwks-before-recompute");
    let fresh = engine.jwks.get().await.expect("recomputed");
    assert!(!Arc::ptr_eq(&first, &fresh));
    scenario.teardown();
}

#[tokio::test]
async fn lost_swap_is_concurrent_redemption_and_leaves_token_live() {
    let scenario = fail::FailScenario::setup();
    let engine = TestEngine::new(1_000);
    engine.rotate().await;
    let issued = engine
        .issuer
        .issue(IssueRequest::builder().subject("user-1").build())
        .await
        .expect("issue");

    fail::cfg("token-store-before-cas", "return").expect("failed to configure fail point");
    let result = engine.exchange.redeem(&issued.refresh_token).await;
    assert_auth_error!(result, ConcurrentRedemption);

    let row = engine
        .tokens
        .find_refresh_by_jti_not_expired(&issued.refresh_jti, engine.clock.now())
        .await
        .expect("lookup")
        .expect("row still redeemable");
    assert_eq!(row.version_no, 0);

    fail::remove("token-store-before-cas");
    assert!(engine.exchange.redeem(&issued.refresh_token).await.is_ok());
    scenario.teardown();
}

#[tokio::test]
async fn storage_failure_during_swap_is_unavailable() {
    let scenario = fail::FailScenario::setup();
    let engine = TestEngine::new(1_000);
    engine.rotate().await;
    let issued = engine
        .issuer
        .issue(IssueRequest::builder().subject("user-1").build())
        .await
        .expect("issue");

    fail::cfg("memory-compare-and-set", "return").expect("failed to configure fail point");
    let result = engine.exchange.redeem(&issued.refresh_token).await;
    assert_auth_error!(result, StorageUnavailable);
    fail::remove("memory-compare-and-set");
    scenario.teardown();
}
