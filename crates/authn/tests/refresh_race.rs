#![allow(clippy::expect_used, clippy::panic)]
//! Concurrent refresh-token redemption.
//!
//! However many callers present the same refresh token at once, exactly one
//! receives a new token pair.

use std::{sync::Arc, time::Duration};

use tollgate_authn::{
    AuthError, Clock, IssueRequest, IssuedTokens, assert_auth_error, testutil::TestEngine,
};
use tollgate_storage::auth::TokenStore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tollgate_authn=debug"))
        .with_test_writer()
        .try_init();
}

async fn engine_with_token() -> (TestEngine, IssuedTokens) {
    init_tracing();
    let engine = TestEngine::new(1_000);
    engine.rotate().await;
    let issued = engine
        .issuer
        .issue(IssueRequest::builder().subject("user-1").build())
        .await
        .expect("issue");
    (engine, issued)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_racing_redemptions_one_winner_one_conflict() {
    let (engine, issued) = engine_with_token().await;

    // Both contenders pass the lookup, then queue behind a slow JWKS
    // recomputation, so both reach the compare-and-swap holding version 0.
    engine.jwks.invalidate();
    engine.keys.set_delay(Some(Duration::from_millis(50)));

    let token = issued.refresh_token.as_str().to_owned();
    let a = {
        let exchange = Arc::clone(&engine.exchange);
        let token = token.clone();
        tokio::spawn(async move { exchange.redeem(&token).await })
    };
    let b = {
        let exchange = Arc::clone(&engine.exchange);
        tokio::spawn(async move { exchange.redeem(&token).await })
    };
    let results = [a.await.expect("task a"), b.await.expect("task b")];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts =
        results.iter().filter(|r| matches!(r, Err(AuthError::ConcurrentRedemption))).count();
    assert_eq!(winners, 1, "results: {results:?}");
    assert_eq!(conflicts, 1, "results: {results:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_racing_redemptions_exactly_one_winner() {
    let (engine, issued) = engine_with_token().await;
    let token = issued.refresh_token.as_str().to_owned();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let exchange = Arc::clone(&engine.exchange);
            let token = token.clone();
            tokio::spawn(async move { exchange.redeem(&token).await })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.expect("task") {
            Ok(tokens) => winners.push(tokens),
            Err(AuthError::ConcurrentRedemption | AuthError::NotFoundOrExpired) => {},
            Err(other) => panic!("unexpected loser outcome: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);

    // The winner's new refresh token is live and redeemable.
    let next = engine.exchange.redeem(&winners[0].refresh_token).await;
    assert!(next.is_ok(), "{next:?}");
}

#[tokio::test]
async fn redeemed_row_is_versioned_and_never_redeemable_again() {
    let (engine, issued) = engine_with_token().await;
    let before = engine
        .tokens
        .find_refresh_by_jti_not_expired(&issued.refresh_jti, engine.clock.now())
        .await
        .expect("lookup")
        .expect("row");

    engine.exchange.redeem(&issued.refresh_token).await.expect("first redemption");

    let after = engine.tokens.get_refresh_token(before.uuid).await.expect("get").expect("row");
    assert_eq!(after.version_no, before.version_no + 1);
    assert!(after.redeemed_on.is_some());

    for _ in 0..3 {
        let replay = engine.exchange.redeem(&issued.refresh_token).await;
        assert_auth_error!(replay, NotFoundOrExpired);
    }
}
