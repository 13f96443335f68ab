//! End-to-end lookup scenarios
//!
//! Each test submits a job through the scheduler and waits for it to settle:
//! 1. Terminal rejection on the first provider, answer from the second
//! 2. Fresh cache entry short-circuits every lookup
//! 3. Forced provider and error verdicts

use crate::common::*;
use phonecheck::cache::ResultCache;
use phonecheck::models::{
    CheckStatus, FailureKind, JobState, LookupOutcome, Provider, SubmitOptions,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Provider Fallback
// ============================================================================

#[tokio::test]
async fn test_terminal_rejection_falls_through_to_next_provider() {
    let kaspersky = Arc::new(ScriptedProvider::new(Provider::Kaspersky, Step::Terminal));
    let getcontact = Arc::new(ScriptedProvider::answering(Provider::GetContact, CheckStatus::Safe));
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe));

    let harness = HarnessBuilder::new(route_domestic(
        vec![Provider::Kaspersky, Provider::GetContact],
        vec![Provider::Truecaller],
    ))
    .endpoint("kasp-01", Provider::Kaspersky)
    .endpoint("gc-01", Provider::GetContact)
    .driver(Arc::clone(&kaspersky))
    .driver(Arc::clone(&getcontact))
    .driver(Arc::clone(&truecaller))
    .build()
    .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.progress, 1.0);
    let result = &status.results[0];
    assert_eq!(result.source, Some(Provider::GetContact));
    assert_eq!(result.status, CheckStatus::Safe);
    assert_eq!(result.attempts, 1);
    assert!(!result.from_cache);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].provider, Provider::Kaspersky);
    assert_eq!(result.failures[0].kind, FailureKind::Terminal);

    assert_eq!(kaspersky.calls(), 1);
    assert_eq!(getcontact.calls(), 1);
    assert_eq!(truecaller.calls(), 0);

    harness.scheduler.shutdown().await;
    assert_eq!(harness.pool.active_leases().await, 0);
}

#[tokio::test]
async fn test_answer_is_cached_for_later_jobs() {
    let truecaller = Arc::new(ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Spam));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .build()
        .await;
    harness.scheduler.start().await;

    let first = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    harness.scheduler.wait_for(&first, WAIT).await.unwrap();

    let second = harness
        .scheduler
        .submit(&["+1 (202) 555-0108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&second, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    assert!(status.results[0].from_cache);
    assert_eq!(status.results[0].status, CheckStatus::Spam);
    assert_eq!(truecaller.calls(), 1);

    harness.scheduler.shutdown().await;
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_fresh_cache_entry_skips_lookup() {
    let kaspersky = Arc::new(ScriptedProvider::answering(Provider::Kaspersky, CheckStatus::Spam));
    let getcontact = Arc::new(ScriptedProvider::answering(Provider::GetContact, CheckStatus::Spam));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Kaspersky, Provider::GetContact]))
        .endpoint("kasp-01", Provider::Kaspersky)
        .endpoint("gc-01", Provider::GetContact)
        .driver(Arc::clone(&kaspersky))
        .driver(Arc::clone(&getcontact))
        .build()
        .await;

    harness
        .cache
        .put(
            &number("+79990000000"),
            Provider::Kaspersky,
            &LookupOutcome::new(CheckStatus::Safe).with_details("cached verdict"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.state, JobState::Completed);
    let result = &status.results[0];
    assert!(result.from_cache);
    assert_eq!(result.status, CheckStatus::Safe);
    assert_eq!(result.source, Some(Provider::Kaspersky));
    assert_eq!(result.details.as_deref(), Some("cached verdict"));

    assert_eq!(kaspersky.calls(), 0);
    assert_eq!(getcontact.calls(), 0);
    assert_eq!(harness.cache.stats().hits, 1);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_use_cache_false_forces_lookup() {
    let kaspersky = Arc::new(ScriptedProvider::answering(Provider::Kaspersky, CheckStatus::Spam));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Kaspersky]))
        .endpoint("kasp-01", Provider::Kaspersky)
        .driver(Arc::clone(&kaspersky))
        .build()
        .await;

    harness
        .cache
        .put(
            &number("+79990000000"),
            Provider::Kaspersky,
            &LookupOutcome::new(CheckStatus::Safe),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    harness.scheduler.start().await;

    let options = SubmitOptions {
        use_cache: false,
        forced_provider: None,
    };
    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], options)
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.results[0].status, CheckStatus::Spam);
    assert!(!status.results[0].from_cache);
    assert_eq!(kaspersky.calls(), 1);

    // The fresh answer replaced the cached one
    let cached = harness
        .cache
        .get(&number("+79990000000"), Provider::Kaspersky)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.status, CheckStatus::Spam);

    harness.scheduler.shutdown().await;
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_forced_provider_overrides_routing() {
    let kaspersky = Arc::new(ScriptedProvider::answering(Provider::Kaspersky, CheckStatus::Safe));
    let tbank = Arc::new(ScriptedProvider::answering(Provider::Tbank, CheckStatus::NotInDatabase));
    let harness = HarnessBuilder::new(route_all(vec![Provider::Kaspersky]))
        .endpoint("kasp-01", Provider::Kaspersky)
        .endpoint("tbank-01", Provider::Tbank)
        .driver(Arc::clone(&kaspersky))
        .driver(Arc::clone(&tbank))
        .build()
        .await;
    harness.scheduler.start().await;

    let options = SubmitOptions {
        use_cache: true,
        forced_provider: Some(Provider::Tbank),
    };
    let job_id = harness
        .scheduler
        .submit(&["+79990000000"], options)
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    assert_eq!(status.results[0].source, Some(Provider::Tbank));
    assert_eq!(status.results[0].status, CheckStatus::NotInDatabase);
    assert_eq!(kaspersky.calls(), 0);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_error_verdict_is_retried() {
    let truecaller = Arc::new(
        ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe)
            .then(Step::Answer(CheckStatus::Error)),
    );
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .build()
        .await;
    harness.scheduler.start().await;

    let job_id = harness
        .scheduler
        .submit(&["+12025550108"], SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let result = &status.results[0];
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(result.status, CheckStatus::Safe);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].kind, FailureKind::Transient);
    assert_eq!(truecaller.calls(), 2);

    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_results_keep_submission_order() {
    let truecaller = Arc::new(
        ScriptedProvider::answering(Provider::Truecaller, CheckStatus::Safe)
            .with_delay(Duration::from_millis(5)),
    );
    let harness = HarnessBuilder::new(route_all(vec![Provider::Truecaller]))
        .endpoint("tc-01", Provider::Truecaller)
        .endpoint("tc-02", Provider::Truecaller)
        .driver(Arc::clone(&truecaller))
        .build()
        .await;
    harness.scheduler.start().await;

    let raw = ["+12025550101", "+12025550102", "+12025550103", "+12025550104"];
    let job_id = harness
        .scheduler
        .submit(&raw, SubmitOptions::default())
        .await
        .unwrap();
    let status = harness.scheduler.wait_for(&job_id, WAIT).await.unwrap();

    let numbers: Vec<&str> = status.results.iter().map(|r| r.number.as_str()).collect();
    assert_eq!(numbers, raw);
    assert_eq!(truecaller.overlaps(), 0);

    harness.scheduler.shutdown().await;
}
