//! Execution task lifecycle: completion polling, retries, cancellation.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ferry::error::PoolError;
use ferry::ssh::task::ExecTask;

use crate::fixtures::*;

fn quick_task(command: &str) -> ExecTask<MockAuthenticator> {
    ExecTask::new(command).with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn task_runs_to_completion_and_reports_exit_status() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.channel_hold_polls.store(2, Ordering::SeqCst);
    authenticator.behavior.exit_status.store(0, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("uptime").with_completion(handler));

    task.clone().run(&test_key(), &pool).await.unwrap();

    assert!(wait_until(500, || !outcomes.lock().is_empty()).await);
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].exit_status, Some(0));
    assert!(outcomes[0].failure.is_none());
    assert_eq!(outcomes[0].stdout, b"uptime");
    assert_eq!(task.exit_status(), Some(0));
}

#[tokio::test]
async fn task_releases_its_session_on_completion() {
    let (_authenticator, pool) = mock_pool(&test_settings());
    let key = test_key();

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("true").with_completion(handler));
    task.clone().run(&key, &pool).await.unwrap();

    assert!(wait_until(500, || !outcomes.lock().is_empty()).await);
    // The channel claim is given back; the session itself stays warm.
    assert_eq!(pool.active_channels(&key).await, 1);
    assert_eq!(pool.live_sessions(), 1);
}

#[tokio::test]
async fn task_input_reaches_the_channel() {
    let (_authenticator, pool) = mock_pool(&test_settings());

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(
        quick_task("cat")
            .with_input(b"payload".to_vec())
            .with_completion(handler),
    );
    task.clone().run(&test_key(), &pool).await.unwrap();

    assert!(wait_until(500, || !outcomes.lock().is_empty()).await);
    // The mock channel echoes stdin on stderr.
    assert_eq!(outcomes.lock()[0].stderr, b"payload");
}

#[tokio::test]
async fn exit_status_is_unset_before_completion() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.channel_hold_polls.store(50, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("sleep 5").with_completion(handler));
    task.clone().run(&test_key(), &pool).await.unwrap();

    assert!(task.exit_status().is_none());
    assert!(outcomes.lock().is_empty());

    task.cancel().await;
}

#[tokio::test]
async fn channel_open_race_is_retried_in_place() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.open_races.store(2, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("true").with_completion(handler));
    task.clone().run(&test_key(), &pool).await.unwrap();

    assert!(wait_until(500, || !outcomes.lock().is_empty()).await);
    assert!(outcomes.lock()[0].failure.is_none());
    assert_eq!(task.failure_count(), 2);
    assert_eq!(authenticator.stats.channels_opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn channel_open_race_gives_up_after_the_retry_budget() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.open_races.store(10, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("true").with_completion(handler));
    task.clone().run(&test_key(), &pool).await.unwrap();

    assert!(wait_until(500, || !outcomes.lock().is_empty()).await);
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].failure,
        Some(PoolError::ChannelOpenRace)
    ));
    // Initial attempt plus three retries.
    assert_eq!(task.failure_count(), 4);
    assert_eq!(authenticator.stats.channels_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connection_failure_is_delivered_through_the_callback() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.connect_failures.store(1, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("true").with_completion(handler));
    let result = task.clone().run(&test_key(), &pool).await;

    assert!(result.is_ok());
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0].failure,
        Some(PoolError::AuthenticationFailed(_))
    ));
}

#[tokio::test]
async fn cancel_finalizes_exactly_once() {
    let (authenticator, pool) = mock_pool(&test_settings());
    authenticator.behavior.channel_hold_polls.store(1000, Ordering::SeqCst);

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("sleep 600").with_completion(handler));
    task.clone().run(&test_key(), &pool).await.unwrap();

    // Cancel twice, racing whatever completion check is in flight.
    task.cancel().await;
    task.cancel().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].failure, Some(PoolError::Cancelled)));

    // The session went back to the cache despite the cancellation.
    assert_eq!(pool.active_channels(&test_key()).await, 1);
}

#[tokio::test]
async fn cancel_before_run_skips_the_session_entirely() {
    let (authenticator, pool) = mock_pool(&test_settings());

    let (handler, outcomes) = capture_outcomes();
    let task = Arc::new(quick_task("true").with_completion(handler));

    task.cancel().await;
    task.clone().run(&test_key(), &pool).await.unwrap();

    let outcomes = outcomes.lock();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].failure, Some(PoolError::Cancelled)));
    assert_eq!(authenticator.stats.sessions_created.load(Ordering::SeqCst), 0);
}
