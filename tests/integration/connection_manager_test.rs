//! Integration tests for the connection manager against a mock transport.

use crate::sensor_mock::{states_until, MockTransport};
use rustcadence::sensors::manager::{ConnectionManager, SessionConfig};
use rustcadence::sensors::retry::RetryPolicy;
use rustcadence::sensors::types::ConnectionState::{self, *};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

fn config_with_connect_policy(max_attempts: u32, initial_delay_secs: u64) -> SessionConfig {
    SessionConfig {
        connect_policy: RetryPolicy::new(max_attempts, Duration::from_secs(initial_delay_secs)),
        ..SessionConfig::default()
    }
}

async fn connected_session() -> (Arc<MockTransport>, ConnectionManager) {
    let mock = Arc::new(MockTransport::new());
    let manager = ConnectionManager::spawn_shared(mock.clone(), SessionConfig::default());
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    states_until(&mut updates, Connected).await;
    (mock, manager)
}

async fn wait_for_rpm(manager: &ConnectionManager, rpm: f64) {
    let mut watch = manager.watch();
    tokio::time::timeout(
        Duration::from_secs(60),
        watch.wait_for(|u| u.cadence.and_then(|c| c.value()) == Some(rpm)),
    )
    .await
    .expect("timed out waiting for cadence")
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_connect_walks_through_subscribing() {
    let mock = Arc::new(MockTransport::new());
    let manager = ConnectionManager::spawn_shared(mock.clone(), SessionConfig::default());
    let mut updates = manager.subscribe();
    assert_eq!(manager.state(), Disconnected);

    manager.connect().unwrap();

    assert_eq!(
        states_until(&mut updates, Connected).await,
        vec![Connecting, Subscribing, Connected]
    );
    let calls = mock.calls();
    assert_eq!(calls.request_device, 1);
    assert_eq!(calls.connect, 1);
    assert_eq!(calls.start_notifications, 1);
}

#[tokio::test(start_paused = true)]
async fn test_notifications_produce_cadence() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();

    mock.notify_crank(0, 0);
    mock.notify_crank(1, 1024);
    wait_for_rpm(&manager, 60.0).await;
    assert_eq!(manager.cadence().unwrap().to_string(), "60.0 rpm");

    // Duplicate and malformed payloads change nothing
    mock.notify_crank(1, 1024);
    mock.notify(vec![0x02, 0x01]);
    mock.notify(Vec::new());
    mock.notify_crank(2, 1536);
    wait_for_rpm(&manager, 120.0).await;

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update.cadence.and_then(|c| c.value()));
    }
    assert_eq!(seen, vec![Some(60.0), Some(120.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_recovers_to_connected() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();

    mock.notify_crank(0, 0);
    mock.notify_crank(1, 1024);
    wait_for_rpm(&manager, 60.0).await;

    mock.drop_link();

    // The cadence clears before the state moves
    let mut states = states_until(&mut updates, Reconnecting).await;
    states.extend(states_until(&mut updates, Connected).await);
    assert_eq!(
        states,
        vec![Connected, Reconnecting, Connecting, Subscribing, Connected]
    );
    // Cadence starts over on the new link
    assert_eq!(manager.cadence(), None);

    let calls = mock.calls();
    assert_eq!(calls.request_device, 1, "device is reused");
    assert_eq!(calls.connect, 2);
    assert_eq!(calls.start_notifications, 2);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_retries_with_backoff() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();

    mock.fail_connects(2);
    let started = tokio::time::Instant::now();
    mock.drop_link();

    assert_eq!(
        states_until(&mut updates, Connected).await,
        vec![
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Subscribing,
            Connected
        ]
    );
    // Waits of 2 s and 4 s between the three attempts
    assert_eq!(started.elapsed(), Duration::from_secs(6));
    assert_eq!(mock.calls().connect, 4);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_connect_fails() {
    let mock = Arc::new(MockTransport::new());
    mock.fail_connects(u32::MAX);
    let manager = ConnectionManager::spawn_shared(mock.clone(), config_with_connect_policy(2, 1));
    let mut updates = manager.subscribe();

    manager.connect().unwrap();

    assert_eq!(
        states_until(&mut updates, Failed).await,
        vec![Connecting, Reconnecting, Connecting, Reconnecting, Connecting, Failed]
    );
    let calls = mock.calls();
    assert_eq!(calls.connect, 3);
    // No link ever came up, so there is nothing to disconnect
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.release_device, 1);
    assert_eq!(manager.cadence(), None);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_failure_rediscovers() {
    let mock = Arc::new(MockTransport::new());
    mock.fail_connects(1);
    let manager = ConnectionManager::spawn_shared(mock.clone(), config_with_connect_policy(0, 1));
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    states_until(&mut updates, Failed).await;

    manager.connect().unwrap();
    assert_eq!(
        states_until(&mut updates, Connected).await,
        vec![Connecting, Subscribing, Connected]
    );
    assert_eq!(mock.calls().request_device, 2);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_fails_without_connecting() {
    let mock = Arc::new(MockTransport::new());
    mock.hide_device();
    let manager = ConnectionManager::spawn_shared(mock.clone(), SessionConfig::default());
    let mut updates = manager.subscribe();

    manager.connect().unwrap();

    assert_eq!(states_until(&mut updates, Failed).await, vec![Connecting, Failed]);
    assert_eq!(mock.calls().connect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_releases_link_and_retries() {
    let mock = Arc::new(MockTransport::new());
    mock.fail_subscribes(1);
    let manager = ConnectionManager::spawn_shared(mock.clone(), SessionConfig::default());
    let mut updates = manager.subscribe();

    manager.connect().unwrap();

    assert_eq!(
        states_until(&mut updates, Connected).await,
        vec![Connecting, Subscribing, Reconnecting, Connecting, Subscribing, Connected]
    );
    let calls = mock.calls();
    assert_eq!(calls.connect, 2);
    assert_eq!(calls.disconnect, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_retry() {
    let mock = Arc::new(MockTransport::new());
    mock.fail_connects(u32::MAX);
    let manager = ConnectionManager::spawn_shared(mock.clone(), config_with_connect_policy(3, 2));
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    states_until(&mut updates, Reconnecting).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), Disconnected);
    assert_eq!(states_until(&mut updates, Disconnected).await, vec![Disconnected]);

    // Well past every backoff delay: nothing fires
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(mock.calls().connect, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (mock, manager) = connected_session().await;

    manager.disconnect().await;
    manager.disconnect().await;

    assert_eq!(manager.state(), Disconnected);
    let calls = mock.calls();
    assert_eq!(calls.stop_notifications, 1);
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.release_device, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_failure_does_not_stop_teardown() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();
    mock.fail_unsubscribes(u32::MAX);

    manager.disconnect().await;

    assert_eq!(manager.state(), Disconnected);
    assert_eq!(states_until(&mut updates, Disconnected).await, vec![Disconnected]);
    let calls = mock.calls();
    assert_eq!(calls.stop_notifications, 1);
    assert_eq!(calls.disconnect, 1);
    assert_eq!(calls.release_device, 1);

    manager.disconnect().await;
    assert_eq!(mock.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_recovery_fails_with_fixed_policy() {
    let mock = Arc::new(MockTransport::new());
    // The connect policy must not leak into recovery
    let manager = ConnectionManager::spawn_shared(mock.clone(), config_with_connect_policy(9, 1));
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    states_until(&mut updates, Connected).await;

    mock.fail_connects(u32::MAX);
    let started = tokio::time::Instant::now();
    mock.drop_link();

    assert_eq!(
        states_until(&mut updates, Failed).await,
        vec![
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Reconnecting,
            Connecting,
            Failed
        ]
    );
    // Immediate first try, then waits of 2, 4 and 8 seconds
    assert_eq!(started.elapsed(), Duration::from_secs(14));
    let calls = mock.calls();
    assert_eq!(calls.connect, 5);
    assert_eq!(calls.disconnect, 0);
    assert_eq!(calls.release_device, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_recovery() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();

    mock.fail_connects(u32::MAX);
    mock.drop_link();
    // First recovery attempt failed, now waiting out the 2 s backoff
    states_until(&mut updates, Reconnecting).await;
    states_until(&mut updates, Connecting).await;
    states_until(&mut updates, Reconnecting).await;

    manager.disconnect().await;
    assert_eq!(states_until(&mut updates, Disconnected).await, vec![Disconnected]);

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(manager.state(), Disconnected);
    assert_eq!(mock.calls().connect, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_subscribes_release_each_link_once() {
    let mock = Arc::new(MockTransport::new());
    mock.fail_subscribes(u32::MAX);
    let manager = ConnectionManager::spawn_shared(mock.clone(), config_with_connect_policy(2, 1));
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    states_until(&mut updates, Failed).await;

    let calls = mock.calls();
    assert_eq!(calls.connect, 3);
    assert_eq!(calls.start_notifications, 3);
    // One disconnect per failed attempt, none left for teardown
    assert_eq!(calls.disconnect, 3);
    assert_eq!(calls.release_device, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_when_idle_is_noop() {
    let mock = Arc::new(MockTransport::new());
    let manager = ConnectionManager::spawn_shared(mock.clone(), SessionConfig::default());
    let mut updates = manager.subscribe();

    manager.disconnect().await;

    assert_eq!(manager.state(), Disconnected);
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(mock.calls().disconnect, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_ignored() {
    let (mock, manager) = connected_session().await;
    let mut updates = manager.subscribe();

    manager.connect().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(manager.state(), Connected);
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(mock.calls().connect, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_tears_down() {
    let (mock, manager) = connected_session().await;

    manager.shutdown().await;

    let calls = mock.calls();
    assert_eq!(calls.stop_notifications, 1);
    assert_eq!(calls.disconnect, 1);
}

#[test]
fn test_state_display() {
    assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting...");
}
