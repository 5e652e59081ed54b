mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockCentral, FRAME, TARGET};
use pulseox_rs::error::SessionError;
use pulseox_rs::output::ChannelSink;
use pulseox_rs::session::{AdapterPolicy, SessionState, Supervisor, SupervisorConfig};
use tokio_util::sync::CancellationToken;

fn config() -> SupervisorConfig {
    SupervisorConfig {
        target_address: TARGET.into(),
        ..SupervisorConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn inactivity_disconnects_and_rescans() {
    let mock = MockCentral::advertising(&["11:22:33:44:55:66", TARGET]);
    mock.payloads.lock().unwrap().push(FRAME.to_vec());
    let (sink, mut readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let mut states = supervisor.subscribe();
    let cancel = CancellationToken::new();

    let driver = async {
        states
            .wait_for(|s| *s == SessionState::Streaming)
            .await
            .unwrap();
        let record = readings.recv().await.unwrap();
        assert_eq!(record.device_id, TARGET);
        assert_eq!((record.pulse_rate, record.spo2, record.pleth), (72, 97, 61));

        states
            .wait_for(|s| *s == SessionState::Teardown)
            .await
            .unwrap();
        states
            .wait_for(|s| *s == SessionState::Scanning)
            .await
            .unwrap();
        assert_eq!(MockCentral::count(&mock.disconnects), 1);
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    let stats = supervisor.stats();
    assert!(stats.inactivity_timeouts >= 1);
    assert_eq!(stats.readings, 1);
    assert!(stats.scans >= 2);
    assert_eq!(supervisor.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn missing_target_rescans_after_deadline() {
    let mock = MockCentral::advertising(&["11:22:33:44:55:66"]);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let cancel = CancellationToken::new();

    let driver = async {
        // Two full 2 s deadlines plus the 1 s pause between them.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    assert!(supervisor.stats().scan_misses >= 2);
    assert_eq!(MockCentral::count(&mock.connects), 0);
    assert_eq!(
        MockCentral::count(&mock.scans),
        MockCentral::count(&mock.stop_scans)
    );
}

#[tokio::test(start_paused = true)]
async fn connect_failure_backs_off_and_rescans() {
    let mock = MockCentral::advertising(&[TARGET]);
    mock.fail_connect.store(true, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let cancel = CancellationToken::new();

    let driver = async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    let stats = supervisor.stats();
    assert!(stats.connect_failures >= 2);
    assert_eq!(stats.sessions, 0);
    assert_eq!(MockCentral::count(&mock.disconnects), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_rx_characteristic_aborts_the_session() {
    let mock = MockCentral::advertising(&[TARGET]);
    mock.missing_rx.store(true, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let cancel = CancellationToken::new();

    let driver = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    assert_eq!(supervisor.stats().sessions, 0);
    assert_eq!(supervisor.stats().connect_failures, 1);
    // The half-opened link is not left connected.
    assert_eq!(MockCentral::count(&mock.disconnects), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_link_ends_the_session() {
    let mock = MockCentral::advertising(&[TARGET]);
    mock.close_after_payloads.store(true, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let cancel = CancellationToken::new();

    let driver = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    let stats = supervisor.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.link_losses, 1);
    assert_eq!(stats.inactivity_timeouts, 0);
    assert_eq!(MockCentral::count(&mock.disconnects), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_connecting_disconnects_the_device() {
    let mock = MockCentral::advertising(&[TARGET]);
    *mock.discovery_delay.lock().unwrap() = Duration::from_secs(5);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let mut states = supervisor.subscribe();
    let cancel = CancellationToken::new();

    let driver = async {
        states
            .wait_for(|s| *s == SessionState::Connecting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    assert_eq!(MockCentral::count(&mock.connects), 1);
    assert_eq!(MockCentral::count(&mock.disconnects), 1);
    assert_eq!(supervisor.stats().sessions, 0);
    assert_eq!(supervisor.stats().connect_failures, 0);
    assert_eq!(supervisor.state(), SessionState::Idle);
}

#[tokio::test]
async fn adapter_failure_is_fatal_by_default() {
    let mock = MockCentral::advertising(&[TARGET]);
    mock.enable_failures.store(1, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());

    let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Adapter(_)));
    assert!(!err.is_recoverable());
    assert_eq!(MockCentral::count(&mock.scans), 0);
    assert_eq!(supervisor.state(), SessionState::Idle);
}

#[tokio::test]
async fn scan_failure_is_fatal_by_default() {
    let mock = MockCentral::advertising(&[TARGET]);
    mock.fail_scan.store(true, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());

    let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::Adapter(_)));
    assert_eq!(MockCentral::count(&mock.stop_scans), 1);
}

#[tokio::test(start_paused = true)]
async fn unattended_policy_retries_the_adapter() {
    let mock = MockCentral::advertising(&[]);
    mock.enable_failures.store(2, Ordering::SeqCst);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(
        Arc::clone(&mock),
        sink,
        SupervisorConfig {
            adapter_policy: AdapterPolicy::Retry,
            ..config()
        },
    );
    let mut states = supervisor.subscribe();
    let cancel = CancellationToken::new();

    let driver = async {
        states
            .wait_for(|s| *s == SessionState::Scanning)
            .await
            .unwrap();
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(supervisor.run(cancel.clone()), driver);

    result.unwrap();
    assert_eq!(MockCentral::count(&mock.enables), 3);
}

#[tokio::test]
async fn cancel_before_start_returns_immediately() {
    let mock = MockCentral::advertising(&[TARGET]);
    let (sink, _readings) = ChannelSink::channel();
    let mut supervisor = Supervisor::new(Arc::clone(&mock), sink, config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    supervisor.run(cancel).await.unwrap();
    assert_eq!(MockCentral::count(&mock.scans), 0);
    assert_eq!(MockCentral::count(&mock.connects), 0);
}
