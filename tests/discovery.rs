mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::MockCentral;
use pulseox_rs::discovery::{all_advertisements, match_address, start_discovery};
use tokio_util::sync::CancellationToken;

fn addresses(advs: &[pulseox_rs::types::Advertisement]) -> Vec<String> {
    advs.iter().filter_map(|a| a.address.clone()).collect()
}

#[tokio::test]
async fn repeated_addresses_are_reported_once() {
    let mock = MockCentral::advertising(&["A", "B", "A", "C", "A"]);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(results.next().await.unwrap());
    }
    cancel.cancel();
    while let Some(adv) = results.next().await {
        seen.push(adv);
    }

    assert_eq!(addresses(&seen), ["A", "B", "C"]);
    assert!(results.err().is_none());
    assert!(results.wait_closed().await.is_none());
    assert_eq!(MockCentral::count(&mock.stop_scans), 1);
}

#[tokio::test]
async fn filter_verdict_is_cached_per_address() {
    let mock = MockCentral::advertising(&["noise", common::TARGET, "noise", common::TARGET]);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), match_address(common::TARGET), cancel.clone());

    let found = results.next().await.unwrap();
    assert_eq!(found.address.as_deref(), Some(common::TARGET));
    cancel.cancel();
    assert!(results.next().await.is_none());
}

#[tokio::test]
async fn advertisements_without_address_are_ignored() {
    let mock = MockCentral::advertising(&[]);
    mock.adverts
        .lock()
        .unwrap()
        .extend([Default::default(), pulseox_rs::types::Advertisement::with_address("X")]);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());

    assert_eq!(results.next().await.unwrap().address.as_deref(), Some("X"));
    cancel.cancel();
    assert!(results.next().await.is_none());
}

// The mock delivers every advertisement synchronously from inside `scan`
// before the consumer task first runs, so the queue (10 slots) is full when
// the eleventh arrives.
#[tokio::test]
async fn advertisement_beyond_queue_capacity_is_dropped() {
    let names: Vec<String> = (0..11).map(|i| format!("dev-{i:02}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let mock = MockCentral::advertising(&refs);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());

    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(results.next().await.unwrap());
    }
    cancel.cancel();
    while let Some(adv) = results.next().await {
        seen.push(adv);
    }

    assert_eq!(addresses(&seen), names[..10]);
}

#[tokio::test]
async fn scan_start_failure_is_reported_and_closes_results() {
    let mock = MockCentral::advertising(&["A"]);
    mock.fail_scan.store(true, Ordering::SeqCst);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());

    assert!(results.next().await.is_none());
    assert!(results.err().unwrap().to_string().contains("radio busy"));
    results.wait_closed().await;
    assert!(results.advertisements.recv().await.is_none());
    assert_eq!(MockCentral::count(&mock.stop_scans), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failure_and_cancel_tear_down_once() {
    for _ in 0..100 {
        let mock = MockCentral::advertising(&["A"]);
        mock.fail_scan.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let mut results =
            start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());
        cancel.cancel();

        results.wait_closed().await;
        while results.advertisements.recv().await.is_some() {}
        assert_eq!(MockCentral::count(&mock.stop_scans), 1);
    }
}

#[tokio::test]
async fn dropping_results_stops_the_scan() {
    let mock = MockCentral::advertising(&["A", "B"]);
    let cancel = CancellationToken::new();
    let mut results = start_discovery(Arc::clone(&mock), all_advertisements(), cancel.clone());
    assert!(results.next().await.is_some());
    let mut errors = std::mem::replace(&mut results.errors, tokio::sync::mpsc::channel(1).1);
    drop(results);

    // The consumer notices on its next send; teardown then closes `errors`.
    while errors.recv().await.is_some() {}
    assert_eq!(MockCentral::count(&mock.stop_scans), 1);
}
