//! Scan → dedup → filter pipeline.
//!
//! ```text
//!  BleCentral::scan ──try_send──▶ [queue: 10] ──▶ dedup consumer ──▶ results
//!       (producer task)            drops when full   (owns the cache)
//! ```
//!
//! Each address is evaluated against the filter at most once per discovery
//! session; the verdict is cached and repeat advertisements are ignored
//! whatever the filter would say now.  Teardown (stop the scan, close the
//! queue and the error channel) runs exactly once, whether it is triggered by
//! cancellation, by the consumer finishing, or by a scan-start failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::central::BleCentral;
use crate::error::BleError;
use crate::protocol::{SCAN_QUEUE_CAPACITY, SCAN_RESULTS_CAPACITY};
use crate::types::Advertisement;

/// Decides whether an advertisement is of interest.
pub type AdvertisementFilter = Arc<dyn Fn(&Advertisement) -> bool + Send + Sync>;

/// Filter accepting every advertisement with an address.
pub fn all_advertisements() -> AdvertisementFilter {
    Arc::new(|_| true)
}

/// Filter accepting only `address` (MAC comparison ignores case).
pub fn match_address(address: impl Into<String>) -> AdvertisementFilter {
    let address = address.into();
    Arc::new(move |adv: &Advertisement| {
        adv.address
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(&address))
    })
}

// ── ScanResults ───────────────────────────────────────────────────────────────

/// Output of one discovery session.
///
/// Matching advertisements arrive on `advertisements` in first-seen order;
/// scan failures arrive on `errors`.  Both channels close when the session
/// ends.
pub struct ScanResults {
    pub advertisements: mpsc::Receiver<Advertisement>,
    pub errors: mpsc::Receiver<BleError>,
    err: Option<BleError>,
}

impl ScanResults {
    /// Wait for the next match.
    ///
    /// Returns `None` when the session has ended or reported an error; the
    /// error, if any, is then available from [`ScanResults::err`].
    pub async fn next(&mut self) -> Option<Advertisement> {
        if self.err.is_some() {
            return None;
        }
        tokio::select! {
            biased;
            Some(err) = self.errors.recv() => {
                self.err = Some(err);
                None
            }
            adv = self.advertisements.recv() => adv,
        }
    }

    /// The error that ended [`ScanResults::next`], if any.
    pub fn err(&self) -> Option<&BleError> {
        self.err.as_ref()
    }

    pub fn take_err(&mut self) -> Option<BleError> {
        self.err.take()
    }

    /// Wait until the session's teardown has completed, i.e. the scan has
    /// been stopped.  Returns any error reported on the way (typically a
    /// failed `stop_scan`).
    pub async fn wait_closed(&mut self) -> Option<BleError> {
        let mut last = None;
        while let Some(err) = self.errors.recv().await {
            last = Some(err);
        }
        last
    }
}

// ── Teardown ──────────────────────────────────────────────────────────────────

/// Run-once teardown shared by the producer and consumer tasks.
struct ScanTeardown<C> {
    central: Arc<C>,
    done: AtomicBool,
    queue: Mutex<Option<mpsc::Sender<Advertisement>>>,
    errors: Mutex<Option<mpsc::Sender<BleError>>>,
}

impl<C: BleCentral> ScanTeardown<C> {
    fn report(&self, err: BleError) {
        let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = errors.as_ref() {
            if tx.try_send(err).is_err() {
                debug!("discovery: error channel full or closed");
            }
        }
    }

    /// Offer an advertisement to the queue without waiting.
    fn offer(&self, adv: Advertisement) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = queue.as_ref() {
            if tx.try_send(adv).is_err() {
                debug!("discovery: queue full, advertisement dropped");
            }
        }
    }

    async fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("discovery: tearing down");
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(e) = self.central.stop_scan().await {
            warn!("discovery: stop_scan failed: {e}");
            self.report(e);
        }
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// Start a discovery session.
///
/// The session runs until `cancel` fires, the scan fails, or the
/// [`ScanResults`] is dropped.
pub fn start_discovery<C: BleCentral>(
    central: Arc<C>,
    filter: AdvertisementFilter,
    cancel: CancellationToken,
) -> ScanResults {
    let (queue_tx, mut queue_rx) = mpsc::channel::<Advertisement>(SCAN_QUEUE_CAPACITY);
    let (results_tx, results_rx) = mpsc::channel(SCAN_RESULTS_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::channel(2);

    let teardown = Arc::new(ScanTeardown {
        central: Arc::clone(&central),
        done: AtomicBool::new(false),
        queue: Mutex::new(Some(queue_tx)),
        errors: Mutex::new(Some(errors_tx)),
    });

    // ── Producer: drive the collaborator's scan ──────────────────────────────
    {
        let teardown = Arc::clone(&teardown);
        tokio::spawn(async move {
            let offer = Arc::clone(&teardown);
            let on_advertisement = Box::new(move |adv: Advertisement| offer.offer(adv));
            if let Err(e) = central.scan(on_advertisement).await {
                warn!("discovery: unable to initiate BLE scan: {e}");
                teardown.report(e);
                teardown.run().await;
            }
        });
    }

    // ── Consumer: dedup + filter ─────────────────────────────────────────────
    tokio::spawn(async move {
        let mut cache: HashMap<String, bool> = HashMap::new();

        loop {
            let adv = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = results_tx.closed() => break,
                adv = queue_rx.recv() => match adv {
                    Some(adv) => adv,
                    None => break,
                },
            };

            let Some(address) = adv.address.clone() else {
                continue;
            };
            if cache.contains_key(&address) {
                continue;
            }
            let matched = filter(&adv);
            debug!("discovery: {address} evaluated, matched={matched}");
            cache.insert(address.clone(), matched);
            if !matched {
                continue;
            }

            info!("discovery: found {address}");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = results_tx.send(adv) => sent,
            };
            if sent.is_err() {
                break;
            }
        }

        debug!("discovery: {} address(es) evaluated", cache.len());
        drop(results_tx);
        teardown.run().await;
    });

    ScanResults {
        advertisements: results_rx,
        errors: errors_rx,
        err: None,
    }
}
