use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::sync::remote::RemoteStore;
use crate::sync::runtime::orchestrator::SyncEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RefreshRequest {
    show_loading: bool,
    force: bool,
}

impl RefreshRequest {
    fn merge(&mut self, other: RefreshRequest) {
        self.show_loading |= other.show_loading;
        self.force |= other.force;
    }
}

/// Handle to a background refresh loop.
///
/// Requests are debounced, throttled and collapsed before they reach
/// [`SyncEngine::refresh`]. Dropping the handle stops the loop.
pub struct RefreshHandle {
    tx: mpsc::UnboundedSender<RefreshRequest>,
    task: JoinHandle<()>,
    runs: Arc<AtomicU64>,
}

impl RefreshHandle {
    /// Asks for a refresh. Never blocks; the loop decides whether it runs.
    pub fn request(&self, show_loading: bool, force: bool) {
        let _ = self.tx.send(RefreshRequest {
            show_loading,
            force,
        });
    }

    /// Number of refreshes the loop has started.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<S: RemoteStore> SyncEngine<S> {
    /// Starts the refresh loop on the current runtime.
    pub fn spawn_refresh_scheduler(&self) -> RefreshHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let runs = Arc::new(AtomicU64::new(0));
        let driver = RefreshDriver {
            engine: self.clone(),
            rx,
            runs: runs.clone(),
            last_run: None,
        };
        let task = tokio::spawn(driver.run());
        RefreshHandle { tx, task, runs }
    }
}

struct RefreshDriver<S> {
    engine: SyncEngine<S>,
    rx: mpsc::UnboundedReceiver<RefreshRequest>,
    runs: Arc<AtomicU64>,
    last_run: Option<Instant>,
}

impl<S: RemoteStore> RefreshDriver<S> {
    async fn run(mut self) {
        log::debug!("[SCHEDULER] starting");
        while let Some(first) = self.rx.recv().await {
            let Some(mut request) = self.debounce(first).await else {
                break;
            };

            if !request.force && self.in_throttle_window() {
                log::debug!("[SCHEDULER] throttled, dropping {:?}", request);
                continue;
            }

            // Whatever arrives during a run is replayed once after it.
            loop {
                self.execute(request).await;
                match self.drain() {
                    Some(queued) => {
                        log::debug!("[SCHEDULER] replaying queued {:?}", queued);
                        request = queued;
                    }
                    None => break,
                }
            }
        }
        log::debug!("[SCHEDULER] stopped");
    }

    /// Waits until no request has arrived for the debounce interval. Returns
    /// `None` if the channel closed meanwhile.
    async fn debounce(&mut self, first: RefreshRequest) -> Option<RefreshRequest> {
        let window = self.engine.config().refresh_debounce();
        let mut request = first;
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(r) => request.merge(r),
                    None => return None,
                },
                _ = sleep(window) => return Some(request),
            }
        }
    }

    fn in_throttle_window(&self) -> bool {
        let window = self.engine.config().refresh_throttle();
        self.last_run
            .map(|t| Instant::now().saturating_duration_since(t) < window)
            .unwrap_or(false)
    }

    fn drain(&mut self) -> Option<RefreshRequest> {
        let mut queued: Option<RefreshRequest> = None;
        while let Ok(r) = self.rx.try_recv() {
            queued.get_or_insert_with(RefreshRequest::default).merge(r);
        }
        queued
    }

    async fn execute(&mut self, request: RefreshRequest) {
        // A non-forced refresh would be dropped by the fetch throttle.
        if !request.force {
            self.engine.wait_for_fetch_slot().await;
        }
        self.last_run = Some(Instant::now());
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("[SCHEDULER] run #{} {:?}", n, request);
        self.engine
            .refresh(request.show_loading, request.force)
            .await;
    }
}
