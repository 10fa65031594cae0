//! Abortable fetch bookkeeping.
//!
//! One cancellation token is live at a time. Creating a new one cancels the
//! previous, so a superseded fetch stops at its next suspension point.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RequestState {
    current: Option<CancellationToken>,
    tracked: HashSet<u64>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct RequestManager {
    state: Mutex<RequestState>,
}

/// Removes a tracked request when its future settles or is dropped.
struct TrackGuard<'a> {
    manager: &'a RequestManager,
    id: u64,
}

impl Drop for TrackGuard<'_> {
    fn drop(&mut self) {
        let mut s = self.manager.state.lock().unwrap();
        s.tracked.remove(&self.id);
    }
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the current token (if any) and installs a fresh one.
    pub fn create_abort_controller(&self) -> CancellationToken {
        let mut s = self.state.lock().unwrap();
        if let Some(previous) = s.current.take() {
            log::trace!("[REQUESTS] superseding previous controller");
            previous.cancel();
        }
        let token = CancellationToken::new();
        s.current = Some(token.clone());
        token
    }

    /// Cancels the current token and forgets every tracked request.
    /// Safe to call with nothing pending.
    pub fn cancel_pending_requests(&self) {
        let mut s = self.state.lock().unwrap();
        if let Some(token) = s.current.take() {
            token.cancel();
        }
        if !s.tracked.is_empty() {
            log::debug!("[REQUESTS] cancelling {} tracked request(s)", s.tracked.len());
            s.tracked.clear();
        }
    }

    /// Runs `fut` under the current controller.
    ///
    /// Resolves to `None` if the controller is cancelled first. The request is
    /// counted in [`pending_count`](Self::pending_count) until it settles.
    pub async fn track_promise<F: Future>(&self, fut: F) -> Option<F::Output> {
        let (id, token) = {
            let mut s = self.state.lock().unwrap();
            let id = s.next_id;
            s.next_id += 1;
            s.tracked.insert(id);
            let token = s.current.get_or_insert_with(CancellationToken::new).clone();
            (id, token)
        };
        let _guard = TrackGuard { manager: self, id };

        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().tracked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_controller_aborts_first() {
        let manager = RequestManager::new();
        let first = manager.create_abort_controller();
        let second = manager.create_abort_controller();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent() {
        let manager = RequestManager::new();
        manager.cancel_pending_requests();
        manager.cancel_pending_requests();

        let token = manager.create_abort_controller();
        manager.cancel_pending_requests();
        manager.cancel_pending_requests();
        assert!(token.is_cancelled());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn tracked_request_is_removed_on_settle() {
        let manager = RequestManager::new();
        manager.create_abort_controller();

        let out = manager.track_promise(async { 7 }).await;
        assert_eq!(out, Some(7));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_tracked_request() {
        let manager = Arc::new(RequestManager::new());
        manager.create_abort_controller();

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .track_promise(tokio::time::sleep(Duration::from_secs(60)))
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert_eq!(manager.pending_count(), 1);

        manager.cancel_pending_requests();
        assert_eq!(task.await.unwrap(), None);
        assert_eq!(manager.pending_count(), 0);
    }
}
