use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncResult};
use crate::model::{HabitId, Snapshot, UserId};
use crate::sync::cache::SnapshotCache;
use crate::sync::ledger::{ActionKey, FetchOutcome, HabitState, OptimisticLedger, Reconciled};
use crate::sync::remote::RemoteStore;
use crate::sync::requests::RequestManager;
use crate::sync::retry::{ReadFailure, RetryPolicy};
use crate::sync::throttle::ThrottleGate;
use crate::sync::version::VersionCounter;

/// Supplies the local calendar date considered "today".
pub type TodayFn = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub(crate) type SharedAction = Shared<BoxFuture<'static, SyncResult<()>>>;

/// **SyncEngine**
///
/// The imperative shell around [`OptimisticLedger`]. It performs every
/// network call against the [`RemoteStore`], decides when to use the cache,
/// throttles and cancels fetches, and publishes each new [`HabitState`]
/// through a watch channel.
///
/// Cheap to clone; all clones share one session.
pub struct SyncEngine<S> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for SyncEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct Inner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) config: SyncConfig,
    retry: RetryPolicy,
    today: TodayFn,

    user: Mutex<Option<UserId>>,
    /// Bumped on every user change so late mutation results from the old
    /// session leave the new one alone.
    pub(crate) session_epoch: AtomicU64,

    ledger: Mutex<OptimisticLedger>,
    state_tx: watch::Sender<Arc<HabitState>>,

    pub(crate) cache: Mutex<SnapshotCache>,
    throttle: Mutex<ThrottleGate>,
    /// Signalled whenever a fetch finishes, however it finishes.
    fetch_done: Notify,
    pub(crate) requests: RequestManager,
    versions: VersionCounter,

    /// In-flight mutations, keyed per habit and action kind.
    pub(crate) inflight: Mutex<HashMap<ActionKey, SharedAction>>,
    /// Sequence number of the most recent action per habit.
    pub(crate) latest_action: Mutex<HashMap<HabitId, u64>>,
    pub(crate) action_seq: AtomicU64,
    pub(crate) local_ids: AtomicU64,
}

/// Marks the fetch throttle completed on every exit path.
struct FetchGuard<'a> {
    throttle: &'a Mutex<ThrottleGate>,
    done: &'a Notify,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.throttle.lock().unwrap().mark_completed();
        self.done.notify_waiters();
    }
}

impl<S: RemoteStore> SyncEngine<S> {
    /// Engine with no signed-in user, using the local clock for "today".
    pub fn new(store: Arc<S>, config: SyncConfig) -> Self {
        Self::with_today(store, config, Arc::new(|| chrono::Local::now().date_naive()))
    }

    pub fn with_today(store: Arc<S>, config: SyncConfig, today: TodayFn) -> Self {
        let date = today();
        let mut ledger = OptimisticLedger::new(date);
        let initial = ledger.reset(HabitState::signed_out(date));
        let (state_tx, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                store,
                retry: RetryPolicy::new(config.read_attempts, config.read_retry_backoff()),
                throttle: Mutex::new(ThrottleGate::new(config.fetch_throttle())),
                fetch_done: Notify::new(),
                config,
                today,
                user: Mutex::new(None),
                session_epoch: AtomicU64::new(0),
                ledger: Mutex::new(ledger),
                state_tx,
                cache: Mutex::new(SnapshotCache::new()),
                requests: RequestManager::new(),
                versions: VersionCounter::new(),
                inflight: Mutex::new(HashMap::new()),
                latest_action: Mutex::new(HashMap::new()),
                action_seq: AtomicU64::new(0),
                local_ids: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn today(&self) -> NaiveDate {
        (self.inner.today)()
    }

    pub fn user(&self) -> Option<UserId> {
        self.inner.user.lock().unwrap().clone()
    }

    pub fn state(&self) -> Arc<HabitState> {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HabitState>> {
        self.inner.state_tx.subscribe()
    }

    pub(crate) fn session_epoch(&self) -> u64 {
        self.inner.session_epoch.load(Ordering::SeqCst)
    }

    // ================================
    // State publication
    // ================================

    /// Runs `f` on the ledger and publishes the state it returns.
    pub(crate) fn commit_with<T>(
        &self,
        f: impl FnOnce(&mut OptimisticLedger) -> (T, Arc<HabitState>),
    ) -> (T, Arc<HabitState>) {
        let mut ledger = self.inner.ledger.lock().unwrap();
        let (out, state) = f(&mut ledger);
        self.inner.state_tx.send_replace(state.clone());
        (out, state)
    }

    pub(crate) fn commit(
        &self,
        f: impl FnOnce(&mut OptimisticLedger) -> Arc<HabitState>,
    ) -> Arc<HabitState> {
        self.commit_with(|ledger| ((), f(ledger))).1
    }

    pub(crate) fn with_ledger<T>(&self, f: impl FnOnce(&mut OptimisticLedger) -> T) -> T {
        f(&mut self.inner.ledger.lock().unwrap())
    }

    // ================================
    // Session lifecycle
    // ================================

    /// Switches the authenticated user.
    ///
    /// Cancels fetches, clears the cache and resets state. The version counter
    /// keeps running so nothing fetched for the previous user can be applied.
    pub fn set_user(&self, user: Option<UserId>) {
        {
            let mut current = self.inner.user.lock().unwrap();
            if *current == user {
                return;
            }
            log::info!("[ENGINE] user change {:?} -> {:?}", *current, user);
            *current = user.clone();
        }

        self.inner.session_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.requests.cancel_pending_requests();
        self.inner.cache.lock().unwrap().clear();
        self.inner.latest_action.lock().unwrap().clear();

        let today = self.today();
        let mut fresh = match user {
            Some(_) => HabitState::loading(today),
            None => HabitState::signed_out(today),
        };
        fresh.applied_version = self.inner.versions.next();
        self.commit(|ledger| ledger.reset(fresh));
    }

    /// Logout: drops every trace of the session.
    pub fn dispose_on_logout(&self) {
        self.set_user(None);
    }

    // ================================
    // Fetch orchestration
    // ================================

    /// Loads the snapshot for `date`.
    ///
    /// Returns `None` when the call was throttled or superseded by a newer
    /// fetch; neither is an error. Slice failures degrade to empty lists; a
    /// fetch where nothing could be read carries `snapshot.error`.
    pub async fn fetch_snapshot(&self, force_refresh: bool, date: NaiveDate) -> Option<FetchOutcome> {
        self.fetch_with(force_refresh, force_refresh, date).await
    }

    /// `skip_throttle` without `force_refresh` still allows a cache hit; a
    /// date change uses it so the new date always loads.
    async fn fetch_with(
        &self,
        force_refresh: bool,
        skip_throttle: bool,
        date: NaiveDate,
    ) -> Option<FetchOutcome> {
        let inner = &self.inner;

        if self.user().is_none() {
            log::debug!("[FETCH] no user, returning empty snapshot");
            return Some(FetchOutcome {
                version: inner.versions.next(),
                snapshot: Snapshot::empty(date),
            });
        }

        let now = Instant::now();
        {
            let mut throttle = inner.throttle.lock().unwrap();
            if !skip_throttle && throttle.should_throttle(now) {
                log::debug!("[FETCH] throttled ({})", date);
                return None;
            }
            throttle.mark_started(now);
        }
        let _guard = FetchGuard {
            throttle: &inner.throttle,
            done: &inner.fetch_done,
        };

        inner.requests.cancel_pending_requests();
        let token = inner.requests.create_abort_controller();
        let version = inner.versions.next();

        let is_today = date == self.today();
        if force_refresh || !is_today {
            inner.cache.lock().unwrap().clear();
        } else {
            let cached = inner.cache.lock().unwrap().get(now);
            if let Some(snapshot) = cached {
                log::debug!("[FETCH] v{} cache hit for {}", version, date);
                return Some(FetchOutcome { version, snapshot });
            }
        }

        log::debug!("[FETCH] v{} loading {} (force={})", version, date, force_refresh);
        let store = &inner.store;
        let retry = &inner.retry;
        let reads = async {
            tokio::join!(
                retry.run("list_habits", &token, || store.list_habits()),
                retry.run("list_completions", &token, || store.list_completions(date)),
                retry.run("list_failures", &token, || store.list_failures(date)),
            )
        };

        let Some((habits, completions, failures)) = inner.requests.track_promise(reads).await
        else {
            log::debug!("[FETCH] v{} aborted", version);
            return None;
        };
        if token.is_cancelled() {
            log::debug!("[FETCH] v{} aborted after completion", version);
            return None;
        }

        let mut errors = Vec::new();
        let mut aborted = false;
        let snapshot = Snapshot {
            date,
            habits: settle_slice("habits", habits, &mut errors, &mut aborted),
            completions: settle_slice("completions", completions, &mut errors, &mut aborted),
            failures: settle_slice("failures", failures, &mut errors, &mut aborted),
            error: None,
        };
        if aborted {
            return None;
        }

        let snapshot = if errors.len() == 3 || errors.contains(&RemoteError::Unauthorized) {
            let message = errors
                .iter()
                .find(|e| **e == RemoteError::Unauthorized)
                .unwrap_or(&errors[0])
                .to_string();
            log::error!("[FETCH] v{} failed: {}", version, message);
            Snapshot {
                error: Some(message),
                ..snapshot
            }
        } else {
            if is_today {
                let mut cache = inner.cache.lock().unwrap();
                if cache.admits(version) {
                    cache.set(snapshot.clone(), Instant::now(), inner.config.cache_ttl());
                } else {
                    log::debug!("[FETCH] v{} predates a write, not cached", version);
                }
            }
            snapshot
        };

        Some(FetchOutcome { version, snapshot })
    }

    /// Folds a fetch outcome into the published state.
    pub fn reconcile(&self, outcome: FetchOutcome) -> (Reconciled, Arc<HabitState>) {
        self.commit_with(|ledger| ledger.reconcile(outcome))
    }

    /// Refreshes the selected date.
    ///
    /// Returns the newly published state, or `None` when the refresh was
    /// skipped, aborted, or superseded. A total fetch failure is reported in
    /// `state.error` with the previous data kept.
    pub async fn refresh(&self, show_loading: bool, force_refresh: bool) -> Option<Arc<HabitState>> {
        self.refresh_with(show_loading, force_refresh, force_refresh)
            .await
    }

    async fn refresh_with(
        &self,
        show_loading: bool,
        force_refresh: bool,
        skip_throttle: bool,
    ) -> Option<Arc<HabitState>> {
        let date = self.state().selected_date;
        let epoch = self.session_epoch();

        if show_loading {
            self.commit(|ledger| ledger.set_loading(true));
        }

        let outcome = self.fetch_with(force_refresh, skip_throttle, date).await;
        let outcome = match outcome {
            Some(o) if epoch == self.session_epoch() => o,
            _ => {
                // A fetch still running owns the loading flag.
                let superseded = self.inner.throttle.lock().unwrap().is_in_progress();
                if show_loading && !superseded && epoch == self.session_epoch() {
                    self.commit(|ledger| ledger.set_loading(false));
                }
                return None;
            }
        };

        let (reconciled, state) = self.reconcile(outcome);
        match reconciled {
            Reconciled::Applied | Reconciled::Failed => Some(state),
            Reconciled::Stale => None,
        }
    }

    /// Selects another date and loads it.
    ///
    /// Never throttled: the records on screen were just cleared. Any fetch
    /// still running is cancelled; its outcome would be for the old date.
    /// Dates other than today bypass the cache.
    pub async fn select_date(&self, date: NaiveDate) -> Option<Arc<HabitState>> {
        self.commit(|ledger| ledger.select_date(date));
        self.refresh_with(true, false, true).await
    }

    /// Waits until a non-forced fetch would pass the throttle.
    pub(crate) async fn wait_for_fetch_slot(&self) {
        loop {
            let done = self.inner.fetch_done.notified();
            let (busy, remaining) = {
                let throttle = self.inner.throttle.lock().unwrap();
                (throttle.is_in_progress(), throttle.remaining(Instant::now()))
            };
            if busy {
                done.await;
            } else if let Some(left) = remaining {
                tokio::time::sleep(left).await;
            } else {
                return;
            }
        }
    }

    /// Latest fetch version issued so far.
    pub(crate) fn latest_version(&self) -> u64 {
        self.inner.versions.current()
    }

    /// Drops the cached snapshot and refuses any fetch already running from
    /// caching its result.
    pub(crate) fn fence_cache(&self) {
        let latest = self.latest_version();
        self.inner.cache.lock().unwrap().fence(latest);
    }

    /// Reads today's marks for one habit straight from the store.
    pub(crate) async fn read_marks(&self, habit_id: &str, date: NaiveDate) -> SyncResult<(bool, bool)> {
        let token = tokio_util::sync::CancellationToken::new();
        let store = &self.inner.store;
        let retry = &self.inner.retry;

        let (completions, failures) = tokio::join!(
            retry.run("list_completions", &token, || store.list_completions(date)),
            retry.run("list_failures", &token, || store.list_failures(date)),
        );
        let completions = completions.map_err(read_error)?;
        let failures = failures.map_err(read_error)?;

        Ok((
            completions.iter().any(|c| c.habit_id == habit_id),
            failures.iter().any(|f| f.habit_id == habit_id),
        ))
    }
}

fn read_error(failure: ReadFailure) -> crate::error::SyncError {
    match failure {
        ReadFailure::Failed(e) => e.into(),
        ReadFailure::Cancelled => crate::error::SyncError::Internal("read cancelled".into()),
    }
}

/// Partial failures degrade to an empty slice.
fn settle_slice<T>(
    label: &str,
    result: Result<Vec<T>, ReadFailure>,
    errors: &mut Vec<RemoteError>,
    aborted: &mut bool,
) -> Vec<T> {
    match result {
        Ok(items) => items,
        Err(ReadFailure::Cancelled) => {
            *aborted = true;
            Vec::new()
        }
        Err(ReadFailure::Failed(e)) => {
            log::warn!("[FETCH] {} slice failed, using empty list: {}", label, e);
            errors.push(e);
            Vec::new()
        }
    }
}
