//! Optimistic mutation handlers.
//!
//! Each handler patches local state first, then sends the remote writes raced
//! against the mutation timeout. Success confirms the patch and schedules a
//! quiet refresh; failure rolls it back, forces a refresh and reports the error.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use futures::FutureExt;

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::model::{Completion, Failure, HabitId, StreakUpdate, UserId};
use crate::sync::ledger::{ActionKey, ActionKind, HabitState, Patch, PatchToken};
use crate::sync::remote::RemoteStore;
use crate::sync::runtime::orchestrator::SyncEngine;

/// Removes the dedup entry when the action finishes, however it finishes.
struct InflightGuard<S: RemoteStore> {
    engine: SyncEngine<S>,
    key: ActionKey,
}

impl<S: RemoteStore> Drop for InflightGuard<S> {
    fn drop(&mut self) {
        self.engine.inner.inflight.lock().unwrap().remove(&self.key);
        log::trace!("[MUTATION] {:?} cleared", self.key);
    }
}

/// An action that passed its preconditions and holds an optimistic patch.
struct Prepared {
    habit_id: HabitId,
    seq: u64,
    epoch: u64,
    token: PatchToken,
}

impl<S: RemoteStore> SyncEngine<S> {
    /// Marks the habit done today, or undoes today's completion.
    ///
    /// A second call for the same habit while one is in flight joins it and
    /// returns the same outcome; only one remote write is made.
    pub async fn toggle_completion(&self, habit_id: &str) -> SyncResult<()> {
        let key = ActionKey::new(habit_id, ActionKind::Toggle);
        self.run_deduped(key, |engine, habit_id| engine.do_toggle(habit_id))
            .await
    }

    /// Records today's failure with `reason`, replacing any completion.
    pub async fn log_failure(&self, habit_id: &str, reason: &str) -> SyncResult<()> {
        let key = ActionKey::new(habit_id, ActionKind::LogFailure);
        let reason = reason.to_string();
        self.run_deduped(key, move |engine, habit_id| {
            engine.do_log_failure(habit_id, reason)
        })
        .await
    }

    /// Removes today's failure. The streak is not restored.
    pub async fn undo_failure(&self, habit_id: &str) -> SyncResult<()> {
        let key = ActionKey::new(habit_id, ActionKind::UndoFailure);
        self.run_deduped(key, |engine, habit_id| engine.do_undo_failure(habit_id))
            .await
    }

    /// Whether an action of `kind` is in flight for `habit_id`.
    pub fn is_pending(&self, habit_id: &str, kind: ActionKind) -> bool {
        self.inner
            .inflight
            .lock()
            .unwrap()
            .contains_key(&ActionKey::new(habit_id, kind))
    }

    // ================================
    // Dedup
    // ================================

    async fn run_deduped<F, Fut>(&self, key: ActionKey, action: F) -> SyncResult<()>
    where
        F: FnOnce(SyncEngine<S>, HabitId) -> Fut,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        if self.user().is_none() {
            return Err(SyncError::NotAuthenticated);
        }

        let shared = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.get(&key) {
                Some(existing) => {
                    log::debug!("[MUTATION] {:?} already in flight, joining", key);
                    existing.clone()
                }
                None => {
                    let guard = InflightGuard {
                        engine: self.clone(),
                        key: key.clone(),
                    };
                    let fut = action(self.clone(), key.habit_id.clone());
                    // Runs on its own task so a caller dropping its future
                    // cannot strand the entry.
                    let handle = tokio::spawn(async move {
                        let _guard = guard;
                        fut.await
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(SyncError::Internal(format!("mutation task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    // ================================
    // Handlers
    // ================================

    async fn do_toggle(self, habit_id: HabitId) -> SyncResult<()> {
        let user = self.user().ok_or(SyncError::NotAuthenticated)?;
        let today = self.today();
        let (completed, failed) = self.current_marks(&habit_id, today).await?;

        let patch = if completed {
            Patch::Uncomplete {
                habit_id: habit_id.clone(),
                date: today,
            }
        } else {
            Patch::Complete {
                local: self.local_completion(&user, &habit_id, today),
            }
        };
        let (prepared, state) = self.prepare(&habit_id, patch);
        let streak = streak_of(&state, &habit_id);
        log::info!(
            "[MUTATION] toggle {} -> {}",
            habit_id,
            if completed { "not done" } else { "done" }
        );

        let store = self.inner.store.clone();
        let write = async move {
            if completed {
                store.delete_completion(&habit_id, today).await?;
            } else {
                if failed {
                    store.delete_failure(&habit_id, today).await?;
                }
                store.insert_completion(&habit_id, today).await?;
            }
            if let Some(streak) = streak {
                store.update_habit_streak(&habit_id, streak).await?;
            }
            Ok(())
        };
        self.settle(prepared, write).await
    }

    async fn do_log_failure(self, habit_id: HabitId, reason: String) -> SyncResult<()> {
        let user = self.user().ok_or(SyncError::NotAuthenticated)?;
        let today = self.today();
        let (completed, _) = self.current_marks(&habit_id, today).await?;

        let patch = Patch::LogFailure {
            local: self.local_failure(&user, &habit_id, today, &reason),
        };
        let (prepared, state) = self.prepare(&habit_id, patch);
        let streak = streak_of(&state, &habit_id);
        log::info!("[MUTATION] log failure {} ({:?})", habit_id, reason);

        let store = self.inner.store.clone();
        let write = async move {
            if completed {
                store.delete_completion(&habit_id, today).await?;
            }
            store.upsert_failure(&habit_id, today, &reason).await?;
            if let Some(streak) = streak {
                store.update_habit_streak(&habit_id, streak).await?;
            }
            Ok(())
        };
        self.settle(prepared, write).await
    }

    async fn do_undo_failure(self, habit_id: HabitId) -> SyncResult<()> {
        let today = self.today();
        self.current_marks(&habit_id, today).await?;

        let patch = Patch::UndoFailure {
            habit_id: habit_id.clone(),
            date: today,
        };
        let (prepared, _) = self.prepare(&habit_id, patch);
        log::info!("[MUTATION] undo failure {}", habit_id);

        let store = self.inner.store.clone();
        let write = async move { store.delete_failure(&habit_id, today).await };
        self.settle(prepared, write).await
    }

    // ================================
    // Shared steps
    // ================================

    /// Today's (completed, failed) marks for a habit known to local state.
    async fn current_marks(&self, habit_id: &str, today: NaiveDate) -> SyncResult<(bool, bool)> {
        let state = self.state();
        if state.habit(habit_id).is_none() {
            return Err(SyncError::UnknownHabit(habit_id.to_string()));
        }
        if state.selected_date == today {
            return Ok((
                state.is_completed(habit_id, today),
                state.has_failed(habit_id, today),
            ));
        }
        // Another date is on screen, so local records say nothing about today.
        self.read_marks(habit_id, today).await
    }

    /// Records the action as the latest for its habit, invalidates the cache
    /// and applies the optimistic patch.
    fn prepare(&self, habit_id: &str, patch: Patch) -> (Prepared, Arc<HabitState>) {
        let seq = self.inner.action_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .latest_action
            .lock()
            .unwrap()
            .insert(habit_id.to_string(), seq);
        self.fence_cache();

        let (token, state) = self.commit_with(|ledger| ledger.apply_local(patch));
        (
            Prepared {
                habit_id: habit_id.to_string(),
                seq,
                epoch: self.session_epoch(),
                token,
            },
            state,
        )
    }

    async fn settle<W>(&self, prepared: Prepared, write: W) -> SyncResult<()>
    where
        W: Future<Output = Result<(), RemoteError>>,
    {
        let timeout = self.inner.config.mutation_timeout();
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SyncError::Remote(e)),
            Err(_) => Err(SyncError::MutationTimeout(timeout)),
        };

        if prepared.epoch != self.session_epoch() {
            log::debug!("[MUTATION] session changed, dropping result for {}", prepared.habit_id);
            return result;
        }

        match result {
            Ok(()) => {
                // Fetches issued so far may have read pre-write data.
                self.fence_cache();
                let latest = self.latest_version();
                self.with_ledger(|ledger| ledger.confirm(prepared.token, latest));
                self.schedule_confirm_refresh(prepared.habit_id, prepared.seq);
                Ok(())
            }
            Err(err) => {
                log::warn!("[MUTATION] {} failed, rolling back: {}", prepared.habit_id, err);
                self.commit(|ledger| match ledger.rollback(prepared.token) {
                    Some(state) => state,
                    None => ledger.state(),
                });
                self.refresh(false, true).await;
                if prepared.epoch == self.session_epoch() {
                    self.commit(|ledger| ledger.set_error(Some(err.to_string())));
                }
                Err(err)
            }
        }
    }

    /// Quiet refresh after a successful write, skipped if a newer action for
    /// the same habit has started since. Waits out a running fetch instead of
    /// being throttled by it.
    fn schedule_confirm_refresh(&self, habit_id: HabitId, seq: u64) {
        let engine = self.clone();
        let delay = self.inner.config.confirm_refresh_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !engine.is_latest_action(&habit_id, seq) {
                log::debug!("[MUTATION] newer action for {}, skipping confirm refresh", habit_id);
                return;
            }
            engine.wait_for_fetch_slot().await;
            if !engine.is_latest_action(&habit_id, seq) {
                return;
            }
            engine.refresh(false, false).await;
        });
    }

    fn is_latest_action(&self, habit_id: &str, seq: u64) -> bool {
        self.inner.latest_action.lock().unwrap().get(habit_id) == Some(&seq)
    }

    fn next_local_id(&self, prefix: &str) -> String {
        let n = self.inner.local_ids.fetch_add(1, Ordering::Relaxed) + 1;
        format!("local-{}-{}", prefix, hex::encode(n.to_be_bytes()))
    }

    fn local_completion(&self, user: &UserId, habit_id: &str, date: NaiveDate) -> Completion {
        Completion {
            id: self.next_local_id("c"),
            habit_id: habit_id.to_string(),
            user_id: user.clone(),
            completed_date: date,
            created_at: Utc::now(),
        }
    }

    fn local_failure(
        &self,
        user: &UserId,
        habit_id: &str,
        date: NaiveDate,
        reason: &str,
    ) -> Failure {
        Failure {
            id: self.next_local_id("f"),
            habit_id: habit_id.to_string(),
            user_id: user.clone(),
            failure_date: date,
            reason: reason.to_string(),
            created_at: Utc::now(),
        }
    }
}

fn streak_of(state: &HabitState, habit_id: &str) -> Option<StreakUpdate> {
    state.habit(habit_id).map(|h| StreakUpdate {
        current_streak: h.current_streak,
        longest_streak: h.longest_streak,
    })
}
