//! Optimistic state ledger.
//!
//! This is the **Functional Core** of the habit sync engine. It owns the
//! current [`HabitState`] and every optimistic patch that has not been
//! confirmed or rolled back yet.
//!
//! # Guarantees
//! * **No Network, no async**: the orchestrator does IO and feeds results in.
//! * **Two-phase commit**: `apply_local` returns a [`PatchToken`]; the caller
//!   later calls `confirm` or `rollback` with it.
//! * **Confirmed is not forgotten**: a confirmed patch keeps being replayed
//!   until a fetch that started after the write has been reconciled.
//! * **Version ordering**: `reconcile` drops outcomes older than what is
//!   already applied.
//! * **Immutable publication**: every change builds a new `Arc<HabitState>`.

pub mod state;
mod logic;
pub mod types;


pub use state::HabitState;
pub use types::{ActionKey, ActionKind, FetchOutcome, Patch, PatchToken, Reconciled};

use std::sync::Arc;

use chrono::NaiveDate;

use logic::Prior;

#[derive(Debug)]
struct PendingPatch {
    token: PatchToken,
    patch: Patch,
    prior: Prior,
    /// Streak the patch produced locally, which is also what the write sends.
    streak_after: Option<(u32, u32)>,
    /// Latest fetch version issued when the server confirmed the write.
    settled_after: Option<u64>,
}

#[derive(Debug)]
pub struct OptimisticLedger {
    state: Arc<HabitState>,
    pending: Vec<PendingPatch>,
    next_token: u64,
}

impl OptimisticLedger {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            state: Arc::new(HabitState::loading(date)),
            pending: Vec::new(),
            next_token: 1,
        }
    }

    pub fn state(&self) -> Arc<HabitState> {
        self.state.clone()
    }

    /// Patches still replayed on reconcile, confirmed ones included.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Builds the next state from a copy of the current one.
    fn update(&mut self, f: impl FnOnce(&mut HabitState)) -> Arc<HabitState> {
        let mut next = (*self.state).clone();
        f(&mut next);
        self.state = Arc::new(next);
        self.state.clone()
    }

    // ================================
    // Two-phase optimistic commit
    // ================================

    /// Applies `patch` locally and remembers how to undo it.
    pub fn apply_local(&mut self, patch: Patch) -> (PatchToken, Arc<HabitState>) {
        let token = PatchToken(self.next_token);
        self.next_token += 1;

        let prior = logic::capture_prior(&self.state, patch.habit_id(), patch.date());
        log::debug!("[ENGINE] apply_local {:?} -> {:?}", token, patch);

        let state = self.update(|s| {
            logic::apply_patch(s, &patch);
            logic::refilter(s);
        });
        let streak_after = state
            .habit(patch.habit_id())
            .map(|h| (h.current_streak, h.longest_streak));
        self.pending.push(PendingPatch {
            token,
            patch,
            prior,
            streak_after,
            settled_after: None,
        });
        (token, state)
    }

    /// The server accepted the patch. Local state already reflects it.
    ///
    /// `latest_version` is the newest fetch version issued so far. Fetches up
    /// to it may have read pre-write data, so the patch stays in the replay
    /// set until a newer outcome is reconciled.
    pub fn confirm(&mut self, token: PatchToken, latest_version: u64) -> bool {
        let found = match self
            .pending
            .iter_mut()
            .find(|p| p.token == token && p.settled_after.is_none())
        {
            Some(p) => {
                p.settled_after = Some(latest_version);
                true
            }
            None => false,
        };
        log::debug!(
            "[ENGINE] confirm {:?} after v{} (found={})",
            token,
            latest_version,
            found
        );
        found
    }

    /// Undoes the patch: restores what it replaced, then replays any later
    /// pending patch for the same habit and date.
    pub fn rollback(&mut self, token: PatchToken) -> Option<Arc<HabitState>> {
        let idx = self.pending.iter().position(|p| p.token == token)?;
        let removed = self.pending.remove(idx);
        log::debug!("[ENGINE] rollback {:?} ({:?})", token, removed.patch);

        let replay: Vec<Patch> = self.pending[idx..]
            .iter()
            .filter(|p| {
                p.patch.habit_id() == removed.patch.habit_id()
                    && p.patch.date() == removed.patch.date()
            })
            .map(|p| p.patch.clone())
            .collect();

        Some(self.update(|s| {
            logic::restore_prior(s, &removed.prior);
            for patch in &replay {
                logic::apply_patch(s, patch);
            }
            logic::refilter(s);
        }))
    }

    // ================================
    // Reconciliation
    // ================================

    /// Folds a fetch result into state.
    ///
    /// Outcomes older than the applied version, or for a date that is no
    /// longer selected, are dropped. A failed fetch keeps the previous data and
    /// records the error. A good one replaces the data and replays pending
    /// patches on top; confirmed patches older than this outcome retire.
    pub fn reconcile(&mut self, outcome: FetchOutcome) -> (Reconciled, Arc<HabitState>) {
        let FetchOutcome { version, snapshot } = outcome;

        if version < self.state.applied_version {
            log::debug!(
                "[ENGINE] dropping outcome v{} (applied v{})",
                version,
                self.state.applied_version
            );
            return (Reconciled::Stale, self.state());
        }
        if snapshot.date != self.state.selected_date {
            log::debug!(
                "[ENGINE] dropping outcome for {} (selected {})",
                snapshot.date,
                self.state.selected_date
            );
            return (Reconciled::Stale, self.state());
        }

        if let Some(err) = snapshot.error {
            log::warn!("[ENGINE] fetch v{} failed: {}", version, err);
            let state = self.update(|s| {
                s.applied_version = version;
                s.loading = false;
                s.is_initialized = true;
                s.error = Some(err);
            });
            return (Reconciled::Failed, state);
        }

        let replay: Vec<(Patch, Option<(u32, u32)>)> = self
            .pending
            .iter()
            .map(|p| (p.patch.clone(), p.streak_after))
            .collect();
        let state = self.update(|s| {
            logic::replace_with_snapshot(s, snapshot);
            for (patch, streak) in &replay {
                logic::replay_patch(s, patch, *streak);
            }
            logic::enforce_exclusivity(s);
            logic::refilter(s);
            s.applied_version = version;
            s.loading = false;
            s.is_initialized = true;
            s.error = None;
        });
        let before = self.pending.len();
        self.pending
            .retain(|p| !p.settled_after.is_some_and(|settled| version > settled));
        log::debug!(
            "[ENGINE] applied v{} ({} habits, {} replayed, {} retired)",
            version,
            state.habits.len(),
            replay.len(),
            before - self.pending.len()
        );
        (Reconciled::Applied, state)
    }

    // ================================
    // Plain field updates
    // ================================

    pub fn set_loading(&mut self, loading: bool) -> Arc<HabitState> {
        self.update(|s| s.loading = loading)
    }

    pub fn set_error(&mut self, error: Option<String>) -> Arc<HabitState> {
        self.update(|s| s.error = error)
    }

    /// Switches to another date. Records of the old date are dropped until the
    /// next fetch; habits stay.
    pub fn select_date(&mut self, date: NaiveDate) -> Arc<HabitState> {
        if date == self.state.selected_date {
            return self.state();
        }
        self.update(|s| {
            s.selected_date = date;
            s.completions.clear();
            s.failures.clear();
            logic::refilter(s);
        })
    }

    /// Discards everything, keeping only the selected date. Used on user change.
    pub fn reset(&mut self, state: HabitState) -> Arc<HabitState> {
        self.pending.clear();
        self.state = Arc::new(state);
        self.state.clone()
    }
}
