//! In-process [`RemoteStore`] with latency and fault injection.
//!
//! Backs the CLI demo and the engine tests. Records are kept per user and the
//! mutual exclusion between completions and failures is enforced the way the
//! real backend does: writing one deletes the other for the same day.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::error::RemoteError;
use crate::model::{Completion, Failure, Habit, HabitId, StreakUpdate, UserId};
use crate::sync::remote::api::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListHabits,
    ListCompletions,
    ListFailures,
    InsertCompletion,
    DeleteCompletion,
    UpsertFailure,
    DeleteFailure,
    UpdateHabitStreak,
}

impl StoreOp {
    pub fn is_write(self) -> bool {
        !matches!(
            self,
            StoreOp::ListHabits | StoreOp::ListCompletions | StoreOp::ListFailures
        )
    }
}

/// Initial contents for one user, as read from a seed file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub habits: Vec<Habit>,
    pub completions: Vec<SeedCompletion>,
    pub failures: Vec<SeedFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCompletion {
    pub habit_id: HabitId,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFailure {
    pub habit_id: HabitId,
    pub date: NaiveDate,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default)]
struct Tables {
    habits: BTreeMap<HabitId, Habit>,
    completions: BTreeMap<(HabitId, NaiveDate), Completion>,
    failures: BTreeMap<(HabitId, NaiveDate), Failure>,
}

#[derive(Debug, Default)]
struct Faults {
    latency: HashMap<StoreOp, Duration>,
    one_shot_latency: HashMap<StoreOp, VecDeque<Duration>>,
    fail_next: HashMap<StoreOp, VecDeque<RemoteError>>,
    fail_always: HashMap<StoreOp, RemoteError>,
    hang: HashMap<StoreOp, bool>,
    calls: HashMap<StoreOp, usize>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    session: Mutex<Option<UserId>>,
    tables: Mutex<HashMap<UserId, Tables>>,
    faults: Mutex<Faults>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store with `user` signed in and `seed` loaded for them.
    pub fn with_seed(user: impl Into<UserId>, seed: Seed) -> Self {
        let store = Self::new();
        let user = user.into();
        store.load_seed(&user, seed);
        store.sign_in(user);
        store
    }

    pub fn sign_in(&self, user: impl Into<UserId>) {
        *self.session.lock().unwrap() = Some(user.into());
    }

    pub fn sign_out(&self) {
        *self.session.lock().unwrap() = None;
    }

    pub fn load_seed(&self, user: &str, seed: Seed) {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(user.to_string()).or_default();
        for habit in seed.habits {
            t.habits.insert(habit.id.clone(), habit);
        }
        for c in seed.completions {
            let record = self.new_completion(user, &c.habit_id, c.date);
            t.failures.remove(&(c.habit_id.clone(), c.date));
            t.completions.insert((c.habit_id, c.date), record);
        }
        for f in seed.failures {
            let record = self.new_failure(user, &f.habit_id, f.date, &f.reason);
            t.completions.remove(&(f.habit_id.clone(), f.date));
            t.failures.insert((f.habit_id, f.date), record);
        }
    }

    pub fn upsert_habit(&self, user: &str, habit: Habit) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry(user.to_string())
            .or_default()
            .habits
            .insert(habit.id.clone(), habit);
    }

    pub fn habit(&self, user: &str, habit_id: &str) -> Option<Habit> {
        let tables = self.tables.lock().unwrap();
        tables.get(user)?.habits.get(habit_id).cloned()
    }

    pub fn has_completion(&self, user: &str, habit_id: &str, date: NaiveDate) -> bool {
        let tables = self.tables.lock().unwrap();
        tables
            .get(user)
            .map(|t| t.completions.contains_key(&(habit_id.to_string(), date)))
            .unwrap_or(false)
    }

    pub fn has_failure(&self, user: &str, habit_id: &str, date: NaiveDate) -> bool {
        let tables = self.tables.lock().unwrap();
        tables
            .get(user)
            .map(|t| t.failures.contains_key(&(habit_id.to_string(), date)))
            .unwrap_or(false)
    }

    // ================================
    // Fault injection
    // ================================

    pub fn set_latency(&self, op: StoreOp, latency: Duration) {
        self.faults.lock().unwrap().latency.insert(op, latency);
    }

    /// Latency for the next call of `op` only. Queued values are used in order.
    pub fn push_latency(&self, op: StoreOp, latency: Duration) {
        self.faults
            .lock()
            .unwrap()
            .one_shot_latency
            .entry(op)
            .or_default()
            .push_back(latency);
    }

    pub fn fail_next(&self, op: StoreOp, err: RemoteError) {
        self.faults
            .lock()
            .unwrap()
            .fail_next
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(&self, op: StoreOp, err: RemoteError) {
        self.faults.lock().unwrap().fail_always.insert(op, err);
    }

    pub fn clear_faults(&self) {
        let mut f = self.faults.lock().unwrap();
        f.latency.clear();
        f.one_shot_latency.clear();
        f.fail_next.clear();
        f.fail_always.clear();
        f.hang.clear();
    }

    /// Calls of `op` never settle while set.
    pub fn set_hang(&self, op: StoreOp, hang: bool) {
        self.faults.lock().unwrap().hang.insert(op, hang);
    }

    pub fn calls(&self, op: StoreOp) -> usize {
        self.faults.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn write_calls(&self) -> usize {
        let f = self.faults.lock().unwrap();
        f.calls
            .iter()
            .filter(|(op, _)| op.is_write())
            .map(|(_, n)| *n)
            .sum()
    }

    // ================================
    // Internals
    // ================================

    fn next_record_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn new_completion(&self, user: &str, habit_id: &str, date: NaiveDate) -> Completion {
        Completion {
            id: self.next_record_id("c"),
            habit_id: habit_id.to_string(),
            user_id: user.to_string(),
            completed_date: date,
            created_at: Utc::now(),
        }
    }

    fn new_failure(&self, user: &str, habit_id: &str, date: NaiveDate, reason: &str) -> Failure {
        Failure {
            id: self.next_record_id("f"),
            habit_id: habit_id.to_string(),
            user_id: user.to_string(),
            failure_date: date,
            reason: reason.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Counts the call, applies latency and injected faults, and resolves the
    /// signed-in user.
    async fn enter(&self, op: StoreOp) -> Result<UserId, RemoteError> {
        let (delay, hang) = {
            let mut f = self.faults.lock().unwrap();
            *f.calls.entry(op).or_default() += 1;
            let one_shot = f.one_shot_latency.get_mut(&op).and_then(|q| q.pop_front());
            let delay = one_shot.or_else(|| f.latency.get(&op).copied());
            (delay, f.hang.get(&op).copied().unwrap_or(false))
        };

        log::trace!("[STORE] {:?} (delay={:?}, hang={})", op, delay, hang);

        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut f = self.faults.lock().unwrap();
            if let Some(err) = f.fail_next.get_mut(&op).and_then(|q| q.pop_front()) {
                log::debug!("[STORE] {:?} injected failure: {}", op, err);
                return Err(err);
            }
            if let Some(err) = f.fail_always.get(&op) {
                return Err(err.clone());
            }
        }

        self.session
            .lock()
            .unwrap()
            .clone()
            .ok_or(RemoteError::Unauthorized)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_habits(&self) -> Result<Vec<Habit>, RemoteError> {
        let user = self.enter(StoreOp::ListHabits).await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&user)
            .map(|t| t.habits.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_completions(&self, date: NaiveDate) -> Result<Vec<Completion>, RemoteError> {
        let user = self.enter(StoreOp::ListCompletions).await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&user)
            .map(|t| {
                t.completions
                    .values()
                    .filter(|c| c.completed_date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_failures(&self, date: NaiveDate) -> Result<Vec<Failure>, RemoteError> {
        let user = self.enter(StoreOp::ListFailures).await?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&user)
            .map(|t| {
                t.failures
                    .values()
                    .filter(|f| f.failure_date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_completion(
        &self,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Completion, RemoteError> {
        let user = self.enter(StoreOp::InsertCompletion).await?;
        let record = self.new_completion(&user, habit_id, date);
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(user).or_default();
        if !t.habits.contains_key(habit_id) {
            return Err(RemoteError::NotFound(habit_id.to_string()));
        }
        let key = (habit_id.to_string(), date);
        if t.completions.contains_key(&key) {
            return Err(RemoteError::Rejected(format!(
                "completion for {habit_id} on {date} already exists"
            )));
        }
        t.failures.remove(&key);
        t.completions.insert(key, record.clone());
        Ok(record)
    }

    async fn delete_completion(&self, habit_id: &str, date: NaiveDate) -> Result<(), RemoteError> {
        let user = self.enter(StoreOp::DeleteCompletion).await?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(t) = tables.get_mut(&user) {
            t.completions.remove(&(habit_id.to_string(), date));
        }
        Ok(())
    }

    async fn upsert_failure(
        &self,
        habit_id: &str,
        date: NaiveDate,
        reason: &str,
    ) -> Result<Failure, RemoteError> {
        let user = self.enter(StoreOp::UpsertFailure).await?;
        let record = self.new_failure(&user, habit_id, date, reason);
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(user).or_default();
        if !t.habits.contains_key(habit_id) {
            return Err(RemoteError::NotFound(habit_id.to_string()));
        }
        let key = (habit_id.to_string(), date);
        t.completions.remove(&key);
        let stored = t
            .failures
            .entry(key)
            .and_modify(|f| f.reason = reason.to_string())
            .or_insert(record);
        Ok(stored.clone())
    }

    async fn delete_failure(&self, habit_id: &str, date: NaiveDate) -> Result<(), RemoteError> {
        let user = self.enter(StoreOp::DeleteFailure).await?;
        let mut tables = self.tables.lock().unwrap();
        if let Some(t) = tables.get_mut(&user) {
            t.failures.remove(&(habit_id.to_string(), date));
        }
        Ok(())
    }

    async fn update_habit_streak(
        &self,
        habit_id: &str,
        streak: StreakUpdate,
    ) -> Result<(), RemoteError> {
        let user = self.enter(StoreOp::UpdateHabitStreak).await?;
        let mut tables = self.tables.lock().unwrap();
        let habit = tables
            .get_mut(&user)
            .and_then(|t| t.habits.get_mut(habit_id))
            .ok_or_else(|| RemoteError::NotFound(habit_id.to_string()))?;
        habit.current_streak = streak.current_streak;
        habit.longest_streak = streak.longest_streak.max(streak.current_streak);
        Ok(())
    }
}
