use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::RemoteError;
use crate::model::{Completion, Failure, Habit, StreakUpdate};

/// Remote CRUD interface used by the sync engine.
///
/// Every call is scoped to the authenticated user by the implementation.
/// Reads may be retried; writes are issued once.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn list_habits(&self) -> Result<Vec<Habit>, RemoteError>;

    async fn list_completions(&self, date: NaiveDate) -> Result<Vec<Completion>, RemoteError>;

    async fn list_failures(&self, date: NaiveDate) -> Result<Vec<Failure>, RemoteError>;

    async fn insert_completion(
        &self,
        habit_id: &str,
        date: NaiveDate,
    ) -> Result<Completion, RemoteError>;

    async fn delete_completion(&self, habit_id: &str, date: NaiveDate) -> Result<(), RemoteError>;

    /// Creates the failure for `(habit_id, date)` or replaces its reason.
    async fn upsert_failure(
        &self,
        habit_id: &str,
        date: NaiveDate,
        reason: &str,
    ) -> Result<Failure, RemoteError>;

    async fn delete_failure(&self, habit_id: &str, date: NaiveDate) -> Result<(), RemoteError>;

    /// The server treats these values as hints and stays authoritative.
    async fn update_habit_streak(
        &self,
        habit_id: &str,
        streak: StreakUpdate,
    ) -> Result<(), RemoteError>;
}
