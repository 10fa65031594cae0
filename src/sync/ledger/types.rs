use chrono::NaiveDate;

use crate::model::{Completion, Failure, HabitId, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Toggle,
    LogFailure,
    UndoFailure,
}

/// Per-habit, per-kind key used to deduplicate in-flight mutations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub habit_id: HabitId,
    pub kind: ActionKind,
}

impl ActionKey {
    pub fn new(habit_id: impl Into<HabitId>, kind: ActionKind) -> Self {
        Self {
            habit_id: habit_id.into(),
            kind,
        }
    }
}

/// Handle for an optimistic patch awaiting `confirm` or `rollback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchToken(pub(crate) u64);

/// A local change applied ahead of server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Mark done: adds `local`, bumps the streak, drops a same-day failure.
    Complete { local: Completion },
    /// Unmark done: removes the completion, decrements the streak (floor 0).
    Uncomplete { habit_id: HabitId, date: NaiveDate },
    /// Adds or replaces the failure, zeroes the streak, drops a same-day completion.
    LogFailure { local: Failure },
    /// Removes the failure. The streak is left as is.
    UndoFailure { habit_id: HabitId, date: NaiveDate },
}

impl Patch {
    pub fn habit_id(&self) -> &str {
        match self {
            Patch::Complete { local } => &local.habit_id,
            Patch::LogFailure { local } => &local.habit_id,
            Patch::Uncomplete { habit_id, .. } | Patch::UndoFailure { habit_id, .. } => habit_id,
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            Patch::Complete { local } => local.completed_date,
            Patch::LogFailure { local } => local.failure_date,
            Patch::Uncomplete { date, .. } | Patch::UndoFailure { date, .. } => *date,
        }
    }
}

/// A fetched snapshot tagged with the version taken when the fetch began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub version: u64,
    pub snapshot: Snapshot,
}

/// What reconciliation did with a [`FetchOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Server data replaced local state.
    Applied,
    /// Fetch failed entirely; previous data kept, error recorded.
    Failed,
    /// Older than what is already applied, or for another date. Dropped.
    Stale,
}
