use chrono::NaiveDate;

use crate::model::{Completion, Failure, Habit};

/// The reconciled view handed to presentation layers.
///
/// Published as `Arc<HabitState>`; a new value is built for every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HabitState {
    pub habits: Vec<Habit>,
    /// Habits scheduled on `selected_date`.
    pub filtered_habits: Vec<Habit>,
    /// Completions for `selected_date`.
    pub completions: Vec<Completion>,
    /// Failures for `selected_date`.
    pub failures: Vec<Failure>,
    pub loading: bool,
    pub error: Option<String>,
    pub is_initialized: bool,

    pub selected_date: NaiveDate,
    /// Highest fetch version reconciled into this state.
    pub applied_version: u64,
}

impl HabitState {
    /// Session start: empty and loading.
    pub fn loading(date: NaiveDate) -> Self {
        Self {
            habits: Vec::new(),
            filtered_habits: Vec::new(),
            completions: Vec::new(),
            failures: Vec::new(),
            loading: true,
            error: None,
            is_initialized: false,
            selected_date: date,
            applied_version: 0,
        }
    }

    /// Logged out: empty, not loading.
    pub fn signed_out(date: NaiveDate) -> Self {
        Self {
            loading: false,
            ..Self::loading(date)
        }
    }

    pub fn habit(&self, habit_id: &str) -> Option<&Habit> {
        self.habits.iter().find(|h| h.id == habit_id)
    }

    pub fn completion(&self, habit_id: &str, date: NaiveDate) -> Option<&Completion> {
        self.completions
            .iter()
            .find(|c| c.habit_id == habit_id && c.completed_date == date)
    }

    pub fn failure(&self, habit_id: &str, date: NaiveDate) -> Option<&Failure> {
        self.failures
            .iter()
            .find(|f| f.habit_id == habit_id && f.failure_date == date)
    }

    pub fn is_completed(&self, habit_id: &str, date: NaiveDate) -> bool {
        self.completion(habit_id, date).is_some()
    }

    pub fn has_failed(&self, habit_id: &str, date: NaiveDate) -> bool {
        self.failure(habit_id, date).is_some()
    }
}
