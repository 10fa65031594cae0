//! Records exchanged with the remote store.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type HabitId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub fn of(date: NaiveDate) -> Self {
        date.weekday().into()
    }
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Weekday::Mon,
            chrono::Weekday::Tue => Weekday::Tue,
            chrono::Weekday::Wed => Weekday::Wed,
            chrono::Weekday::Thu => Weekday::Thu,
            chrono::Weekday::Fri => Weekday::Fri,
            chrono::Weekday::Sat => Weekday::Sat,
            chrono::Weekday::Sun => Weekday::Sun,
        }
    }
}

/// A recurring activity owned by the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Habit {
    pub id: HabitId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Days the habit is scheduled on. Empty means every day.
    #[serde(default)]
    pub frequency: BTreeSet<Weekday>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub longest_streak: u32,
    #[serde(default)]
    pub archived: bool,
}

impl Habit {
    pub fn new(id: impl Into<HabitId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            frequency: BTreeSet::new(),
            color: String::new(),
            category: String::new(),
            current_streak: 0,
            longest_streak: 0,
            archived: false,
        }
    }

    /// Whether the habit is due on `date` (and not archived).
    pub fn is_scheduled_on(&self, date: NaiveDate) -> bool {
        !self.archived && (self.frequency.is_empty() || self.frequency.contains(&Weekday::of(date)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub habit_id: HabitId,
    pub user_id: UserId,
    pub completed_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub id: String,
    pub habit_id: HabitId,
    pub user_id: UserId,
    pub failure_date: NaiveDate,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Client-side streak values pushed to the server. The server recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakUpdate {
    pub current_streak: u32,
    pub longest_streak: u32,
}

/// The combined `{habits, completions, failures}` payload for one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub habits: Vec<Habit>,
    pub completions: Vec<Completion>,
    pub failures: Vec<Failure>,
    /// Set when no slice could be fetched. Such snapshots are never cached.
    pub error: Option<String>,
}

impl Snapshot {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            habits: Vec::new(),
            completions: Vec::new(),
            failures: Vec::new(),
            error: None,
        }
    }

    pub fn is_error_free(&self) -> bool {
        self.error.is_none()
    }
}
