use chrono::NaiveDate;

use crate::model::{Completion, Failure, Snapshot};
use crate::sync::ledger::state::HabitState;
use crate::sync::ledger::types::Patch;

/// What a habit looked like for one date before a patch touched it.
#[derive(Debug, Clone)]
pub struct Prior {
    pub habit_id: String,
    pub date: NaiveDate,
    pub streak: Option<(u32, u32)>,
    pub completion: Option<Completion>,
    pub failure: Option<Failure>,
}

pub fn capture_prior(state: &HabitState, habit_id: &str, date: NaiveDate) -> Prior {
    Prior {
        habit_id: habit_id.to_string(),
        date,
        streak: state
            .habit(habit_id)
            .map(|h| (h.current_streak, h.longest_streak)),
        completion: state.completion(habit_id, date).cloned(),
        failure: state.failure(habit_id, date).cloned(),
    }
}

/// Applies `patch` to `state`.
///
/// Idempotent with respect to records: completing a habit that already shows a
/// completion does not bump the streak twice. This lets pending patches be
/// replayed on top of a server snapshot that may already contain them.
/// Record changes only apply when `patch` targets the selected date; streak
/// changes always apply.
pub fn apply_patch(state: &mut HabitState, patch: &Patch) {
    let habit_id = patch.habit_id().to_string();
    let date = patch.date();
    let visible = date == state.selected_date;

    match patch {
        Patch::Complete { local } => {
            let already = visible && state.is_completed(&habit_id, date);
            if visible {
                remove_failure(state, &habit_id, date);
                if !already {
                    state.completions.push(local.clone());
                }
            }
            if !already {
                update_streak(state, &habit_id, |current, longest| {
                    let current = current.saturating_add(1);
                    (current, longest.max(current))
                });
            }
        }
        Patch::Uncomplete { .. } => {
            let removed = visible && remove_completion(state, &habit_id, date);
            if removed || !visible {
                update_streak(state, &habit_id, |current, longest| {
                    (current.saturating_sub(1), longest)
                });
            }
        }
        Patch::LogFailure { local } => {
            if visible {
                remove_completion(state, &habit_id, date);
                match state
                    .failures
                    .iter_mut()
                    .find(|f| f.habit_id == habit_id && f.failure_date == date)
                {
                    Some(existing) => existing.reason = local.reason.clone(),
                    None => state.failures.push(local.clone()),
                }
            }
            update_streak(state, &habit_id, |_, longest| (0, longest));
        }
        Patch::UndoFailure { .. } => {
            if visible {
                remove_failure(state, &habit_id, date);
            }
        }
    }
}

/// Replays a pending patch on top of server data.
///
/// Records follow [`apply_patch`]. The streak is set to `streak`, the value
/// the patch's write sends, so a snapshot that already carries the write's
/// streak is not counted twice.
pub fn replay_patch(state: &mut HabitState, patch: &Patch, streak: Option<(u32, u32)>) {
    apply_patch(state, patch);
    if let Some((current, longest)) = streak {
        update_streak(state, patch.habit_id(), |_, _| (current, longest));
    }
}

/// Puts the records and streak captured in `prior` back.
pub fn restore_prior(state: &mut HabitState, prior: &Prior) {
    if let Some((current, longest)) = prior.streak {
        update_streak(state, &prior.habit_id, |_, _| (current, longest));
    }
    if prior.date != state.selected_date {
        return;
    }
    remove_completion(state, &prior.habit_id, prior.date);
    remove_failure(state, &prior.habit_id, prior.date);
    if let Some(c) = &prior.completion {
        state.completions.push(c.clone());
    }
    if let Some(f) = &prior.failure {
        state.failures.push(f.clone());
    }
}

/// Replaces the data fields of `state` with `snapshot`.
pub fn replace_with_snapshot(state: &mut HabitState, snapshot: Snapshot) {
    state.habits = snapshot.habits;
    state.completions = snapshot.completions;
    state.failures = snapshot.failures;
}

/// Drops one record wherever a habit has both a completion and a failure for
/// the same date. The newer record wins; on a tie the completion is kept.
pub fn enforce_exclusivity(state: &mut HabitState) {
    let completions = &state.completions;
    let before = state.failures.len();
    let mut dropped_completions = Vec::new();

    state.failures.retain(|f| {
        match completions
            .iter()
            .find(|c| c.habit_id == f.habit_id && c.completed_date == f.failure_date)
        {
            Some(c) if c.created_at >= f.created_at => false,
            Some(c) => {
                dropped_completions.push(c.id.clone());
                true
            }
            None => true,
        }
    });
    state
        .completions
        .retain(|c| !dropped_completions.contains(&c.id));

    let dropped = before - state.failures.len() + dropped_completions.len();
    if dropped > 0 {
        log::warn!(
            "[ENGINE] dropped {} record(s) violating completion/failure exclusivity",
            dropped
        );
    }
}

pub fn refilter(state: &mut HabitState) {
    let date = state.selected_date;
    state.filtered_habits = state
        .habits
        .iter()
        .filter(|h| h.is_scheduled_on(date))
        .cloned()
        .collect();
}

fn update_streak(state: &mut HabitState, habit_id: &str, f: impl Fn(u32, u32) -> (u32, u32)) {
    if let Some(habit) = state.habits.iter_mut().find(|h| h.id == habit_id) {
        let (current, longest) = f(habit.current_streak, habit.longest_streak);
        habit.current_streak = current;
        habit.longest_streak = longest.max(current);
    }
}

fn remove_completion(state: &mut HabitState, habit_id: &str, date: NaiveDate) -> bool {
    let before = state.completions.len();
    state
        .completions
        .retain(|c| !(c.habit_id == habit_id && c.completed_date == date));
    state.completions.len() != before
}

fn remove_failure(state: &mut HabitState, habit_id: &str, date: NaiveDate) -> bool {
    let before = state.failures.len();
    state
        .failures
        .retain(|f| !(f.habit_id == habit_id && f.failure_date == date));
    state.failures.len() != before
}
