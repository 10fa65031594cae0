use chrono::NaiveDate;

use crate::error::RemoteError;
use crate::model::{Habit, StreakUpdate};
use crate::sync::remote::{MemoryStore, RemoteStore, Seed, StoreOp};

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

fn store() -> MemoryStore {
    MemoryStore::with_seed(
        "u1",
        Seed {
            habits: vec![Habit::new("h1", "read"), Habit::new("h2", "run")],
            ..Seed::default()
        },
    )
}

#[tokio::test]
async fn reads_are_scoped_to_signed_in_user() {
    let store = store();
    store.upsert_habit("u2", Habit::new("other", "someone else"));

    let habits = store.list_habits().await.unwrap();
    assert_eq!(habits.len(), 2);

    store.sign_out();
    assert_eq!(store.list_habits().await, Err(RemoteError::Unauthorized));
}

#[tokio::test]
async fn completion_replaces_failure_and_vice_versa() {
    let store = store();

    store.upsert_failure("h1", day(), "tired").await.unwrap();
    assert!(store.has_failure("u1", "h1", day()));

    store.insert_completion("h1", day()).await.unwrap();
    assert!(store.has_completion("u1", "h1", day()));
    assert!(!store.has_failure("u1", "h1", day()));

    store.upsert_failure("h1", day(), "sick").await.unwrap();
    assert!(!store.has_completion("u1", "h1", day()));
    let failures = store.list_failures(day()).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, "sick");
}

#[tokio::test]
async fn duplicate_completion_is_rejected() {
    let store = store();
    store.insert_completion("h1", day()).await.unwrap();
    let err = store.insert_completion("h1", day()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(_)));
}

#[tokio::test]
async fn listing_filters_by_date() {
    let store = store();
    store.insert_completion("h1", day()).await.unwrap();
    store
        .insert_completion("h2", day().pred_opt().unwrap())
        .await
        .unwrap();

    let today = store.list_completions(day()).await.unwrap();
    assert_eq!(today.len(), 1);
    assert_eq!(today[0].habit_id, "h1");
}

#[tokio::test]
async fn injected_failure_fires_once_and_is_counted() {
    let store = store();
    store.fail_next(StoreOp::ListHabits, RemoteError::Transport("down".into()));

    assert!(store.list_habits().await.is_err());
    assert!(store.list_habits().await.is_ok());
    assert_eq!(store.calls(StoreOp::ListHabits), 2);
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test]
async fn streak_update_keeps_longest_at_least_current() {
    let store = store();
    store
        .update_habit_streak(
            "h1",
            StreakUpdate {
                current_streak: 4,
                longest_streak: 2,
            },
        )
        .await
        .unwrap();

    let habit = store.habit("u1", "h1").unwrap();
    assert_eq!(habit.current_streak, 4);
    assert_eq!(habit.longest_streak, 4);
}
