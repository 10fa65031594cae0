use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::sleep;

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError};
use crate::model::Habit;
use crate::sync::ledger::{ActionKind, Reconciled};
use crate::sync::remote::memory::{SeedCompletion, SeedFailure};
use crate::sync::remote::{MemoryStore, Seed, StoreOp};
use crate::sync::runtime::SyncEngine;

// --- Fixtures ---

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
}

fn yesterday() -> NaiveDate {
    today().pred_opt().unwrap()
}

fn habit(id: &str, current: u32, longest: u32) -> Habit {
    let mut h = Habit::new(id, id);
    h.current_streak = current;
    h.longest_streak = longest;
    h
}

fn seed() -> Seed {
    Seed {
        habits: vec![habit("h1", 2, 2), habit("h2", 3, 5)],
        ..Seed::default()
    }
}

fn new_engine(store: Arc<MemoryStore>) -> SyncEngine<MemoryStore> {
    SyncEngine::with_today(store, SyncConfig::default(), Arc::new(today))
}

/// Engine signed in as `u1` with the first refresh applied.
async fn ready(store: Arc<MemoryStore>) -> SyncEngine<MemoryStore> {
    let engine = new_engine(store);
    engine.set_user(Some("u1".into()));
    engine.refresh(true, true).await.expect("initial refresh");
    engine
}

fn streak(engine: &SyncEngine<MemoryStore>, habit_id: &str) -> (u32, u32) {
    let state = engine.state();
    let h = state.habit(habit_id).expect("habit in state");
    (h.current_streak, h.longest_streak)
}

fn assert_exclusive(engine: &SyncEngine<MemoryStore>, store: &MemoryStore, habit_id: &str) {
    let state = engine.state();
    assert!(!(state.is_completed(habit_id, today()) && state.has_failed(habit_id, today())));
    assert!(
        !(store.has_completion("u1", habit_id, today())
            && store.has_failure("u1", habit_id, today()))
    );
}

// --- Fetch orchestration ---

#[tokio::test(start_paused = true)]
async fn initial_refresh_publishes_state() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = new_engine(store);
    let mut rx = engine.subscribe();

    engine.set_user(Some("u1".into()));
    assert!(engine.state().loading);

    engine.refresh(true, true).await.unwrap();
    rx.changed().await.unwrap();

    let state = rx.borrow().clone();
    assert!(state.is_initialized);
    assert!(!state.loading);
    assert_eq!(state.habits.len(), 2);
    assert_eq!(state.filtered_habits.len(), 2);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn cached_snapshot_is_reused_within_ttl() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    assert_eq!(store.calls(StoreOp::ListHabits), 1);

    sleep(Duration::from_millis(600)).await;
    assert!(engine.refresh(false, false).await.is_some());
    assert_eq!(store.calls(StoreOp::ListHabits), 1);

    sleep(Duration::from_secs(30)).await;
    engine.refresh(false, false).await.unwrap();
    assert_eq!(store.calls(StoreOp::ListHabits), 2);
}

#[tokio::test(start_paused = true)]
async fn forced_refresh_skips_cache() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    engine.refresh(false, true).await.unwrap();
    assert_eq!(store.calls(StoreOp::ListHabits), 2);
}

#[tokio::test(start_paused = true)]
async fn throttled_refresh_returns_none_and_clears_loading() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    assert!(engine.refresh(true, false).await.is_none());
    assert!(!engine.state().loading);
    assert_eq!(store.calls(StoreOp::ListHabits), 1);
}

#[tokio::test(start_paused = true)]
async fn older_outcome_never_overwrites_newer() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    let older = engine.fetch_snapshot(true, today()).await.unwrap();
    store.upsert_habit("u1", habit("h3", 0, 0));
    let newer = engine.fetch_snapshot(true, today()).await.unwrap();
    assert!(newer.version > older.version);

    let (r, _) = engine.reconcile(newer);
    assert_eq!(r, Reconciled::Applied);
    let (r, state) = engine.reconcile(older);
    assert_eq!(r, Reconciled::Stale);
    assert_eq!(state.habits.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn newer_fetch_aborts_the_running_one() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    store.push_latency(StoreOp::ListHabits, Duration::from_millis(300));

    let slow = engine.clone();
    let first = tokio::spawn(async move { slow.fetch_snapshot(true, today()).await });
    sleep(Duration::from_millis(10)).await;

    assert!(engine.fetch_snapshot(true, today()).await.is_some());
    assert!(first.await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn total_failure_keeps_previous_data() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    for op in [StoreOp::ListHabits, StoreOp::ListCompletions, StoreOp::ListFailures] {
        store.fail_always(op, RemoteError::Transport("offline".into()));
    }
    let state = engine.refresh(false, true).await.unwrap();

    assert_eq!(state.habits.len(), 2);
    assert!(state.error.as_deref().unwrap().contains("offline"));
    assert!(!state.loading);

    // the failed snapshot is not cached
    store.clear_faults();
    sleep(Duration::from_millis(600)).await;
    let calls = store.calls(StoreOp::ListHabits);
    let state = engine.refresh(false, false).await.unwrap();
    assert!(state.error.is_none());
    assert_eq!(store.calls(StoreOp::ListHabits), calls + 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_slice_fails_the_whole_fetch() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    store.fail_next(StoreOp::ListCompletions, RemoteError::Unauthorized);
    let state = engine.refresh(false, true).await.unwrap();

    assert_eq!(state.error, Some(RemoteError::Unauthorized.to_string()));
    assert_eq!(state.habits.len(), 2);
    // terminal errors are not retried
    assert_eq!(store.calls(StoreOp::ListCompletions), 2);
}

#[tokio::test(start_paused = true)]
async fn partial_failure_degrades_to_empty_slice() {
    let mut seed = seed();
    seed.failures.push(SeedFailure {
        habit_id: "h2".into(),
        date: today(),
        reason: "rain".into(),
    });
    let store = Arc::new(MemoryStore::with_seed("u1", seed));
    let engine = ready(store.clone()).await;
    assert!(engine.state().has_failed("h2", today()));

    store.fail_always(StoreOp::ListFailures, RemoteError::Transport("timeout".into()));
    let state = engine.refresh(false, true).await.unwrap();

    assert!(state.error.is_none());
    assert_eq!(state.habits.len(), 2);
    assert!(state.failures.is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_read_error_is_retried() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    store.fail_next(StoreOp::ListHabits, RemoteError::Transport("reset".into()));
    let state = engine.refresh(false, true).await.unwrap();

    assert_eq!(state.habits.len(), 2);
    assert_eq!(store.calls(StoreOp::ListHabits), 3);
}

#[tokio::test(start_paused = true)]
async fn selecting_another_date_loads_its_records() {
    let mut seed = seed();
    seed.completions.push(SeedCompletion {
        habit_id: "h1".into(),
        date: yesterday(),
    });
    let store = Arc::new(MemoryStore::with_seed("u1", seed));
    let engine = ready(store.clone()).await;
    assert!(!engine.state().is_completed("h1", today()));

    sleep(Duration::from_millis(600)).await;
    let state = engine.select_date(yesterday()).await.unwrap();

    assert_eq!(state.selected_date, yesterday());
    assert!(state.is_completed("h1", yesterday()));
}

#[tokio::test(start_paused = true)]
async fn date_switch_right_after_refresh_still_loads() {
    let mut seed = seed();
    seed.completions.push(SeedCompletion {
        habit_id: "h1".into(),
        date: yesterday(),
    });
    let store = Arc::new(MemoryStore::with_seed("u1", seed));
    let engine = ready(store).await;

    let state = engine.select_date(yesterday()).await.unwrap();

    assert_eq!(state.selected_date, yesterday());
    assert!(state.is_completed("h1", yesterday()));
    assert!(!state.loading);
}

#[tokio::test(start_paused = true)]
async fn date_switch_supersedes_slow_refresh() {
    let mut seed = seed();
    seed.completions.push(SeedCompletion {
        habit_id: "h1".into(),
        date: yesterday(),
    });
    let store = Arc::new(MemoryStore::with_seed("u1", seed));
    let engine = ready(store.clone()).await;

    store.push_latency(StoreOp::ListHabits, Duration::from_millis(300));
    let slow = engine.clone();
    let first = tokio::spawn(async move { slow.refresh(true, true).await });
    sleep(Duration::from_millis(10)).await;

    let state = engine.select_date(yesterday()).await.unwrap();
    assert!(state.is_completed("h1", yesterday()));
    assert!(first.await.unwrap().is_none());

    sleep(Duration::from_millis(500)).await;
    let state = engine.state();
    assert_eq!(state.selected_date, yesterday());
    assert!(state.is_completed("h1", yesterday()));
    assert!(!state.loading);
}

#[tokio::test(start_paused = true)]
async fn later_refresh_wins_over_slow_earlier_one() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    store.push_latency(StoreOp::ListHabits, Duration::from_millis(300));
    let slow = engine.clone();
    let first = tokio::spawn(async move { slow.refresh(false, true).await });
    sleep(Duration::from_millis(10)).await;

    store.upsert_habit("u1", habit("h3", 0, 0));
    let state = engine.refresh(false, true).await.unwrap();
    assert_eq!(state.habits.len(), 3);

    assert!(first.await.unwrap().is_none());
    sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.state().habits.len(), 3);
}

// --- Session lifecycle ---

#[tokio::test(start_paused = true)]
async fn signed_out_engine_rejects_mutations() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = new_engine(store.clone());

    assert_eq!(
        engine.toggle_completion("h1").await,
        Err(SyncError::NotAuthenticated)
    );
    let state = engine.refresh(true, false).await.unwrap();
    assert!(state.habits.is_empty());
    assert_eq!(store.calls(StoreOp::ListHabits), 0);
}

#[tokio::test(start_paused = true)]
async fn user_change_discards_old_session() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    store.load_seed(
        "u2",
        Seed {
            habits: vec![habit("other", 0, 0)],
            ..Seed::default()
        },
    );
    let engine = ready(store.clone()).await;

    store.push_latency(StoreOp::ListHabits, Duration::from_millis(200));
    let old = engine.clone();
    let in_flight = tokio::spawn(async move { old.refresh(false, true).await });
    sleep(Duration::from_millis(20)).await;

    engine.set_user(Some("u2".into()));
    store.sign_in("u2");
    let state = engine.state();
    assert!(state.habits.is_empty());
    assert!(state.loading);
    assert!(!state.is_initialized);

    assert!(in_flight.await.unwrap().is_none());
    assert!(engine.state().habits.is_empty());

    let state = engine.refresh(true, true).await.unwrap();
    assert_eq!(state.habits.len(), 1);
    assert_eq!(state.habits[0].id, "other");
}

#[tokio::test(start_paused = true)]
async fn logout_resets_to_signed_out_state() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store).await;

    engine.dispose_on_logout();

    let state = engine.state();
    assert!(engine.user().is_none());
    assert!(state.habits.is_empty());
    assert!(!state.loading);
}

// --- Mutations ---

#[tokio::test(start_paused = true)]
async fn toggle_completes_and_bumps_streak() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    sleep(Duration::from_millis(600)).await;

    engine.toggle_completion("h1").await.unwrap();

    assert!(engine.state().is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (3, 3));
    assert!(store.has_completion("u1", "h1", today()));
    assert_eq!(store.habit("u1", "h1").unwrap().current_streak, 3);

    // quiet confirm refresh lands after the configured delay
    let calls = store.calls(StoreOp::ListHabits);
    sleep(Duration::from_millis(400)).await;
    assert_eq!(store.calls(StoreOp::ListHabits), calls + 1);
    assert_eq!(streak(&engine, "h1"), (3, 3));
    assert!(engine.state().is_completed("h1", today()));
}

#[tokio::test(start_paused = true)]
async fn write_during_running_fetch_is_not_lost() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    sleep(Duration::from_secs(1)).await;

    // completions are read before the write, habits after it
    store.push_latency(StoreOp::ListHabits, Duration::from_millis(1000));
    let slow = engine.clone();
    tokio::spawn(async move { slow.refresh(false, true).await });
    sleep(Duration::from_millis(10)).await;

    engine.toggle_completion("h1").await.unwrap();
    sleep(Duration::from_secs(2)).await;

    let state = engine.state();
    assert!(store.has_completion("u1", "h1", today()));
    assert!(state.is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (3, 3));

    // the pre-write fetch was not cached either
    sleep(Duration::from_secs(1)).await;
    let state = engine.refresh(false, false).await.unwrap();
    assert!(state.is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (3, 3));
}

#[tokio::test(start_paused = true)]
async fn toggle_twice_undoes_completion() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    engine.toggle_completion("h1").await.unwrap();
    engine.toggle_completion("h1").await.unwrap();

    assert!(!engine.state().is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (2, 3));
    assert!(!store.has_completion("u1", "h1", today()));
}

#[tokio::test(start_paused = true)]
async fn optimistic_state_is_visible_before_write_lands() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    store.set_latency(StoreOp::InsertCompletion, Duration::from_millis(100));

    let e = engine.clone();
    let task = tokio::spawn(async move { e.toggle_completion("h1").await });
    sleep(Duration::from_millis(10)).await;

    assert!(engine.state().is_completed("h1", today()));
    assert!(engine.is_pending("h1", ActionKind::Toggle));
    assert!(!store.has_completion("u1", "h1", today()));

    task.await.unwrap().unwrap();
    assert!(store.has_completion("u1", "h1", today()));
    assert!(!engine.is_pending("h1", ActionKind::Toggle));
}

#[tokio::test(start_paused = true)]
async fn concurrent_toggles_share_one_write() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    store.set_latency(StoreOp::InsertCompletion, Duration::from_millis(100));

    let (a, b) = tokio::join!(
        engine.toggle_completion("h1"),
        engine.toggle_completion("h1")
    );

    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));
    assert_eq!(store.calls(StoreOp::InsertCompletion), 1);
    assert!(engine.state().is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (3, 3));
}

#[tokio::test(start_paused = true)]
async fn rejected_write_rolls_back_and_reports() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    store.fail_next(
        StoreOp::InsertCompletion,
        RemoteError::Rejected("constraint".into()),
    );
    let err = engine.toggle_completion("h2").await.unwrap_err();

    assert_eq!(
        err,
        SyncError::Remote(RemoteError::Rejected("constraint".into()))
    );
    let state = engine.state();
    assert!(!state.is_completed("h2", today()));
    assert_eq!(streak(&engine, "h2"), (3, 5));
    assert_eq!(state.error, Some(err.to_string()));
    assert!(!engine.is_pending("h2", ActionKind::Toggle));
}

#[tokio::test(start_paused = true)]
async fn hung_write_times_out_and_rolls_back() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    store.set_hang(StoreOp::InsertCompletion, true);

    let err = engine.toggle_completion("h1").await.unwrap_err();

    assert_eq!(err, SyncError::MutationTimeout(Duration::from_secs(8)));
    assert!(!engine.state().is_completed("h1", today()));
    assert_eq!(streak(&engine, "h1"), (2, 2));
    assert!(!store.has_completion("u1", "h1", today()));
}

#[tokio::test(start_paused = true)]
async fn unknown_habit_is_rejected_without_writes() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    assert_eq!(
        engine.log_failure("missing", "n/a").await,
        Err(SyncError::UnknownHabit("missing".into()))
    );
    assert_eq!(store.write_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn log_then_undo_failure() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    engine.log_failure("h1", "tired").await.unwrap();
    let state = engine.state();
    assert!(state.has_failed("h1", today()));
    assert_eq!(state.failure("h1", today()).unwrap().reason, "tired");
    assert_eq!(streak(&engine, "h1"), (0, 2));
    assert_eq!(store.habit("u1", "h1").unwrap().current_streak, 0);

    engine.undo_failure("h1").await.unwrap();
    assert!(!engine.state().has_failed("h1", today()));
    assert!(!store.has_failure("u1", "h1", today()));
    // undo does not bring the streak back
    assert_eq!(streak(&engine, "h1"), (0, 2));
}

#[tokio::test(start_paused = true)]
async fn completion_and_failure_stay_exclusive() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;

    engine.toggle_completion("h1").await.unwrap();
    assert_exclusive(&engine, &store, "h1");

    engine.log_failure("h1", "relapse").await.unwrap();
    assert_exclusive(&engine, &store, "h1");
    assert!(!engine.state().is_completed("h1", today()));
    assert!(!store.has_completion("u1", "h1", today()));

    engine.toggle_completion("h1").await.unwrap();
    assert_exclusive(&engine, &store, "h1");
    assert!(engine.state().is_completed("h1", today()));
    assert!(!store.has_failure("u1", "h1", today()));
    assert_eq!(streak(&engine, "h1"), (1, 3));

    // a later refresh agrees with the local view
    sleep(Duration::from_secs(1)).await;
    let state = engine.refresh(false, true).await.unwrap();
    assert!(state.is_completed("h1", today()));
    assert!(!state.has_failed("h1", today()));
}

#[tokio::test(start_paused = true)]
async fn toggle_with_other_date_selected_reads_today_from_store() {
    let mut seed = seed();
    seed.completions.push(SeedCompletion {
        habit_id: "h1".into(),
        date: today(),
    });
    let store = Arc::new(MemoryStore::with_seed("u1", seed));
    let engine = ready(store.clone()).await;
    sleep(Duration::from_millis(600)).await;
    engine.select_date(yesterday()).await.unwrap();

    engine.toggle_completion("h1").await.unwrap();

    assert!(!store.has_completion("u1", "h1", today()));
    assert!(engine.state().completions.is_empty());
    assert_eq!(streak(&engine, "h1"), (1, 2));
}

// --- Refresh scheduler ---

#[tokio::test(start_paused = true)]
async fn scheduler_debounces_throttles_and_replays() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let engine = ready(store.clone()).await;
    sleep(Duration::from_secs(1)).await;
    let scheduler = engine.spawn_refresh_scheduler();

    // burst collapses into one run
    for _ in 0..3 {
        scheduler.request(false, false);
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.runs(), 1);

    // inside the throttle window: dropped unless forced
    scheduler.request(false, false);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.runs(), 1);

    scheduler.request(false, true);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.runs(), 2);

    // requests during a run are replayed once afterwards
    sleep(Duration::from_secs(1)).await;
    store.push_latency(StoreOp::ListHabits, Duration::from_millis(200));
    scheduler.request(false, true);
    sleep(Duration::from_millis(60)).await;
    assert_eq!(scheduler.runs(), 3);
    scheduler.request(false, false);
    scheduler.request(true, false);
    sleep(Duration::from_millis(700)).await;
    assert_eq!(scheduler.runs(), 4);
    assert!(!engine.state().loading);
}

#[tokio::test(start_paused = true)]
async fn queued_refresh_reaches_the_store_after_the_run() {
    let store = Arc::new(MemoryStore::with_seed("u1", seed()));
    let config = SyncConfig {
        cache_ttl_ms: 0,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::with_today(store.clone(), config, Arc::new(today));
    engine.set_user(Some("u1".into()));
    engine.refresh(true, true).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    let scheduler = engine.spawn_refresh_scheduler();

    store.push_latency(StoreOp::ListHabits, Duration::from_millis(100));
    scheduler.request(false, true);
    sleep(Duration::from_millis(60)).await;
    scheduler.request(false, false);
    let before = store.calls(StoreOp::ListHabits);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(scheduler.runs(), 2);
    assert_eq!(store.calls(StoreOp::ListHabits), before + 1);
}
