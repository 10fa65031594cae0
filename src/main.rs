use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use habit_sync::sync::StoreOp;
use habit_sync::{HabitState, MemoryStore, Seed, SyncConfig, SyncEngine};

const DEFAULT_SEED: &str = r#"{
    "habits": [
        { "id": "read", "name": "Read 20 pages", "current_streak": 2, "longest_streak": 4 },
        { "id": "run", "name": "Morning run", "current_streak": 5, "longest_streak": 5,
          "frequency": ["mon", "wed", "fri", "sun"] },
        { "id": "water", "name": "Drink water", "current_streak": 0, "longest_streak": 9 }
    ]
}"#;

const ALL_OPS: [StoreOp; 8] = [
    StoreOp::ListHabits,
    StoreOp::ListCompletions,
    StoreOp::ListFailures,
    StoreOp::InsertCompletion,
    StoreOp::DeleteCompletion,
    StoreOp::UpsertFailure,
    StoreOp::DeleteFailure,
    StoreOp::UpdateHabitStreak,
];

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// JSON file with habits, completions and failures for the in-memory store
    #[arg(long)]
    seed: Option<PathBuf>,

    #[arg(long, default_value = "demo-user")]
    user: String,

    /// JSON file overriding the sync timings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated latency of every store call
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print today's habits
    Show,
    /// Mark a habit done today, or undo it
    Toggle { habit: String },
    /// Log today's failure for a habit
    Fail { habit: String, reason: String },
    /// Remove today's failure for a habit
    Undo { habit: String },
    /// Run the toggle and log/undo scenarios against the first two habits
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    let seed = load_seed(args.seed.as_ref())?;

    let store = Arc::new(MemoryStore::with_seed(args.user.clone(), seed));
    if args.latency_ms > 0 {
        for op in ALL_OPS {
            store.set_latency(op, Duration::from_millis(args.latency_ms));
        }
    }

    let engine = SyncEngine::new(store.clone(), config);
    engine.set_user(Some(args.user.clone()));

    log::info!("[CLI] user={} command={:?}", args.user, args.command);
    let state = engine
        .refresh(true, true)
        .await
        .context("initial refresh was skipped")?;
    if let Some(err) = &state.error {
        bail!("initial refresh failed: {}", err);
    }

    match args.command {
        Command::Show => print_state(&state),
        Command::Toggle { habit } => {
            engine.toggle_completion(&habit).await?;
            print_state(&engine.state());
        }
        Command::Fail { habit, reason } => {
            engine.log_failure(&habit, &reason).await?;
            print_state(&engine.state());
        }
        Command::Undo { habit } => {
            engine.undo_failure(&habit).await?;
            print_state(&engine.state());
        }
        Command::Demo => run_demo(&engine, &store).await?,
    }

    Ok(())
}

fn load_seed(path: Option<&PathBuf>) -> Result<Seed> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading seed {}", path.display()))?,
        None => DEFAULT_SEED.to_string(),
    };
    serde_json::from_str(&raw).context("invalid seed")
}

struct Step {
    label: String,
    elapsed: Duration,
    done: bool,
    failed: bool,
    streak: (u32, u32),
    writes: usize,
}

async fn run_demo(engine: &SyncEngine<MemoryStore>, store: &MemoryStore) -> Result<()> {
    let state = engine.state();
    let mut ids = state.habits.iter().map(|h| h.id.clone());
    let (Some(first), Some(second)) = (ids.next(), ids.next()) else {
        bail!("demo needs at least two habits");
    };

    let mut steps = vec![snapshot_step(engine, store, "start", &first, Duration::ZERO)];

    let t0 = Instant::now();
    engine.toggle_completion(&first).await?;
    steps.push(snapshot_step(engine, store, "toggle", &first, t0.elapsed()));

    let t0 = Instant::now();
    engine.toggle_completion(&first).await?;
    steps.push(snapshot_step(engine, store, "toggle again", &first, t0.elapsed()));

    steps.push(snapshot_step(engine, store, "start", &second, Duration::ZERO));

    let t0 = Instant::now();
    engine.log_failure(&second, "demo").await?;
    steps.push(snapshot_step(engine, store, "log failure", &second, t0.elapsed()));

    let t0 = Instant::now();
    engine.undo_failure(&second).await?;
    steps.push(snapshot_step(engine, store, "undo failure", &second, t0.elapsed()));

    print_steps(&steps);
    Ok(())
}

fn snapshot_step(
    engine: &SyncEngine<MemoryStore>,
    store: &MemoryStore,
    action: &str,
    habit_id: &str,
    elapsed: Duration,
) -> Step {
    let state = engine.state();
    let today = state.selected_date;
    let streak = state
        .habit(habit_id)
        .map(|h| (h.current_streak, h.longest_streak))
        .unwrap_or_default();
    Step {
        label: format!("{} {}", action, habit_id),
        elapsed,
        done: state.is_completed(habit_id, today),
        failed: state.has_failed(habit_id, today),
        streak,
        writes: store.write_calls(),
    }
}

fn print_steps(steps: &[Step]) {
    println!();
    println!("======================================================================");
    println!("                         OPTIMISTIC SYNC DEMO                         ");
    println!("======================================================================");
    println!(
        "{:<22} | {:<10} | {:<5} | {:<6} | {:<7} | {:<6}",
        "Step", "Time", "Done", "Failed", "Streak", "Writes"
    );
    println!("----------------------------------------------------------------------");
    for s in steps {
        println!(
            "{:<22} | {:<10?} | {:<5} | {:<6} | {:<7} | {:<6}",
            s.label,
            s.elapsed,
            s.done,
            s.failed,
            format!("{}/{}", s.streak.0, s.streak.1),
            s.writes
        );
    }
    println!("======================================================================");
}

fn print_state(state: &HabitState) {
    let date = state.selected_date;
    println!();
    println!("Habits for {} ({} scheduled)", date, state.filtered_habits.len());
    println!("-----------------------------------------------------------");
    println!("{:<12} | {:<22} | {:<8} | {:<7}", "Id", "Name", "Today", "Streak");
    println!("-----------------------------------------------------------");
    for h in &state.filtered_habits {
        let mark = if state.is_completed(&h.id, date) {
            "done"
        } else if let Some(f) = state.failure(&h.id, date) {
            if f.reason.is_empty() {
                "failed"
            } else {
                f.reason.as_str()
            }
        } else {
            "-"
        };
        println!(
            "{:<12} | {:<22} | {:<8} | {}/{}",
            h.id, h.name, mark, h.current_streak, h.longest_streak
        );
    }
    println!("-----------------------------------------------------------");
    if let Some(err) = &state.error {
        println!("Error: {}", err);
    }
}
