//! EvoBot - Evolutionary Trading Population Backend
//!
//! A pool of parameterized agents evaluates market conditions each cycle,
//! their trade history is scored into fitness, and generations roll over
//! through forced liquidation and breeding. Every subcommand is one
//! short-lived invocation fired by an external scheduler; all state that
//! must survive between invocations lives in the SQLite ledger.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evobot_backend::breeding::GeneticBreeder;
use evobot_backend::config::AppConfig;
use evobot_backend::engine::drought::{assess, DroughtWindows, KillInputs};
use evobot_backend::engine::{CycleOrchestrator, CycleOutcome};
use evobot_backend::execution::{PaperExecutionAdapter, PaperExecutionConfig};
use evobot_backend::fitness::FitnessEngine;
use evobot_backend::ledger::LedgerDb;
use evobot_backend::lifecycle::{LifecycleManager, LifecycleOutcome};
use evobot_backend::market::LedgerSnapshotProvider;

#[derive(Parser, Debug)]
#[command(name = "evobot")]
#[command(about = "Evolutionary trading population backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one decision cycle for the active generation
    Cycle,

    /// Score and rank the active generation's agents
    Fitness,

    /// Check generation end conditions; liquidate and roll if one tripped
    Lifecycle,

    /// Read-only summary: generation, cohort, equity, drought, recent events
    Status,

    /// Create the account, the first generation, and the seed cohort
    Init,

    /// Open a time-boxed, single-use live-order window
    Arm {
        /// Session lifetime in minutes (default: runtime config value)
        #[arg(long)]
        minutes: Option<i64>,

        /// Orders the session may clear before it is spent
        #[arg(long, default_value_t = 1)]
        orders: i64,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evobot_backend=debug,evobot=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let app = AppConfig::from_env().context("load environment configuration")?;
    let db = LedgerDb::new(&app.database_path)
        .with_context(|| format!("open ledger at {}", app.database_path))?;
    let now = Utc::now().timestamp();

    match cli.command {
        Commands::Cycle => run_cycle(db, app, now).await,
        Commands::Fitness => run_fitness(db, app, now),
        Commands::Lifecycle => run_lifecycle(db, app, now),
        Commands::Status => show_status(db, app, now),
        Commands::Init => run_init(db, app, now),
        Commands::Arm { minutes, orders } => run_arm(db, minutes, orders, now),
    }
}

/// One scheduled decision tick. The paper adapter is wired here; the
/// orchestrator itself only sees the `ExecutionAdapter` trait.
async fn run_cycle(db: LedgerDb, app: AppConfig, now: i64) -> Result<()> {
    let provider = Arc::new(LedgerSnapshotProvider::new(db.clone()));
    let execution = Arc::new(PaperExecutionAdapter::new(PaperExecutionConfig::from_env()));
    let orchestrator = CycleOrchestrator::new(db, provider, execution, app);

    match orchestrator.run_cycle(now).await? {
        CycleOutcome::Skipped(reason) => info!("Cycle skipped: {}", reason),
        CycleOutcome::Held => info!("🎯 Cycle complete: held"),
        CycleOutcome::Dispatched { order_id } => {
            info!("🎯 Cycle complete: dispatched order {}", order_id)
        }
    }
    Ok(())
}

/// Score the active cohort and persist the report to the event log, where
/// dashboards and the next lifecycle run can read it.
fn run_fitness(db: LedgerDb, app: AppConfig, now: i64) -> Result<()> {
    let cfg = db.load_runtime_config()?;
    let Some(generation) = db.get_active_generation()? else {
        info!("Fitness skipped: no active generation");
        return Ok(());
    };

    let agents = db.list_active_agents(&generation.id)?;
    let engine = FitnessEngine::new(db.clone());
    let reports = engine.rank_generation(&generation.id, &cfg, app.symbols.len())?;

    info!(
        "📊 Fitness report for generation {} ({} agents):",
        generation.number,
        reports.len()
    );
    for (rank, report) in reports.iter().enumerate() {
        let name = agents
            .iter()
            .find(|a| a.id == report.agent_id)
            .map(|a| a.name.as_str())
            .unwrap_or("?");
        info!(
            "  #{:<2} {:<24} score {:+.4} (pnl ${:+.2}, {} fills, dd {:.1}%)",
            rank + 1,
            name,
            report.score,
            report.metrics.total_pnl,
            report.metrics.trade_count,
            report.metrics.max_drawdown * 100.0
        );
    }

    let scores: Vec<serde_json::Value> = reports
        .iter()
        .map(|r| {
            json!({
                "agent_id": r.agent_id,
                "score": r.score,
                "real_score": r.real_score,
                "shadow_score": r.shadow_score,
                "total_pnl": r.metrics.total_pnl,
                "trade_count": r.metrics.trade_count,
            })
        })
        .collect();
    db.log_event(
        "fitness_report",
        json!({ "generation_id": generation.id, "scores": scores }),
        now,
    )?;
    Ok(())
}

fn run_lifecycle(db: LedgerDb, app: AppConfig, now: i64) -> Result<()> {
    let symbols = app.symbols.len();
    let breeder = Arc::new(GeneticBreeder::new(db.clone(), symbols));
    let manager = LifecycleManager::new(db, breeder, app);

    match manager.run(now)? {
        LifecycleOutcome::Skipped(reason) => info!("Lifecycle skipped: {}", reason),
        LifecycleOutcome::NoChange => info!("Lifecycle: generation continues"),
        LifecycleOutcome::Rolled {
            ended_generation,
            new_generation,
            reason,
        } => info!(
            "🔄 Generation rolled ({}): {} -> {}",
            reason.as_str(),
            ended_generation,
            new_generation
        ),
        LifecycleOutcome::Resumed { new_generation } => {
            info!("🔄 Resumed interrupted hand-off into {}", new_generation)
        }
    }
    Ok(())
}

/// Operator-facing snapshot. Reads only; the drought facet is recomputed
/// from the same pure assessment the cycle uses, without touching the
/// watermark.
fn show_status(db: LedgerDb, app: AppConfig, now: i64) -> Result<()> {
    let cfg = db.load_runtime_config()?;

    println!("=== EvoBot Status ===");
    println!(
        "System: {} / {} mode / live trading {}",
        cfg.system_status.as_str(),
        cfg.trading_mode.as_str(),
        if cfg.live_trading_enabled { "ENABLED" } else { "disabled" }
    );

    match db.get_active_generation()? {
        Some(generation) => {
            let agents = db.list_active_agents(&generation.id)?;
            let explorers = agents
                .iter()
                .filter(|a| a.role == evobot_backend::models::AgentRole::Explorer)
                .count();
            let trades = db.count_learnable_orders(&generation.id)?;
            let elapsed_days = (now - generation.started_at) as f64 / 86_400.0;
            println!(
                "Generation {} ({}): {} agents ({} explorers), {} learnable trades, day {:.1}/{}",
                generation.number,
                generation.status.as_str(),
                agents.len(),
                explorers,
                trades,
                elapsed_days,
                cfg.generation_max_days
            );
        }
        None => println!("Generation: none active"),
    }

    if let Some(account) = db.get_account(&app.account_id)? {
        match db.latest_nav()? {
            Some(nav) => println!(
                "Equity: ${:.2} (cash ${:.2}, positions ${:.2}); peak ${:.2}",
                nav.equity, nav.cash, nav.positions_value, cfg.peak_equity
            ),
            None => println!("Equity: cash ${:.2}, no NAV snapshots yet", account.cash),
        }
    } else {
        println!("Account: not initialized (run `evobot init`)");
    }

    let (short_holds, short_orders) = db.decision_counts_last_n(cfg.drought_short_window_cycles)?;
    let (long_holds, long_orders) =
        db.decision_counts_since(now - cfg.drought_long_window_hours * 3600)?;
    let windows = DroughtWindows {
        short_holds,
        short_orders,
        long_holds,
        long_orders,
    };
    let kill = KillInputs {
        equity: db.latest_nav()?.map(|n| n.equity).unwrap_or(cfg.peak_equity),
        peak_equity: cfg.peak_equity,
        max_volatility_ratio: 0.0,
    };
    let drought = assess(&cfg, &windows, &kill, now);
    println!(
        "Drought: detected={} active={} blocked={} killed={} [{}] (short {}/{} holds/orders, long {}/{})",
        drought.detected,
        drought.active,
        drought.blocked,
        drought.killed,
        drought.reasons.join(", "),
        short_holds,
        short_orders,
        long_holds,
        long_orders
    );
    if !cfg.tuning.offsets.is_empty() {
        let mut offsets: Vec<(&String, &f64)> = cfg.tuning.offsets.iter().collect();
        offsets.sort_by(|a, b| a.0.cmp(b.0));
        let rendered: Vec<String> =
            offsets.iter().map(|(g, o)| format!("{} {:+.2}", g, o)).collect();
        println!("Tuner offsets: {}", rendered.join(", "));
    }

    match db.latest_valid_arm_session(now)? {
        Some(session) => println!(
            "Arm session: {} valid until {}",
            session.id,
            format_ts(session.expires_at)
        ),
        None => println!("Arm session: none valid"),
    }

    println!("Recent events:");
    for event in db.recent_events(10)? {
        println!("  {} {} {}", format_ts(event.ts), event.action, event.metadata);
    }
    Ok(())
}

/// First-run bootstrap: account, generation 1, seed cohort. Safe to re-run;
/// an existing active generation makes it a no-op.
fn run_init(db: LedgerDb, app: AppConfig, now: i64) -> Result<()> {
    db.ensure_account(&app.account_id, app.starting_capital, now)?;

    if let Some(generation) = db.get_active_generation()? {
        info!(
            "Init skipped: generation {} already active",
            generation.number
        );
        return Ok(());
    }

    let generation = db.create_generation(now)?;
    let breeder = GeneticBreeder::new(db.clone(), app.symbols.len());
    let created = breeder.seed_initial(&generation.id, app.starting_capital, now)?;
    if !db.activate_generation(&generation.id)? {
        warn!("Generation {} was activated elsewhere", generation.id);
    }

    db.log_event(
        "init",
        json!({
            "generation_id": generation.id,
            "agents_created": created,
            "starting_capital": app.starting_capital,
        }),
        now,
    )?;
    info!(
        "🚀 Initialized: account '{}' with ${:.2}, generation {} seeded with {} agents",
        app.account_id, app.starting_capital, generation.number, created
    );
    Ok(())
}

/// Create the canary window for one live order. Prints the session id and
/// expiry; key material never passes through this path.
fn run_arm(db: LedgerDb, minutes: Option<i64>, orders: i64, now: i64) -> Result<()> {
    let cfg = db.load_runtime_config()?;
    let ttl_minutes = minutes.unwrap_or(cfg.arm_session_minutes);

    let session = db.create_arm_session(ttl_minutes, orders, now)?;
    db.log_event(
        "arm_session_created",
        json!({
            "session_id": session.id,
            "expires_at": session.expires_at,
            "max_orders": session.max_orders,
        }),
        now,
    )?;

    println!("Armed: session {}", session.id);
    println!(
        "Valid until {} ({} minute{})",
        format_ts(session.expires_at),
        ttl_minutes,
        if ttl_minutes == 1 { "" } else { "s" }
    );
    println!(
        "Caps: ${:.2}/trade, ${:.2}/day, {} order{}",
        cfg.canary_max_notional_per_trade,
        cfg.canary_max_notional_per_day,
        session.max_orders,
        if session.max_orders == 1 { "" } else { "s" }
    );
    if !cfg.live_trading_enabled {
        warn!("⚠️ Live trading is disabled in runtime config; the session will block at the first gate");
    }
    Ok(())
}

fn format_ts(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
