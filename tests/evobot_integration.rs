//! Integration tests for the evobot decision/lifecycle flow.
//!
//! These tests run the real components against file-backed SQLite ledgers:
//! a full decision cycle through dispatch, bucket idempotency across repeat
//! invocations, the arm-session single-use guarantee across independent
//! connections, and a complete generation rollover with forced liquidation.

use std::sync::Arc;

use tempfile::NamedTempFile;

use evobot_backend::breeding::GeneticBreeder;
use evobot_backend::config::AppConfig;
use evobot_backend::execution::{PaperExecutionAdapter, PaperExecutionConfig};
use evobot_backend::fitness::FitnessEngine;
use evobot_backend::ledger::LedgerDb;
use evobot_backend::lifecycle::{LifecycleManager, LifecycleOutcome};
use evobot_backend::market::{FixedSnapshotProvider, MarketSnapshot};
use evobot_backend::models::{
    reasons, Agent, AgentRole, AgentStatus, FillRecord, GenerationStatus, OrderRecord,
    OrderSide, OrderStatus, StrategyTemplate, TerminationReason, TradeMode,
};
use evobot_backend::{CycleOrchestrator, CycleOutcome};

fn temp_ledger() -> (LedgerDb, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let db = LedgerDb::new(file.path().to_str().unwrap()).unwrap();
    (db, file)
}

fn app_config(db_path: &str) -> AppConfig {
    AppConfig {
        database_path: db_path.to_string(),
        account_id: "primary".to_string(),
        symbols: vec!["BTC-USD".to_string(), "ETH-USD".to_string()],
        decision_interval_secs: 300,
        starting_capital: 10_000.0,
        exchange_base_url: "http://localhost".to_string(),
        exchange_timeout_secs: 5,
    }
}

fn bullish_snapshot(symbol: &str, price: f64, updated_at: i64) -> MarketSnapshot {
    MarketSnapshot {
        symbol: symbol.to_string(),
        price,
        change_24h: 3.0,
        volume_24h: 5_000_000.0,
        trend_slope: 0.5,
        volatility_ratio: 1.2,
        regime: "trending".to_string(),
        updated_at,
    }
}

/// Momentum agent whose gene thresholds pass against `bullish_snapshot`.
fn permissive_agent(generation_id: &str, now: i64) -> Agent {
    Agent {
        id: "agent-momo".to_string(),
        generation_id: generation_id.to_string(),
        name: "momo".to_string(),
        template: StrategyTemplate::Momentum,
        genes: [
            ("momentum_change".to_string(), 2.0),
            ("momentum_trend".to_string(), 0.1),
            ("momentum_volume".to_string(), 500_000.0),
            ("momentum_volatility".to_string(), 2.5),
            ("position_fraction".to_string(), 0.1),
        ]
        .into_iter()
        .collect(),
        capital_allocation: 2_000.0,
        role: AgentRole::Core,
        status: AgentStatus::Active,
        created_at: now,
    }
}

/// Account + active generation + one agent that will buy on a bullish tape.
fn seed_world(db: &LedgerDb, app: &AppConfig, now: i64) -> String {
    db.ensure_account(&app.account_id, app.starting_capital, now)
        .unwrap();
    let generation = db.create_generation(now).unwrap();
    assert!(db.activate_generation(&generation.id).unwrap());
    db.insert_agents(std::slice::from_ref(&permissive_agent(&generation.id, now)))
        .unwrap();
    generation.id
}

fn orchestrator(db: &LedgerDb, app: &AppConfig, snapshots: Vec<MarketSnapshot>) -> CycleOrchestrator {
    let mut exec_cfg = PaperExecutionConfig::default();
    exec_cfg.base_latency_ms = 0;
    exec_cfg.latency_jitter_ms = 0;
    exec_cfg.reject_prob = 0.0;
    exec_cfg.partial_fill_prob = 0.0;
    CycleOrchestrator::new(
        db.clone(),
        Arc::new(FixedSnapshotProvider::new(snapshots)),
        Arc::new(PaperExecutionAdapter::new(exec_cfg)),
        app.clone(),
    )
}

#[tokio::test]
async fn test_full_cycle_dispatches_and_books_the_fill() {
    let (db, file) = temp_ledger();
    let app = app_config(file.path().to_str().unwrap());
    let now = 1_700_000_000;
    seed_world(&db, &app, now);

    let orch = orchestrator(&db, &app, vec![bullish_snapshot("BTC-USD", 50_000.0, now)]);
    let outcome = orch.run_cycle(now).await.unwrap();
    let CycleOutcome::Dispatched { order_id } = outcome else {
        panic!("expected a dispatched order, got {:?}", outcome);
    };
    assert!(db.order_exists(&order_id).unwrap());

    // The fill's ledger impact landed atomically: position open, cash down.
    let position = db.get_position("primary", "BTC-USD").unwrap().unwrap();
    assert!(position.quantity > 0.0);
    let account = db.get_account("primary").unwrap().unwrap();
    assert!(
        account.cash < app.starting_capital,
        "cash should drop after a buy, still {}",
        account.cash
    );

    // The decision event references the order; the NAV trail advanced.
    let events = db.recent_decision_events(5).unwrap();
    assert_eq!(events[0].order_id.as_deref(), Some(order_id.as_str()));
    assert!(db.latest_nav().unwrap().is_some());
}

#[tokio::test]
async fn test_repeat_invocation_in_same_bucket_is_idempotent() {
    let (db, file) = temp_ledger();
    let app = app_config(file.path().to_str().unwrap());
    // Aligned to a bucket boundary so every offset below stays in-bucket.
    let now = 1_699_999_800;
    seed_world(&db, &app, now);

    let orch = orchestrator(&db, &app, vec![bullish_snapshot("BTC-USD", 50_000.0, now)]);
    let first = orch.run_cycle(now).await.unwrap();
    assert!(matches!(first, CycleOutcome::Dispatched { .. }));

    // Same bucket, same world: a crashed-and-restarted scheduler must not
    // double-trade. A later tick in the same interval hits the same bucket.
    for offset in [0, 1, app.decision_interval_secs as i64 - 1] {
        let again = orch.run_cycle(now + offset).await.unwrap();
        assert_eq!(
            again,
            CycleOutcome::Skipped("bucket_already_decided".to_string()),
            "offset {} should land in the decided bucket",
            offset
        );
    }

    let (_, orders) = db.decision_counts_since(0).unwrap();
    assert_eq!(orders, 1, "exactly one order across repeat invocations");
}

#[test]
fn test_arm_session_is_single_use_across_connections() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let db = LedgerDb::new(&path).unwrap();
    let session = db.create_arm_session(10, 1, 1_000).unwrap();

    // Two independent connections to the same ledger race to spend the same
    // session, as two concurrently deployed processes would.
    let mut handles = Vec::new();
    for requester in ["req-a", "req-b"] {
        let path = path.clone();
        let session_id = session.id.clone();
        handles.push(std::thread::spawn(move || {
            let db = LedgerDb::new(&path).unwrap();
            db.spend_arm_session(&session_id, requester, 1_010).unwrap()
        }));
    }

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|o| o.success).count();
    assert_eq!(winners, 1, "exactly one spend may succeed");

    let loser = outcomes.iter().find(|o| !o.success).unwrap();
    assert_eq!(
        loser.reason.as_deref(),
        Some(reasons::CANARY_ALREADY_CONSUMED)
    );

    // The winner's request id is the one durably recorded.
    let spent = db.get_arm_session(&session.id).unwrap().unwrap();
    assert!(spent.is_spent());
    let recorded = spent.spent_by_request_id.unwrap();
    assert!(recorded == "req-a" || recorded == "req-b");
}

#[test]
fn test_generation_rollover_liquidates_and_breeds_successor() {
    let (db, file) = temp_ledger();
    let app = app_config(file.path().to_str().unwrap());
    let now = 1_700_000_000;

    db.ensure_account(&app.account_id, app.starting_capital, now)
        .unwrap();
    let generation = db.create_generation(now).unwrap();
    let breeder = Arc::new(GeneticBreeder::new(db.clone(), app.symbols.len()));
    let seeded = breeder.seed_initial(&generation.id, app.starting_capital, now).unwrap();
    assert_eq!(seeded, 8);
    assert!(db.activate_generation(&generation.id).unwrap());

    // One learnable fill, then drop the trade limit beneath it.
    let agent = db.list_active_agents(&generation.id).unwrap()[0].clone();
    let order = OrderRecord {
        id: "ord-legit".to_string(),
        account_id: app.account_id.clone(),
        agent_id: agent.id.clone(),
        generation_id: generation.id.clone(),
        symbol: "BTC-USD".to_string(),
        side: OrderSide::Buy,
        quantity: 0.01,
        mode: TradeMode::Paper,
        tags: Vec::new(),
        is_learnable: true,
        status: OrderStatus::Filled,
        reject_reason: None,
        created_at: now,
    };
    let fill = FillRecord {
        id: "ord-legit-fill".to_string(),
        order_id: "ord-legit".to_string(),
        agent_id: agent.id.clone(),
        generation_id: generation.id.clone(),
        symbol: "BTC-USD".to_string(),
        side: OrderSide::Buy,
        quantity: 0.01,
        price: 50_000.0,
        fee: 5.0,
        slippage_pct: 0.0,
        is_learnable: true,
        filled_at: now,
    };
    db.record_execution(&order, Some(&fill)).unwrap();
    db.mutate_runtime_config(now, |c| c.generation_max_trades = 1)
        .unwrap();
    db.upsert_market_snapshot("BTC-USD", 50_000.0, 0.5, 1_000_000.0, 0.1, 1.0, "ranging", now)
        .unwrap();

    let manager = LifecycleManager::new(db.clone(), breeder, app.clone());
    let outcome = manager.run(now + 3_600).unwrap();
    let LifecycleOutcome::Rolled {
        ended_generation,
        new_generation,
        reason,
    } = outcome
    else {
        panic!("expected a rollover, got {:?}", outcome);
    };
    assert_eq!(ended_generation, generation.id);
    assert_eq!(reason, TerminationReason::Trades);

    // The old generation is finalized with its stats in place.
    let ended = db.get_generation(&generation.id).unwrap().unwrap();
    assert_eq!(ended.status, GenerationStatus::Ended);
    assert_eq!(ended.termination_reason, Some(TerminationReason::Trades));
    assert_eq!(ended.trade_count, 1);

    // Forced liquidation flattened the book without polluting the learnable
    // stream, and returned the position's value to cash.
    assert!(db.list_positions(&app.account_id).unwrap().is_empty());
    assert_eq!(db.count_learnable_orders(&generation.id).unwrap(), 1);
    let account = db.get_account(&app.account_id).unwrap().unwrap();
    assert!(
        (account.cash - (app.starting_capital - 5.0)).abs() < 1e-6,
        "liquidation at entry mark should leave only the buy fee missing, cash {}",
        account.cash
    );

    // The successor cohort is live.
    let successor = db.get_generation(&new_generation).unwrap().unwrap();
    assert_eq!(successor.status, GenerationStatus::Active);
    assert_eq!(db.list_active_agents(&new_generation).unwrap().len(), 8);
    assert_eq!(db.get_active_generation().unwrap().unwrap().id, new_generation);
}

#[test]
fn test_fitness_ranks_the_profitable_agent_first() {
    let (db, file) = temp_ledger();
    let app = app_config(file.path().to_str().unwrap());
    let now = 1_700_000_000;

    db.ensure_account(&app.account_id, app.starting_capital, now)
        .unwrap();
    let generation = db.create_generation(now).unwrap();
    assert!(db.activate_generation(&generation.id).unwrap());

    let mut winner = permissive_agent(&generation.id, now);
    winner.id = "agent-winner".to_string();
    let mut loser = permissive_agent(&generation.id, now);
    loser.id = "agent-loser".to_string();
    db.insert_agents(&[winner.clone(), loser.clone()]).unwrap();

    // Winner: round trip up 2%. Loser: round trip down 2%. Spread the legs a
    // day apart so both agents produce meaningful daily returns.
    let day = 86_400;
    for (agent_id, entry, exit) in [
        ("agent-winner", 50_000.0, 51_000.0),
        ("agent-loser", 50_000.0, 49_000.0),
    ] {
        for (i, (side, price)) in [(OrderSide::Buy, entry), (OrderSide::Sell, exit)]
            .into_iter()
            .enumerate()
        {
            let ts = now + i as i64 * day;
            let order_id = format!("{}-{}", agent_id, i);
            let order = OrderRecord {
                id: order_id.clone(),
                account_id: app.account_id.clone(),
                agent_id: agent_id.to_string(),
                generation_id: generation.id.clone(),
                symbol: "BTC-USD".to_string(),
                side,
                quantity: 0.01,
                mode: TradeMode::Paper,
                tags: Vec::new(),
                is_learnable: true,
                status: OrderStatus::Filled,
                reject_reason: None,
                created_at: ts,
            };
            let fill = FillRecord {
                id: format!("{}-fill", order_id),
                order_id,
                agent_id: agent_id.to_string(),
                generation_id: generation.id.clone(),
                symbol: "BTC-USD".to_string(),
                side,
                quantity: 0.01,
                price,
                fee: 1.0,
                slippage_pct: 0.0,
                is_learnable: true,
                filled_at: ts,
            };
            db.record_execution(&order, Some(&fill)).unwrap();
        }
    }

    let cfg = db.load_runtime_config().unwrap();
    let engine = FitnessEngine::new(db.clone());
    let reports = engine
        .rank_generation(&generation.id, &cfg, app.symbols.len())
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].agent_id, "agent-winner");
    assert_eq!(reports[1].agent_id, "agent-loser");
    assert!(
        reports[0].score > reports[1].score,
        "winner {} must outrank loser {}",
        reports[0].score,
        reports[1].score
    );
}

#[test]
fn test_crash_between_end_and_activate_resumes_cleanly() {
    let (db, file) = temp_ledger();
    let app = app_config(file.path().to_str().unwrap());
    let now = 1_700_000_000;

    db.ensure_account(&app.account_id, app.starting_capital, now)
        .unwrap();
    let breeder = Arc::new(GeneticBreeder::new(db.clone(), app.symbols.len()));

    // Simulate the crash window: an ended generation exists, its successor
    // was never created. The next scheduled run must repair the hand-off.
    let generation = db.create_generation(now).unwrap();
    breeder.seed_initial(&generation.id, app.starting_capital, now).unwrap();
    assert!(db.activate_generation(&generation.id).unwrap());
    assert!(db.begin_ending_generation(&generation.id).unwrap());
    assert!(db
        .end_generation(&generation.id, TerminationReason::Time, 0.0, 0, 0.0, now)
        .unwrap());
    db.retire_agents(&generation.id).unwrap();

    let manager = LifecycleManager::new(db.clone(), breeder, app.clone());
    let outcome = manager.run(now + 60).unwrap();
    let LifecycleOutcome::Resumed { new_generation } = outcome else {
        panic!("expected a resumed hand-off, got {:?}", outcome);
    };

    let successor = db.get_generation(&new_generation).unwrap().unwrap();
    assert_eq!(successor.status, GenerationStatus::Active);
    assert!(!db.list_active_agents(&new_generation).unwrap().is_empty());

    // Idle state afterwards: a further run changes nothing.
    db.upsert_market_snapshot("BTC-USD", 50_000.0, 0.5, 1_000_000.0, 0.1, 1.0, "ranging", now)
        .unwrap();
    let again = manager.run(now + 120).unwrap();
    assert_eq!(again, LifecycleOutcome::NoChange);
}
