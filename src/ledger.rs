use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    reasons, Agent, AgentRole, AgentStatus, ArmSession, ArmSpendOutcome, AccountRecord,
    DecisionEvent, DecisionKind, DroughtSnapshot, FillRecord, GateFailure, Generation,
    GenerationStatus, NavSnapshot, OrderRecord, OrderSide, PositionRecord, RuntimeConfig,
    ShadowTrade, StrategyTemplate, TerminationReason,
};

/// Position quantities below this are treated as fully closed.
const POSITION_EPSILON: f64 = 1e-9;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    cash REAL NOT NULL,
    starting_capital REAL NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    account_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    quantity REAL NOT NULL,
    avg_entry_price REAL NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (account_id, symbol)
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    generation_id TEXT NOT NULL,
    name TEXT NOT NULL,
    template TEXT NOT NULL,
    genes TEXT NOT NULL,
    capital_allocation REAL NOT NULL,
    role TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agents_generation ON agents(generation_id, status);

CREATE TABLE IF NOT EXISTS generations (
    id TEXT PRIMARY KEY,
    number INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    termination_reason TEXT,
    total_pnl REAL NOT NULL DEFAULT 0,
    trade_count INTEGER NOT NULL DEFAULT 0,
    max_drawdown REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_generations_status ON generations(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_generations_number ON generations(number);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    generation_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    mode TEXT NOT NULL,
    tags TEXT NOT NULL,
    is_learnable INTEGER NOT NULL,
    status TEXT NOT NULL,
    reject_reason TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_generation ON orders(generation_id, is_learnable);
CREATE INDEX IF NOT EXISTS idx_orders_agent_ts ON orders(agent_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_orders_created ON orders(created_at DESC);

CREATE TABLE IF NOT EXISTS fills (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    generation_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    price REAL NOT NULL,
    fee REAL NOT NULL,
    slippage_pct REAL NOT NULL,
    is_learnable INTEGER NOT NULL,
    filled_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fills_agent_ts ON fills(agent_id, filled_at ASC);
CREATE INDEX IF NOT EXISTS idx_fills_generation ON fills(generation_id, is_learnable);
CREATE INDEX IF NOT EXISTS idx_fills_filled_at ON fills(filled_at DESC);

CREATE TABLE IF NOT EXISTS decision_events (
    id TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    agent_id TEXT NOT NULL,
    generation_id TEXT NOT NULL,
    symbol TEXT,
    decision TEXT NOT NULL,
    confidence REAL NOT NULL,
    reasons TEXT NOT NULL,
    exit_reason TEXT,
    gate_failures TEXT NOT NULL,
    nearest_miss TEXT,
    drought TEXT NOT NULL,
    order_id TEXT,
    ext TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_created ON decision_events(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_decisions_generation ON decision_events(generation_id, created_at DESC);

CREATE TABLE IF NOT EXISTS arm_sessions (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    max_orders INTEGER NOT NULL,
    spent_at INTEGER,
    spent_by_request_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_arm_sessions_expiry ON arm_sessions(expires_at DESC);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action TEXT NOT NULL,
    ts INTEGER NOT NULL,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_ts ON event_log(ts DESC);
CREATE INDEX IF NOT EXISTS idx_event_log_action ON event_log(action, ts DESC);

CREATE TABLE IF NOT EXISTS runtime_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    document TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS nav_snapshots (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    cash REAL NOT NULL,
    positions_value REAL NOT NULL,
    equity REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nav_snapshots_ts ON nav_snapshots(ts ASC);

CREATE TABLE IF NOT EXISTS shadow_trades (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    generation_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    quantity REAL NOT NULL,
    entry_price REAL NOT NULL,
    created_at INTEGER NOT NULL,
    resolved_at INTEGER,
    exit_price REAL,
    pnl REAL
);
CREATE INDEX IF NOT EXISTS idx_shadow_unresolved ON shadow_trades(resolved_at, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_shadow_agent ON shadow_trades(agent_id, resolved_at);

CREATE TABLE IF NOT EXISTS market_snapshots (
    symbol TEXT PRIMARY KEY,
    price REAL NOT NULL,
    change_24h REAL NOT NULL,
    volume_24h REAL NOT NULL,
    trend_slope REAL NOT NULL,
    volatility_ratio REAL NOT NULL,
    regime TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// One row of the append-only audit/event table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub action: String,
    pub ts: i64,
    pub metadata: serde_json::Value,
}

/// Durable store for the whole population: accounts, positions, orders,
/// fills, agents, generations, telemetry, the arm-session table, and the
/// runtime-config document. All at-most-once transitions are conditional
/// UPDATEs decided by rows_affected, never read-then-write.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        Self::init(conn)
    }

    /// Single shared in-memory connection, handy for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory ledger")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(Duration::from_secs(5)).ok();

        conn.execute_batch(SCHEMA_SQL)
            .context("apply ledger schema")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.ensure_runtime_config_row()?;
        Ok(db)
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub fn ensure_account(
        &self,
        account_id: &str,
        starting_capital: f64,
        now: i64,
    ) -> Result<AccountRecord> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO accounts (id, cash, starting_capital, updated_at)
             VALUES (?1, ?2, ?2, ?3)",
            params![account_id, starting_capital, now],
        )?;
        drop(conn);
        self.get_account(account_id)?
            .ok_or_else(|| anyhow!("account {} missing after ensure", account_id))
    }

    pub fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, cash, starting_capital, updated_at FROM accounts WHERE id = ?1",
        )?;
        let rec = stmt
            .query_row(params![account_id], |row| {
                Ok(AccountRecord {
                    id: row.get(0)?,
                    cash: row.get(1)?,
                    starting_capital: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    pub fn adjust_cash(&self, account_id: &str, delta: f64, now: i64) -> Result<f64> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET cash = cash + ?2, updated_at = ?3 WHERE id = ?1",
            params![account_id, delta, now],
        )?;
        let cash: f64 = conn.query_row(
            "SELECT cash FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(cash)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn get_position(&self, account_id: &str, symbol: &str) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, symbol, quantity, avg_entry_price, updated_at
             FROM positions WHERE account_id = ?1 AND symbol = ?2",
        )?;
        let rec = stmt
            .query_row(params![account_id, symbol], |row| {
                Ok(PositionRecord {
                    account_id: row.get(0)?,
                    symbol: row.get(1)?,
                    quantity: row.get(2)?,
                    avg_entry_price: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    pub fn list_positions(&self, account_id: &str) -> Result<Vec<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, symbol, quantity, avg_entry_price, updated_at
             FROM positions WHERE account_id = ?1 AND quantity > ?2 ORDER BY symbol ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id, POSITION_EPSILON], |row| {
                Ok(PositionRecord {
                    account_id: row.get(0)?,
                    symbol: row.get(1)?,
                    quantity: row.get(2)?,
                    avg_entry_price: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Orders and fills
    // ------------------------------------------------------------------

    /// Persist an order and, when filled, its fill plus the position and cash
    /// effects — all in one transaction so a crash can never leave a fill
    /// without its ledger impact.
    pub fn record_execution(
        &self,
        order: &OrderRecord,
        fill: Option<&FillRecord>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin execution tx")?;

        tx.execute(
            "INSERT INTO orders (id, account_id, agent_id, generation_id, symbol, side, quantity,
                                 mode, tags, is_learnable, status, reject_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &order.id,
                &order.account_id,
                &order.agent_id,
                &order.generation_id,
                &order.symbol,
                order.side.as_str(),
                order.quantity,
                order.mode.as_str(),
                serde_json::to_string(&order.tags).unwrap_or_else(|_| "[]".to_string()),
                order.is_learnable as i64,
                order.status.as_str(),
                order.reject_reason.as_deref(),
                order.created_at,
            ],
        )?;

        if let Some(fill) = fill {
            tx.execute(
                "INSERT INTO fills (id, order_id, agent_id, generation_id, symbol, side, quantity,
                                    price, fee, slippage_pct, is_learnable, filled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &fill.id,
                    &fill.order_id,
                    &fill.agent_id,
                    &fill.generation_id,
                    &fill.symbol,
                    fill.side.as_str(),
                    fill.quantity,
                    fill.price,
                    fill.fee,
                    fill.slippage_pct,
                    fill.is_learnable as i64,
                    fill.filled_at,
                ],
            )?;

            // Mutate position and cash inside the same transaction.
            let existing: Option<(f64, f64)> = tx
                .query_row(
                    "SELECT quantity, avg_entry_price FROM positions
                     WHERE account_id = ?1 AND symbol = ?2",
                    params![&order.account_id, &fill.symbol],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (held_qty, avg_entry) = existing.unwrap_or((0.0, 0.0));

            match fill.side {
                OrderSide::Buy => {
                    let new_qty = held_qty + fill.quantity;
                    // Fees stay out of the cost basis; they hit cash directly.
                    let new_cost = held_qty * avg_entry + fill.quantity * fill.price;
                    let new_avg = if new_qty > POSITION_EPSILON {
                        new_cost / new_qty
                    } else {
                        0.0
                    };
                    tx.execute(
                        "INSERT INTO positions (account_id, symbol, quantity, avg_entry_price, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(account_id, symbol) DO UPDATE SET
                            quantity = excluded.quantity,
                            avg_entry_price = excluded.avg_entry_price,
                            updated_at = excluded.updated_at",
                        params![&order.account_id, &fill.symbol, new_qty, new_avg, fill.filled_at],
                    )?;
                    tx.execute(
                        "UPDATE accounts SET cash = cash - ?2, updated_at = ?3 WHERE id = ?1",
                        params![
                            &order.account_id,
                            fill.price * fill.quantity + fill.fee,
                            fill.filled_at
                        ],
                    )?;
                }
                OrderSide::Sell => {
                    let sold = fill.quantity.min(held_qty);
                    let remaining = held_qty - sold;
                    if remaining > POSITION_EPSILON {
                        tx.execute(
                            "UPDATE positions SET quantity = ?3, updated_at = ?4
                             WHERE account_id = ?1 AND symbol = ?2",
                            params![&order.account_id, &fill.symbol, remaining, fill.filled_at],
                        )?;
                    } else {
                        tx.execute(
                            "DELETE FROM positions WHERE account_id = ?1 AND symbol = ?2",
                            params![&order.account_id, &fill.symbol],
                        )?;
                    }
                    tx.execute(
                        "UPDATE accounts SET cash = cash + ?2, updated_at = ?3 WHERE id = ?1",
                        params![
                            &order.account_id,
                            fill.price * sold - fill.fee,
                            fill.filled_at
                        ],
                    )?;
                }
            }
        }

        tx.commit().context("commit execution tx")?;
        Ok(())
    }

    pub fn list_learnable_fills(&self, agent_id: &str) -> Result<Vec<FillRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, order_id, agent_id, generation_id, symbol, side, quantity, price, fee,
                    slippage_pct, is_learnable, filled_at
             FROM fills WHERE agent_id = ?1 AND is_learnable = 1
             ORDER BY filled_at ASC, rowid ASC",
        )?;
        let raw: Vec<(FillRecord, String)> = stmt
            .query_map(params![agent_id], |row| {
                let side: String = row.get(5)?;
                Ok((
                    FillRecord {
                        id: row.get(0)?,
                        order_id: row.get(1)?,
                        agent_id: row.get(2)?,
                        generation_id: row.get(3)?,
                        symbol: row.get(4)?,
                        side: OrderSide::Buy,
                        quantity: row.get(6)?,
                        price: row.get(7)?,
                        fee: row.get(8)?,
                        slippage_pct: row.get(9)?,
                        is_learnable: row.get::<_, i64>(10)? != 0,
                        filled_at: row.get(11)?,
                    },
                    side,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut out = Vec::with_capacity(raw.len());
        for (mut fill, side) in raw {
            fill.side = OrderSide::parse(&side)
                .ok_or_else(|| anyhow!("unknown order side in fill {}: {}", fill.id, side))?;
            out.push(fill);
        }
        Ok(out)
    }

    pub fn count_learnable_orders(&self, generation_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders
             WHERE generation_id = ?1 AND is_learnable = 1 AND status = 'filled'",
            params![generation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Lifetime learnable fills for one agent, across generations. Drives
    /// the confidence maturity ramp.
    pub fn count_agent_learnable_fills(&self, agent_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fills WHERE agent_id = ?1 AND is_learnable = 1",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_filled_orders_since(&self, since: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE created_at >= ?1 AND status = 'filled'",
            params![since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Cheap existence probe, used to keep repeated invocations inside one
    /// time bucket from dispatching the same deterministic order twice.
    pub fn order_exists(&self, order_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_agent_filled_orders_since(&self, agent_id: &str, since: i64) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders
             WHERE agent_id = ?1 AND created_at >= ?2 AND status = 'filled'",
            params![agent_id, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Sum of live filled notional since `since`, for the daily canary cap.
    pub fn live_notional_since(&self, since: i64) -> Result<f64> {
        let conn = self.conn.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(f.price * f.quantity), 0)
             FROM fills f JOIN orders o ON o.id = f.order_id
             WHERE o.mode = 'live' AND f.filled_at >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub fn insert_agents(&self, agents: &[Agent]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for agent in agents {
            tx.execute(
                "INSERT INTO agents (id, generation_id, name, template, genes,
                                     capital_allocation, role, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &agent.id,
                    &agent.generation_id,
                    &agent.name,
                    agent.template.as_str(),
                    serde_json::to_string(&agent.genes).unwrap_or_else(|_| "{}".to_string()),
                    agent.capital_allocation,
                    agent.role.as_str(),
                    agent.status.as_str(),
                    agent.created_at,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_active_agents(&self, generation_id: &str) -> Result<Vec<Agent>> {
        self.query_agents(
            "generation_id = ?1 AND status = 'active'",
            params![generation_id],
        )
    }

    /// Every agent of a generation regardless of status. Breeding ranks the
    /// retired cohort through this.
    pub fn list_generation_agents(&self, generation_id: &str) -> Result<Vec<Agent>> {
        self.query_agents("generation_id = ?1", params![generation_id])
    }

    fn query_agents<P: rusqlite::Params>(&self, where_clause: &str, args: P) -> Result<Vec<Agent>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, generation_id, name, template, genes, capital_allocation, role, status, created_at
             FROM agents WHERE {} ORDER BY id ASC",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw: Vec<(String, String, String, String, String, f64, String, String, i64)> = stmt
            .query_map(args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        let mut agents = Vec::with_capacity(raw.len());
        for (id, gen_id, name, template, genes, alloc, role, status, created_at) in raw {
            let Some(template) = StrategyTemplate::parse(&template) else {
                warn!(agent_id = %id, template = %template, "skipping agent with unknown template");
                continue;
            };
            let Some(role) = AgentRole::parse(&role) else {
                warn!(agent_id = %id, role = %role, "skipping agent with unknown role");
                continue;
            };
            let Some(status) = AgentStatus::parse(&status) else {
                continue;
            };
            agents.push(Agent {
                id,
                generation_id: gen_id,
                name,
                template,
                genes: serde_json::from_str(&genes).unwrap_or_default(),
                capital_allocation: alloc,
                role,
                status,
                created_at,
            });
        }
        Ok(agents)
    }

    pub fn retire_agents(&self, generation_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE agents SET status = 'retired' WHERE generation_id = ?1 AND status = 'active'",
            params![generation_id],
        )?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------

    pub fn create_generation(&self, now: i64) -> Result<Generation> {
        let conn = self.conn.lock();
        let number: i64 = conn.query_row(
            "SELECT COALESCE(MAX(number), 0) + 1 FROM generations",
            [],
            |row| row.get(0),
        )?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO generations (id, number, status, started_at) VALUES (?1, ?2, 'starting', ?3)",
            params![&id, number, now],
        )?;
        Ok(Generation {
            id,
            number,
            status: GenerationStatus::Starting,
            started_at: now,
            ended_at: None,
            termination_reason: None,
            total_pnl: 0.0,
            trade_count: 0,
            max_drawdown: 0.0,
        })
    }

    /// starting -> active, conditional on the source state.
    pub fn activate_generation(&self, generation_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE generations SET status = 'active' WHERE id = ?1 AND status = 'starting'",
            params![generation_id],
        )?;
        Ok(n == 1)
    }

    /// active -> ending. The winner of this CAS owns liquidation; overlapping
    /// invocations that lose simply skip.
    pub fn begin_ending_generation(&self, generation_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE generations SET status = 'ending' WHERE id = ?1 AND status = 'active'",
            params![generation_id],
        )?;
        Ok(n == 1)
    }

    /// ending -> ended, writing the final stats in the same conditional
    /// UPDATE so finalization is a single atomic step.
    pub fn end_generation(
        &self,
        generation_id: &str,
        reason: TerminationReason,
        total_pnl: f64,
        trade_count: i64,
        max_drawdown: f64,
        now: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE generations
             SET status = 'ended', ended_at = ?2, termination_reason = ?3,
                 total_pnl = ?4, trade_count = ?5, max_drawdown = ?6
             WHERE id = ?1 AND status = 'ending'",
            params![
                generation_id,
                now,
                reason.as_str(),
                total_pnl,
                trade_count,
                max_drawdown
            ],
        )?;
        Ok(n == 1)
    }

    pub fn get_active_generation(&self) -> Result<Option<Generation>> {
        self.get_generation_where("status = 'active'", &[])
    }

    pub fn get_generation(&self, generation_id: &str) -> Result<Option<Generation>> {
        self.get_generation_where("id = ?1", &[&generation_id])
    }

    /// A generation created but not yet activated, if one exists. Lets the
    /// lifecycle manager resume a handoff that died between finalize and
    /// activate.
    pub fn get_starting_generation(&self) -> Result<Option<Generation>> {
        self.get_generation_where("status = 'starting'", &[])
    }

    pub fn get_latest_ended_generation(&self) -> Result<Option<Generation>> {
        self.get_generation_where("status = 'ended'", &[])
    }

    pub fn count_generation_agents(&self, generation_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agents WHERE generation_id = ?1",
            params![generation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn get_generation_where(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Generation>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, number, status, started_at, ended_at, termination_reason,
                    total_pnl, trade_count, max_drawdown
             FROM generations WHERE {} ORDER BY number DESC LIMIT 1",
            where_clause
        );
        let raw: Option<(String, i64, String, i64, Option<i64>, Option<String>, f64, i64, f64)> =
            conn.query_row(&sql, args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })
            .optional()?;

        let Some((id, number, status, started_at, ended_at, reason, total_pnl, trade_count, max_dd)) =
            raw
        else {
            return Ok(None);
        };

        let status = GenerationStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown generation status: {}", status))?;
        let termination_reason = match reason {
            Some(r) => Some(
                TerminationReason::parse(&r)
                    .ok_or_else(|| anyhow!("unknown termination reason: {}", r))?,
            ),
            None => None,
        };

        Ok(Some(Generation {
            id,
            number,
            status,
            started_at,
            ended_at,
            termination_reason,
            total_pnl,
            trade_count,
            max_drawdown: max_dd,
        }))
    }

    // ------------------------------------------------------------------
    // Decision telemetry
    // ------------------------------------------------------------------

    pub fn decision_event_exists(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM decision_events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_decision_event(&self, event: &DecisionEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO decision_events (id, schema_version, agent_id, generation_id, symbol,
                                          decision, confidence, reasons, exit_reason,
                                          gate_failures, nearest_miss, drought, order_id, ext,
                                          created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                &event.id,
                event.schema_version,
                &event.agent_id,
                &event.generation_id,
                event.symbol.as_deref(),
                event.decision.as_str(),
                event.confidence,
                serde_json::to_string(&event.reasons).unwrap_or_else(|_| "[]".to_string()),
                event.exit_reason.as_deref(),
                serde_json::to_string(&event.gate_failures).unwrap_or_else(|_| "[]".to_string()),
                event
                    .nearest_miss
                    .as_ref()
                    .and_then(|m| serde_json::to_string(m).ok()),
                serde_json::to_string(&event.drought).unwrap_or_else(|_| "{}".to_string()),
                event.order_id.as_deref(),
                event.ext.to_string(),
                event.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn recent_decision_events(&self, limit: i64) -> Result<Vec<DecisionEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, schema_version, agent_id, generation_id, symbol, decision, confidence,
                    reasons, exit_reason, gate_failures, nearest_miss, drought, order_id, ext,
                    created_at
             FROM decision_events ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let raw: Vec<(
            String,
            u32,
            String,
            String,
            Option<String>,
            String,
            f64,
            String,
            Option<String>,
            String,
            Option<String>,
            String,
            Option<String>,
            String,
            i64,
        )> = stmt
            .query_map(params![limit.clamp(1, 2000)], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                    row.get(11)?,
                    row.get(12)?,
                    row.get(13)?,
                    row.get(14)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(conn);

        let mut events = Vec::with_capacity(raw.len());
        for (
            id,
            schema_version,
            agent_id,
            generation_id,
            symbol,
            decision,
            confidence,
            reasons,
            exit_reason,
            gate_failures,
            nearest_miss,
            drought,
            order_id,
            ext,
            created_at,
        ) in raw
        {
            let Some(decision) = DecisionKind::parse(&decision) else {
                debug!(event_id = %id, "skipping decision event with unknown decision kind");
                continue;
            };
            events.push(DecisionEvent {
                schema_version,
                id,
                agent_id,
                generation_id,
                symbol,
                decision,
                confidence,
                reasons: serde_json::from_str(&reasons).unwrap_or_default(),
                exit_reason,
                gate_failures: serde_json::from_str::<Vec<GateFailure>>(&gate_failures)
                    .unwrap_or_default(),
                nearest_miss: nearest_miss
                    .as_deref()
                    .and_then(|m| serde_json::from_str(m).ok()),
                drought: serde_json::from_str::<DroughtSnapshot>(&drought).unwrap_or_default(),
                order_id,
                ext: serde_json::from_str(&ext).unwrap_or(serde_json::Value::Null),
                created_at,
            });
        }
        Ok(events)
    }

    /// (hold_count, order_count) over the most recent `n` decision events.
    pub fn decision_counts_last_n(&self, n: i64) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT decision, order_id FROM decision_events
             ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows: Vec<(String, Option<String>)> = stmt
            .query_map(params![n.max(1)], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        let holds = rows.iter().filter(|(d, _)| d == "hold").count() as i64;
        let orders = rows.iter().filter(|(_, o)| o.is_some()).count() as i64;
        Ok((holds, orders))
    }

    /// (hold_count, order_count) over decision events since `since`.
    pub fn decision_counts_since(&self, since: i64) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let holds: i64 = conn.query_row(
            "SELECT COUNT(*) FROM decision_events WHERE created_at >= ?1 AND decision = 'hold'",
            params![since],
            |row| row.get(0),
        )?;
        let orders: i64 = conn.query_row(
            "SELECT COUNT(*) FROM decision_events
             WHERE created_at >= ?1 AND order_id IS NOT NULL",
            params![since],
            |row| row.get(0),
        )?;
        Ok((holds, orders))
    }

    // ------------------------------------------------------------------
    // Arm sessions
    // ------------------------------------------------------------------

    pub fn create_arm_session(&self, ttl_minutes: i64, max_orders: i64, now: i64) -> Result<ArmSession> {
        let session = ArmSession {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + ttl_minutes.max(1) * 60,
            max_orders: max_orders.max(1),
            spent_at: None,
            spent_by_request_id: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arm_sessions (id, created_at, expires_at, max_orders) VALUES (?1, ?2, ?3, ?4)",
            params![&session.id, session.created_at, session.expires_at, session.max_orders],
        )?;
        Ok(session)
    }

    pub fn get_arm_session(&self, session_id: &str) -> Result<Option<ArmSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at, expires_at, max_orders, spent_at, spent_by_request_id
             FROM arm_sessions WHERE id = ?1",
        )?;
        let rec = stmt
            .query_row(params![session_id], |row| {
                Ok(ArmSession {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    expires_at: row.get(2)?,
                    max_orders: row.get(3)?,
                    spent_at: row.get(4)?,
                    spent_by_request_id: row.get(5)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    /// Most recent unspent, unexpired session, if any.
    pub fn latest_valid_arm_session(&self, now: i64) -> Result<Option<ArmSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at, expires_at, max_orders, spent_at, spent_by_request_id
             FROM arm_sessions
             WHERE spent_at IS NULL AND expires_at > ?1
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let rec = stmt
            .query_row(params![now], |row| {
                Ok(ArmSession {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    expires_at: row.get(2)?,
                    max_orders: row.get(3)?,
                    spent_at: row.get(4)?,
                    spent_by_request_id: row.get(5)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    /// Most recent session in any state. The safety chain uses this to tell
    /// "never armed" apart from "armed but expired or already used".
    pub fn latest_arm_session(&self) -> Result<Option<ArmSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, created_at, expires_at, max_orders, spent_at, spent_by_request_id
             FROM arm_sessions
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let rec = stmt
            .query_row([], |row| {
                Ok(ArmSession {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    expires_at: row.get(2)?,
                    max_orders: row.get(3)?,
                    spent_at: row.get(4)?,
                    spent_by_request_id: row.get(5)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    /// The at-most-once primitive. One conditional UPDATE marks the session
    /// spent and records the request id; rows_affected decides the winner, so
    /// two racing callers can never both succeed.
    pub fn spend_arm_session(
        &self,
        session_id: &str,
        request_id: &str,
        now: i64,
    ) -> Result<ArmSpendOutcome> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE arm_sessions SET spent_at = ?3, spent_by_request_id = ?2
             WHERE id = ?1 AND spent_at IS NULL AND expires_at > ?3",
            params![session_id, request_id, now],
        )?;

        if n == 1 {
            let (max_orders,): (i64,) = conn.query_row(
                "SELECT max_orders FROM arm_sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?,)),
            )?;
            return Ok(ArmSpendOutcome {
                success: true,
                reason: None,
                orders_remaining: (max_orders - 1).max(0),
            });
        }

        // Lost the race or nothing to spend; classify why.
        let existing: Option<(Option<i64>, i64)> = conn
            .query_row(
                "SELECT spent_at, expires_at FROM arm_sessions WHERE id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let reason = match existing {
            None => reasons::CANARY_NOT_FOUND,
            Some((Some(_), _)) => reasons::CANARY_ALREADY_CONSUMED,
            Some((None, expires_at)) if now >= expires_at => reasons::CANARY_EXPIRED,
            Some((None, _)) => reasons::CANARY_ALREADY_CONSUMED,
        };

        Ok(ArmSpendOutcome {
            success: false,
            reason: Some(reason.to_string()),
            orders_remaining: 0,
        })
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    pub fn log_event(&self, action: &str, metadata: serde_json::Value, ts: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO event_log (action, ts, metadata) VALUES (?1, ?2, ?3)",
            params![action, ts, metadata.to_string()],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, action, ts, metadata FROM event_log ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 1000)], |row| {
                let metadata: String = row.get(3)?;
                Ok(EventRecord {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    ts: row.get(2)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn prune_events(&self, older_than_ts: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM event_log WHERE ts < ?1",
            params![older_than_ts],
        )?;
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Runtime config document
    // ------------------------------------------------------------------

    fn ensure_runtime_config_row(&self) -> Result<()> {
        let default = RuntimeConfig::default();
        let doc = serde_json::to_string(&default).context("serialize default runtime config")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO runtime_config (id, version, document, updated_at)
             VALUES (1, 0, ?1, 0)",
            params![doc],
        )?;
        Ok(())
    }

    /// Read the config document fresh. The stored row version wins over
    /// whatever the document claims so CAS writers always see the truth.
    pub fn load_runtime_config(&self) -> Result<RuntimeConfig> {
        let conn = self.conn.lock();
        let (version, document): (i64, String) = conn.query_row(
            "SELECT version, document FROM runtime_config WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut cfg: RuntimeConfig =
            serde_json::from_str(&document).context("parse runtime config document")?;
        cfg.version = version;
        Ok(cfg)
    }

    /// Version-guarded full-document write. Returns false when someone else
    /// updated the document since `cfg.version` was read; the caller skips and
    /// retries next tick rather than clobbering.
    pub fn update_runtime_config(&self, cfg: &RuntimeConfig, now: i64) -> Result<bool> {
        let doc = serde_json::to_string(cfg).context("serialize runtime config")?;
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE runtime_config SET document = ?1, version = version + 1, updated_at = ?2
             WHERE id = 1 AND version = ?3",
            params![doc, now, cfg.version],
        )?;
        Ok(n == 1)
    }

    /// Read-modify-write with a bounded CAS retry. The closure sees the
    /// freshest document on every attempt, so a concurrent writer costs us a
    /// retry instead of a lost update.
    pub fn mutate_runtime_config<F>(&self, now: i64, mut apply: F) -> Result<RuntimeConfig>
    where
        F: FnMut(&mut RuntimeConfig),
    {
        for _ in 0..5 {
            let mut cfg = self.load_runtime_config()?;
            apply(&mut cfg);
            if self.update_runtime_config(&cfg, now)? {
                cfg.version += 1;
                return Ok(cfg);
            }
        }
        Err(anyhow!("runtime config contention: gave up after 5 attempts"))
    }

    // ------------------------------------------------------------------
    // NAV snapshots
    // ------------------------------------------------------------------

    pub fn insert_nav_snapshot(&self, snap: &NavSnapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nav_snapshots (id, ts, cash, positions_value, equity)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&snap.id, snap.ts, snap.cash, snap.positions_value, snap.equity],
        )?;
        Ok(())
    }

    /// Equity trail since a timestamp, oldest first. Feeds generation-level
    /// drawdown stats at finalization.
    pub fn nav_curve_since(&self, since: i64) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, equity FROM nav_snapshots WHERE ts >= ?1 ORDER BY ts ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn latest_nav(&self) -> Result<Option<NavSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ts, cash, positions_value, equity FROM nav_snapshots
             ORDER BY ts DESC, rowid DESC LIMIT 1",
        )?;
        let rec = stmt
            .query_row([], |row| {
                Ok(NavSnapshot {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    cash: row.get(2)?,
                    positions_value: row.get(3)?,
                    equity: row.get(4)?,
                })
            })
            .optional()?;
        Ok(rec)
    }

    // ------------------------------------------------------------------
    // Shadow trades
    // ------------------------------------------------------------------

    pub fn insert_shadow_trade(&self, trade: &ShadowTrade) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shadow_trades (id, agent_id, generation_id, symbol, side, quantity,
                                        entry_price, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &trade.id,
                &trade.agent_id,
                &trade.generation_id,
                &trade.symbol,
                trade.side.as_str(),
                trade.quantity,
                trade.entry_price,
                trade.created_at,
            ],
        )?;
        Ok(())
    }

    /// Shadow trades past their horizon and still unresolved.
    pub fn due_shadow_trades(&self, created_before: i64) -> Result<Vec<ShadowTrade>> {
        self.query_shadow(
            "WHERE resolved_at IS NULL AND created_at <= ?1 ORDER BY created_at ASC",
            params![created_before],
        )
    }

    pub fn list_resolved_shadow_trades(&self, agent_id: &str) -> Result<Vec<ShadowTrade>> {
        self.query_shadow(
            "WHERE agent_id = ?1 AND resolved_at IS NOT NULL ORDER BY created_at ASC, rowid ASC",
            params![agent_id],
        )
    }

    pub fn count_resolved_shadow_trades(&self, generation_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM shadow_trades
             WHERE generation_id = ?1 AND resolved_at IS NOT NULL",
            params![generation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn query_shadow<P: rusqlite::Params>(&self, suffix: &str, args: P) -> Result<Vec<ShadowTrade>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, agent_id, generation_id, symbol, side, quantity, entry_price,
                    created_at, resolved_at, exit_price, pnl
             FROM shadow_trades {}",
            suffix
        );
        let mut stmt = conn.prepare(&sql)?;
        let raw: Vec<(ShadowTrade, String)> = stmt
            .query_map(args, |row| {
                let side: String = row.get(4)?;
                Ok((
                    ShadowTrade {
                        id: row.get(0)?,
                        agent_id: row.get(1)?,
                        generation_id: row.get(2)?,
                        symbol: row.get(3)?,
                        side: OrderSide::Buy,
                        quantity: row.get(5)?,
                        entry_price: row.get(6)?,
                        created_at: row.get(7)?,
                        resolved_at: row.get(8)?,
                        exit_price: row.get(9)?,
                        pnl: row.get(10)?,
                    },
                    side,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut out = Vec::with_capacity(raw.len());
        for (mut trade, side) in raw {
            let Some(side) = OrderSide::parse(&side) else {
                continue;
            };
            trade.side = side;
            out.push(trade);
        }
        Ok(out)
    }

    pub fn resolve_shadow_trade(
        &self,
        trade_id: &str,
        exit_price: f64,
        pnl: f64,
        now: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE shadow_trades SET resolved_at = ?2, exit_price = ?3, pnl = ?4
             WHERE id = ?1 AND resolved_at IS NULL",
            params![trade_id, now, exit_price, pnl],
        )?;
        Ok(n == 1)
    }

    // ------------------------------------------------------------------
    // Market snapshots (written by the out-of-process ingester)
    // ------------------------------------------------------------------

    pub fn upsert_market_snapshot(
        &self,
        symbol: &str,
        price: f64,
        change_24h: f64,
        volume_24h: f64,
        trend_slope: f64,
        volatility_ratio: f64,
        regime: &str,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO market_snapshots (symbol, price, change_24h, volume_24h, trend_slope,
                                           volatility_ratio, regime, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol) DO UPDATE SET
                price = excluded.price,
                change_24h = excluded.change_24h,
                volume_24h = excluded.volume_24h,
                trend_slope = excluded.trend_slope,
                volatility_ratio = excluded.volatility_ratio,
                regime = excluded.regime,
                updated_at = excluded.updated_at",
            params![
                symbol,
                price,
                change_24h,
                volume_24h,
                trend_slope,
                volatility_ratio,
                regime,
                updated_at
            ],
        )?;
        Ok(())
    }

    pub fn read_market_snapshots(
        &self,
        symbols: &[String],
    ) -> Result<Vec<(String, f64, f64, f64, f64, f64, String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, price, change_24h, volume_24h, trend_slope, volatility_ratio,
                    regime, updated_at
             FROM market_snapshots WHERE symbol = ?1",
        )?;
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let row = stmt
                .query_row(params![symbol], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })
                .optional()?;
            if let Some(row) = row {
                out.push(row);
            }
        }
        Ok(out)
    }
}
