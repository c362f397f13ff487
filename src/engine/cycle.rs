use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::drought::DroughtResolver;
use crate::engine::gates::{self, GateDecision, ThresholdSet};
use crate::engine::tuner::AdaptiveTuner;
use crate::execution::{ExecutionAdapter, ExecutionRequest};
use crate::ledger::LedgerDb;
use crate::market::{MarketSnapshot, SnapshotProvider};
use crate::models::{
    reasons, Agent, AgentRole, DecisionEvent, DecisionKind, DroughtSnapshot, FillRecord,
    NavSnapshot, OrderRecord, OrderSide, OrderStatus, RuntimeConfig, ShadowTrade, SystemStatus,
    TradeMode, DECISION_SCHEMA_VERSION,
};

/// Operational events older than this get pruned opportunistically.
const EVENT_RETENTION_SECS: i64 = 30 * 24 * 3600;

/// Hard deadline on one dispatch, generous enough for the live path's
/// balance read plus order placement.
const DISPATCH_DEADLINE_SECS: u64 = 30;

/// How one scheduled tick ended. Skips are successes: the next tick simply
/// tries again.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Skipped(String),
    Held,
    Dispatched { order_id: String },
}

/// One evaluated (symbol, decision) pair, pre-dispatch.
struct Candidate {
    symbol: String,
    price: f64,
    decision: GateDecision,
}

pub struct CycleOrchestrator {
    db: LedgerDb,
    provider: Arc<dyn SnapshotProvider>,
    execution: Arc<dyn ExecutionAdapter>,
    app: AppConfig,
}

impl CycleOrchestrator {
    pub fn new(
        db: LedgerDb,
        provider: Arc<dyn SnapshotProvider>,
        execution: Arc<dyn ExecutionAdapter>,
        app: AppConfig,
    ) -> Self {
        Self {
            db,
            provider,
            execution,
            app,
        }
    }

    /// One full decision cycle. Config is re-read fresh here and passed down
    /// as a snapshot; nothing below this point reloads it.
    pub async fn run_cycle(&self, now: i64) -> Result<CycleOutcome> {
        let mut cfg = self.db.load_runtime_config()?;

        if cfg.system_status != SystemStatus::Running {
            return self.skip(now, "system_paused");
        }
        if cfg.trading_mode != TradeMode::Paper {
            return self.skip(now, "not_paper_mode");
        }
        let Some(generation) = self.db.get_active_generation()? else {
            return self.skip(now, "no_active_generation");
        };

        let snapshots = self
            .provider
            .get_snapshots(&self.app.symbols)
            .context("fetch market snapshots")?;
        let fresh: Vec<MarketSnapshot> = snapshots
            .into_iter()
            .filter(|s| !s.is_stale(now, cfg.snapshot_max_age_secs))
            .collect();
        if fresh.is_empty() {
            return self.skip(now, "no_fresh_snapshots");
        }

        let account = self
            .db
            .get_account(&self.app.account_id)?
            .context("account missing; run init first")?;
        let prices: HashMap<&str, f64> =
            fresh.iter().map(|s| (s.symbol.as_str(), s.price)).collect();
        let (positions_value, equity) = self.mark_to_market(account.cash, &prices)?;
        self.db.insert_nav_snapshot(&NavSnapshot {
            id: Uuid::new_v4().to_string(),
            ts: now,
            cash: account.cash,
            positions_value,
            equity,
        })?;

        let mut drought =
            DroughtResolver::new(self.db.clone()).resolve(&mut cfg, &fresh, equity, now)?;

        let agents = self.db.list_active_agents(&generation.id)?;
        if agents.is_empty() {
            return self.skip(now, "no_active_agents");
        }

        let bucket = (now / self.app.decision_interval_secs as i64).max(0);
        let agent = pick_agent(&agents, &drought, bucket);
        let event_id = deterministic_id("decision", &[&agent.id, &bucket.to_string()]);
        if self.db.decision_event_exists(&event_id)? {
            return Ok(CycleOutcome::Skipped("bucket_already_decided".to_string()));
        }

        let selected = select_symbols(&fresh, &agent.id, bucket, cfg.symbols_per_cycle);
        let trade_count = self.db.count_agent_learnable_fills(&agent.id)?;
        let relax = drought.active.then_some(cfg.drought_relax_fraction);
        let thresholds =
            ThresholdSet::effective(agent, &cfg.tuning.offsets, relax, cfg.tuning_max_relax);

        let mut candidates = Vec::with_capacity(selected.len());
        for snapshot in &selected {
            let position = self.db.get_position(&self.app.account_id, &snapshot.symbol)?;
            let decision =
                gates::evaluate(agent, snapshot, position.as_ref(), &thresholds, trade_count);
            candidates.push(Candidate {
                symbol: snapshot.symbol.clone(),
                price: snapshot.price,
                decision,
            });
        }

        let winner = candidates
            .iter()
            .filter(|c| c.decision.decision.is_actionable())
            .max_by(|a, b| {
                a.decision
                    .confidence
                    .partial_cmp(&b.decision.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

        let outcome = match winner {
            Some(candidate) => {
                self.dispatch(
                    &cfg,
                    &generation.id,
                    agent,
                    candidate,
                    &mut drought,
                    trade_count,
                    account.cash,
                    &event_id,
                    bucket,
                    now,
                )
                .await?
            }
            None => {
                self.record_aggregate_hold(&generation.id, agent, &candidates, &drought, &event_id, now)?;
                CycleOutcome::Held
            }
        };

        // Tuner runs strictly after the decision event lands, so the window
        // it reads includes this cycle.
        AdaptiveTuner::new(self.db.clone()).run(&cfg, &drought, now)?;

        self.resolve_due_shadows(&cfg, &prices, now)?;
        if bucket % 48 == 0 {
            let pruned = self.db.prune_events(now - EVENT_RETENTION_SECS)?;
            if pruned > 0 {
                debug!("Pruned {} old operational events", pruned);
            }
        }

        Ok(outcome)
    }

    fn skip(&self, now: i64, reason: &str) -> Result<CycleOutcome> {
        debug!("Cycle skipped: {}", reason);
        self.db
            .log_event("cycle_skip", json!({ "reason": reason }), now)?;
        Ok(CycleOutcome::Skipped(reason.to_string()))
    }

    fn mark_to_market(&self, cash: f64, prices: &HashMap<&str, f64>) -> Result<(f64, f64)> {
        let mut positions_value = 0.0;
        for position in self.db.list_positions(&self.app.account_id)? {
            let mark = prices
                .get(position.symbol.as_str())
                .copied()
                .unwrap_or(position.avg_entry_price);
            positions_value += position.quantity * mark;
        }
        Ok((positions_value, cash + positions_value))
    }

    /// Pre-dispatch checks, then hand-off to the execution collaborator.
    /// Floors and caps apply to entries; exits always go out.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        cfg: &RuntimeConfig,
        generation_id: &str,
        agent: &Agent,
        candidate: &Candidate,
        drought: &mut DroughtSnapshot,
        trade_count: i64,
        cash: f64,
        event_id: &str,
        bucket: i64,
        now: i64,
    ) -> Result<CycleOutcome> {
        let side = match candidate.decision.decision {
            DecisionKind::Buy => OrderSide::Buy,
            DecisionKind::Sell => OrderSide::Sell,
            DecisionKind::Hold => unreachable!("winner is actionable by construction"),
        };

        let quantity = match side {
            OrderSide::Buy => {
                let fraction = agent.gene("position_fraction", 0.1).clamp(0.01, 1.0);
                (agent.capital_allocation * fraction / candidate.price).max(0.0)
            }
            OrderSide::Sell => self
                .db
                .get_position(&self.app.account_id, &candidate.symbol)?
                .map(|p| p.quantity)
                .unwrap_or(0.0),
        };
        if quantity <= 0.0 {
            return self.hold_blocked(
                generation_id,
                agent,
                candidate,
                drought,
                event_id,
                "zero_quantity",
                false,
                now,
            );
        }

        if side == OrderSide::Buy {
            let is_explorer = agent.role == AgentRole::Explorer;
            let floor = if is_explorer {
                cfg.explorer_min_confidence
            } else {
                cfg.min_confidence
            };
            if candidate.decision.confidence < floor {
                return self.hold_blocked(
                    generation_id,
                    agent,
                    candidate,
                    drought,
                    event_id,
                    "below_confidence_floor",
                    true,
                    now,
                );
            }

            let cap = if is_explorer {
                cfg.explorer_max_trades_per_hour
            } else {
                cfg.max_trades_per_hour
            };
            let recent = self.db.count_agent_filled_orders_since(&agent.id, now - 3600)?;
            if recent >= cap {
                drought.suppress(reasons::HOURLY_CAP);
                return self.hold_blocked(
                    generation_id,
                    agent,
                    candidate,
                    drought,
                    event_id,
                    reasons::HOURLY_CAP,
                    true,
                    now,
                );
            }

            if cash < quantity * candidate.price {
                drought.suppress(reasons::INSUFFICIENT_CASH);
                return self.hold_blocked(
                    generation_id,
                    agent,
                    candidate,
                    drought,
                    event_id,
                    reasons::INSUFFICIENT_CASH,
                    true,
                    now,
                );
            }
        }

        // Deterministic per (agent, symbol, side, bucket): a second invocation
        // in the same bucket reuses this id and stops at the existence probe.
        let order_id = deterministic_id(
            "order",
            &[
                &agent.id,
                &candidate.symbol,
                side.as_str(),
                &bucket.to_string(),
            ],
        );
        if self.db.order_exists(&order_id)? {
            return Ok(CycleOutcome::Skipped("order_already_placed".to_string()));
        }

        let tags: Vec<String> = Vec::new();
        let request = ExecutionRequest {
            request_id: order_id.clone(),
            agent_id: agent.id.clone(),
            generation_id: generation_id.to_string(),
            symbol: candidate.symbol.clone(),
            side,
            quantity,
            mark_price: candidate.price,
            tags: tags.clone(),
        };

        let mut order = OrderRecord {
            id: order_id.clone(),
            account_id: self.app.account_id.clone(),
            agent_id: agent.id.clone(),
            generation_id: generation_id.to_string(),
            symbol: candidate.symbol.clone(),
            side,
            quantity,
            mode: TradeMode::Paper,
            tags: tags.clone(),
            is_learnable: OrderRecord::compute_learnable(TradeMode::Paper, &tags),
            status: OrderStatus::Filled,
            reject_reason: None,
            created_at: now,
        };

        let mut event = self.event_for(
            generation_id,
            agent,
            Some(candidate.symbol.clone()),
            &candidate.decision,
            drought,
            event_id,
            now,
        );

        let submitted = match tokio::time::timeout(
            Duration::from_secs(DISPATCH_DEADLINE_SECS),
            self.execution.submit_order(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!("dispatch timed out after {DISPATCH_DEADLINE_SECS}s")),
        };
        match submitted {
            Ok(fill) => {
                let fill_record = FillRecord {
                    id: Uuid::new_v4().to_string(),
                    order_id: order_id.clone(),
                    agent_id: agent.id.clone(),
                    generation_id: generation_id.to_string(),
                    symbol: candidate.symbol.clone(),
                    side,
                    quantity: fill.filled_quantity,
                    price: fill.fill_price,
                    fee: fill.fee,
                    slippage_pct: fill.slippage_pct,
                    is_learnable: order.is_learnable,
                    filled_at: fill.filled_at,
                };
                self.db.record_execution(&order, Some(&fill_record))?;
                event.order_id = Some(order_id.clone());
                event.ext = json!({
                    "fill_price": fill.fill_price,
                    "filled_quantity": fill.filled_quantity,
                    "fee": fill.fee,
                    "slippage_pct": fill.slippage_pct,
                    "trade_count": trade_count,
                });
                self.db.insert_decision_event(&event)?;
                info!(
                    "📈 {} {} {:.6} {} @ ~{:.2} (conf {:.2}, agent {})",
                    agent.name,
                    side.as_str(),
                    fill.filled_quantity,
                    candidate.symbol,
                    fill.fill_price,
                    candidate.decision.confidence,
                    agent.id
                );
                Ok(CycleOutcome::Dispatched { order_id })
            }
            Err(err) => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(err.to_string());
                self.db.record_execution(&order, None)?;
                event.reasons.push("execution_rejected".to_string());
                event.ext = json!({ "error": err.to_string() });
                self.db.insert_decision_event(&event)?;
                warn!(
                    "Order rejected for {} {}: {}",
                    candidate.symbol,
                    side.as_str(),
                    err
                );
                Ok(CycleOutcome::Held)
            }
        }
    }

    /// A candidate that failed a pre-dispatch check: record the hold, and for
    /// entries also record the counterfactual so fitness can still learn what
    /// would have happened.
    #[allow(clippy::too_many_arguments)]
    fn hold_blocked(
        &self,
        generation_id: &str,
        agent: &Agent,
        candidate: &Candidate,
        drought: &DroughtSnapshot,
        event_id: &str,
        reason: &str,
        shadow: bool,
        now: i64,
    ) -> Result<CycleOutcome> {
        let mut decision = candidate.decision.clone();
        let would_be = decision.decision;
        decision.decision = DecisionKind::Hold;
        decision.reasons.push(reason.to_string());

        let mut event = self.event_for(
            generation_id,
            agent,
            Some(candidate.symbol.clone()),
            &decision,
            drought,
            event_id,
            now,
        );
        event.ext = json!({
            "blocked_decision": would_be.as_str(),
            "blocked_confidence": candidate.decision.confidence,
        });
        self.db.insert_decision_event(&event)?;

        if shadow && would_be == DecisionKind::Buy {
            let fraction = agent.gene("position_fraction", 0.1).clamp(0.01, 1.0);
            let quantity = agent.capital_allocation * fraction / candidate.price;
            self.db.insert_shadow_trade(&ShadowTrade {
                id: Uuid::new_v4().to_string(),
                agent_id: agent.id.clone(),
                generation_id: generation_id.to_string(),
                symbol: candidate.symbol.clone(),
                side: OrderSide::Buy,
                quantity,
                entry_price: candidate.price,
                created_at: now,
                resolved_at: None,
                exit_price: None,
                pnl: None,
            })?;
        }

        debug!(
            "Blocked {} {} for agent {}: {}",
            would_be.as_str(),
            candidate.symbol,
            agent.id,
            reason
        );
        Ok(CycleOutcome::Held)
    }

    /// Every symbol held: one aggregate event with the top reasons and the
    /// full failure evidence, so drought windows and the tuner see it.
    fn record_aggregate_hold(
        &self,
        generation_id: &str,
        agent: &Agent,
        candidates: &[Candidate],
        drought: &DroughtSnapshot,
        event_id: &str,
        now: i64,
    ) -> Result<()> {
        let mut reason_tally: HashMap<&str, usize> = HashMap::new();
        let mut failures = Vec::new();
        let mut nearest: Option<crate::models::GateFailure> = None;
        for candidate in candidates {
            for reason in &candidate.decision.reasons {
                *reason_tally.entry(reason.as_str()).or_insert(0) += 1;
            }
            failures.extend(candidate.decision.gate_failures.iter().cloned());
            if let Some(miss) = &candidate.decision.nearest_miss {
                let closer = nearest
                    .as_ref()
                    .map_or(true, |current| miss.margin > current.margin);
                if closer {
                    nearest = Some(miss.clone());
                }
            }
        }

        let mut top_reasons: Vec<(&str, usize)> = reason_tally.into_iter().collect();
        top_reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let reasons_list: Vec<String> = top_reasons
            .iter()
            .take(3)
            .map(|(r, _)| r.to_string())
            .collect();

        let decision = GateDecision {
            decision: DecisionKind::Hold,
            confidence: 0.0,
            reasons: reasons_list,
            exit_reason: None,
            gate_failures: failures,
            nearest_miss: nearest,
        };
        let mut event =
            self.event_for(generation_id, agent, None, &decision, drought, event_id, now);
        event.ext = json!({
            "evaluated_symbols": candidates.iter().map(|c| c.symbol.as_str()).collect::<Vec<_>>(),
        });
        self.db.insert_decision_event(&event)?;
        debug!(
            "Cycle hold for agent {} across {} symbols: {:?}",
            agent.id,
            candidates.len(),
            event.reasons
        );
        Ok(())
    }

    fn event_for(
        &self,
        generation_id: &str,
        agent: &Agent,
        symbol: Option<String>,
        decision: &GateDecision,
        drought: &DroughtSnapshot,
        event_id: &str,
        now: i64,
    ) -> DecisionEvent {
        DecisionEvent {
            schema_version: DECISION_SCHEMA_VERSION,
            id: event_id.to_string(),
            agent_id: agent.id.clone(),
            generation_id: generation_id.to_string(),
            symbol,
            decision: decision.decision,
            confidence: decision.confidence,
            reasons: decision.reasons.clone(),
            exit_reason: decision.exit_reason.clone(),
            gate_failures: decision.gate_failures.clone(),
            nearest_miss: decision.nearest_miss.clone(),
            drought: drought.clone(),
            order_id: None,
            ext: serde_json::Value::Null,
            created_at: now,
        }
    }

    /// Close out counterfactuals whose horizon has passed, using current
    /// marks. Symbols with no fresh price stay pending for a later cycle.
    fn resolve_due_shadows(
        &self,
        cfg: &RuntimeConfig,
        prices: &HashMap<&str, f64>,
        now: i64,
    ) -> Result<()> {
        let due = self
            .db
            .due_shadow_trades(now - cfg.shadow_horizon_hours * 3600)?;
        for trade in due {
            let Some(&exit_price) = prices.get(trade.symbol.as_str()) else {
                continue;
            };
            let pnl = match trade.side {
                OrderSide::Buy => (exit_price - trade.entry_price) * trade.quantity,
                OrderSide::Sell => (trade.entry_price - exit_price) * trade.quantity,
            };
            if self.db.resolve_shadow_trade(&trade.id, exit_price, pnl, now)? {
                debug!(
                    "Shadow trade {} resolved: {} pnl {:.4}",
                    trade.id, trade.symbol, pnl
                );
            }
        }
        Ok(())
    }
}

/// Stable digest of a composite key. uuid-v5 keeps it stable across builds
/// and processes, unlike the std hasher.
fn deterministic_id(kind: &str, parts: &[&str]) -> String {
    let joined = format!("evobot:{}:{}", kind, parts.join(":"));
    Uuid::new_v5(&Uuid::NAMESPACE_URL, joined.as_bytes()).to_string()
}

fn digest_u64(input: &str) -> u64 {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, input.as_bytes()).as_u128() as u64
}

/// Deterministic agent pick for this bucket. Explorers are preferred while
/// drought relaxation is active, so relaxed thresholds get probed by the
/// cohort built for probing.
fn pick_agent<'a>(agents: &'a [Agent], drought: &DroughtSnapshot, bucket: i64) -> &'a Agent {
    let explorers: Vec<&Agent> = agents
        .iter()
        .filter(|a| a.role == AgentRole::Explorer)
        .collect();
    let core: Vec<&Agent> = agents.iter().filter(|a| a.role == AgentRole::Core).collect();

    let pool: Vec<&Agent> = if drought.active && !explorers.is_empty() {
        explorers
    } else if !core.is_empty() {
        core
    } else {
        agents.iter().collect()
    };

    let mut ids: Vec<&str> = pool.iter().map(|a| a.id.as_str()).collect();
    ids.sort_unstable();
    let key = format!("{}:{}", ids.join(","), bucket);
    let index = (digest_u64(&key) % pool.len() as u64) as usize;
    pool[index]
}

/// Rotating per-agent symbol subset: rank by a digest of (agent, bucket,
/// symbol) and take the head. Different buckets produce different rankings,
/// so every symbol gets coverage over enough cycles without randomness.
fn select_symbols(
    fresh: &[MarketSnapshot],
    agent_id: &str,
    bucket: i64,
    per_cycle: i64,
) -> Vec<MarketSnapshot> {
    let mut ranked: Vec<(u64, &MarketSnapshot)> = fresh
        .iter()
        .map(|s| {
            let key = format!("{}:{}:{}", agent_id, bucket, s.symbol);
            (digest_u64(&key), s)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.symbol.cmp(&b.1.symbol)));
    ranked
        .into_iter()
        .take(per_cycle.max(1) as usize)
        .map(|(_, s)| s.clone())
        .collect()
}
