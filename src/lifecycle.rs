use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::breeding::BreedingCollaborator;
use crate::config::AppConfig;
use crate::engine::drought::drawdown_from_peak;
use crate::fitness;
use crate::ledger::LedgerDb;
use crate::models::{
    FillRecord, Generation, OrderRecord, OrderSide, OrderStatus, RuntimeConfig,
    TerminationReason, TradeMode, TAG_FORCED_LIQUIDATION,
};

/// Whether the active generation must end now, and why. Limits are checked
/// in declaration order; the first breach wins.
pub fn check_termination(
    generation: &Generation,
    cfg: &RuntimeConfig,
    learnable_trades: i64,
    resolved_shadows: i64,
    account_drawdown: f64,
    now: i64,
) -> Option<TerminationReason> {
    let elapsed_days = (now - generation.started_at) as f64 / 86_400.0;

    if elapsed_days >= cfg.generation_max_days {
        return Some(TerminationReason::Time);
    }
    if learnable_trades >= cfg.generation_max_trades {
        return Some(TerminationReason::Trades);
    }
    if account_drawdown >= cfg.generation_max_drawdown_pct {
        return Some(TerminationReason::Drawdown);
    }
    // Stagnation: an old generation with barely any evidence, real or
    // counterfactual, is ended rather than left to stall indefinitely.
    if elapsed_days > cfg.stagnation_days
        && learnable_trades + resolved_shadows < cfg.min_sample_trades
    {
        return Some(TerminationReason::Drought);
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleOutcome {
    Skipped(String),
    /// Generation inspected and allowed to continue.
    NoChange,
    Rolled {
        ended_generation: String,
        new_generation: String,
        reason: TerminationReason,
    },
    /// An interrupted hand-off from a previous invocation was completed.
    Resumed {
        new_generation: String,
    },
}

pub struct LifecycleManager {
    db: LedgerDb,
    breeder: Arc<dyn BreedingCollaborator>,
    app: AppConfig,
}

impl LifecycleManager {
    pub fn new(db: LedgerDb, breeder: Arc<dyn BreedingCollaborator>, app: AppConfig) -> Self {
        Self { db, breeder, app }
    }

    pub fn run(&self, now: i64) -> Result<LifecycleOutcome> {
        let cfg = self.db.load_runtime_config()?;

        let Some(generation) = self.db.get_active_generation()? else {
            return self.resume_handoff(now);
        };

        let learnable = self.db.count_learnable_orders(&generation.id)?;
        let shadows = self.db.count_resolved_shadow_trades(&generation.id)?;
        let (prices, equity) = self.current_marks()?;

        // Fold today's equity into the watermark before measuring from it.
        let peak = if equity > cfg.peak_equity {
            let updated = self.db.mutate_runtime_config(now, |c| {
                if equity > c.peak_equity {
                    c.peak_equity = equity;
                }
            })?;
            updated.peak_equity
        } else {
            cfg.peak_equity
        };
        let drawdown = drawdown_from_peak(equity, peak);

        let Some(reason) = check_termination(&generation, &cfg, learnable, shadows, drawdown, now)
        else {
            return Ok(LifecycleOutcome::NoChange);
        };

        // Exactly one invocation wins the right to end this generation.
        if !self.db.begin_ending_generation(&generation.id)? {
            return Ok(LifecycleOutcome::Skipped("ending_elsewhere".to_string()));
        }
        info!(
            "🔚 Ending generation {} ({}): {} learnable trades, drawdown {:.2}%",
            generation.number,
            reason.as_str(),
            learnable,
            drawdown * 100.0
        );
        self.db.log_event(
            "generation_ending",
            json!({
                "generation_id": generation.id,
                "number": generation.number,
                "reason": reason.as_str(),
                "learnable_trades": learnable,
                "drawdown": drawdown,
            }),
            now,
        )?;

        // Liquidation is durably recorded before finalization, otherwise the
        // open positions' attribution would leak into the next generation.
        let liquidated = self.liquidate_positions(&generation.id, &prices, now)?;

        let total_pnl = self.generation_realized_pnl(&generation.id)?;
        let nav_curve = self.db.nav_curve_since(generation.started_at)?;
        let max_dd = if nav_curve.is_empty() {
            drawdown
        } else {
            fitness::max_drawdown(nav_curve[0].1, &nav_curve)
        };
        if !self
            .db
            .end_generation(&generation.id, reason, total_pnl, learnable, max_dd, now)?
        {
            // Someone else finalized between our steps; the hand-off below is
            // idempotent, so keep going.
            warn!(
                "Generation {} was finalized by a concurrent invocation",
                generation.number
            );
        }
        self.db.retire_agents(&generation.id)?;

        let new_generation = self.db.create_generation(now)?;
        let created = self
            .breeder
            .breed(&generation.id, &new_generation.id)
            .context("breed next cohort")?;
        if !self.db.activate_generation(&new_generation.id)? {
            return Ok(LifecycleOutcome::Skipped("activation_raced".to_string()));
        }

        self.db.log_event(
            "generation_rolled",
            json!({
                "ended": generation.id,
                "new": new_generation.id,
                "number": new_generation.number,
                "agents_created": created,
                "positions_liquidated": liquidated,
                "total_pnl": total_pnl,
            }),
            now,
        )?;
        info!(
            "🧪 Generation {} live: {} agents bred, {} positions liquidated",
            new_generation.number, created, liquidated
        );

        Ok(LifecycleOutcome::Rolled {
            ended_generation: generation.id,
            new_generation: new_generation.id,
            reason,
        })
    }

    /// No active generation: pick up whatever a crashed invocation left
    /// behind. A starting generation is bred (if empty) and activated; bare
    /// ended state gets a fresh successor.
    fn resume_handoff(&self, now: i64) -> Result<LifecycleOutcome> {
        if let Some(starting) = self.db.get_starting_generation()? {
            if self.db.count_generation_agents(&starting.id)? == 0 {
                if let Some(ended) = self.db.get_latest_ended_generation()? {
                    self.breeder
                        .breed(&ended.id, &starting.id)
                        .context("breed resumed cohort")?;
                } else {
                    return Ok(LifecycleOutcome::Skipped(
                        "starting_generation_without_parents".to_string(),
                    ));
                }
            }
            if self.db.activate_generation(&starting.id)? {
                info!("▶️ Resumed hand-off: generation {} live", starting.number);
                return Ok(LifecycleOutcome::Resumed {
                    new_generation: starting.id,
                });
            }
            return Ok(LifecycleOutcome::Skipped("activation_raced".to_string()));
        }

        if let Some(ended) = self.db.get_latest_ended_generation()? {
            let new_generation = self.db.create_generation(now)?;
            self.breeder
                .breed(&ended.id, &new_generation.id)
                .context("breed successor cohort")?;
            if self.db.activate_generation(&new_generation.id)? {
                info!(
                    "▶️ Recovered from ended state: generation {} live",
                    new_generation.number
                );
                return Ok(LifecycleOutcome::Resumed {
                    new_generation: new_generation.id,
                });
            }
            return Ok(LifecycleOutcome::Skipped("activation_raced".to_string()));
        }

        Ok(LifecycleOutcome::Skipped("no_generation".to_string()))
    }

    /// Best available marks and the resulting account equity. Lifecycle
    /// marks tolerate staleness: a forced liquidation at the last known
    /// price beats refusing to end a generation.
    fn current_marks(&self) -> Result<(HashMap<String, f64>, f64)> {
        let rows = self.db.read_market_snapshots(&self.app.symbols)?;
        let prices: HashMap<String, f64> = rows
            .into_iter()
            .map(|(symbol, price, ..)| (symbol, price))
            .collect();

        let account = self
            .db
            .get_account(&self.app.account_id)?
            .context("account missing; run init first")?;
        let mut positions_value = 0.0;
        for position in self.db.list_positions(&self.app.account_id)? {
            let mark = prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.avg_entry_price);
            positions_value += position.quantity * mark;
        }
        Ok((prices, account.cash + positions_value))
    }

    /// Force-sell every open position at mark. Orders are tagged and
    /// non-learnable, and their ids are deterministic per generation so a
    /// crashed retry cannot liquidate twice.
    fn liquidate_positions(
        &self,
        generation_id: &str,
        prices: &HashMap<String, f64>,
        now: i64,
    ) -> Result<usize> {
        let positions = self.db.list_positions(&self.app.account_id)?;
        let mut liquidated = 0;
        for position in positions {
            let mark = prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.avg_entry_price);

            let order_id = Uuid::new_v5(
                &Uuid::NAMESPACE_URL,
                format!("evobot:liquidation:{}:{}", generation_id, position.symbol).as_bytes(),
            )
            .to_string();
            if self.db.order_exists(&order_id)? {
                continue;
            }

            let tags = vec![TAG_FORCED_LIQUIDATION.to_string()];
            let order = OrderRecord {
                id: order_id.clone(),
                account_id: self.app.account_id.clone(),
                agent_id: "system".to_string(),
                generation_id: generation_id.to_string(),
                symbol: position.symbol.clone(),
                side: OrderSide::Sell,
                quantity: position.quantity,
                mode: TradeMode::Paper,
                tags: tags.clone(),
                is_learnable: OrderRecord::compute_learnable(TradeMode::Paper, &tags),
                status: OrderStatus::Filled,
                reject_reason: None,
                created_at: now,
            };
            let fill = FillRecord {
                id: Uuid::new_v4().to_string(),
                order_id,
                agent_id: "system".to_string(),
                generation_id: generation_id.to_string(),
                symbol: position.symbol.clone(),
                side: OrderSide::Sell,
                quantity: position.quantity,
                price: mark,
                fee: 0.0,
                slippage_pct: 0.0,
                is_learnable: false,
                filled_at: now,
            };
            self.db.record_execution(&order, Some(&fill))?;
            liquidated += 1;
            info!(
                "💥 Liquidated {:.6} {} @ {:.2} for generation close",
                position.quantity, position.symbol, mark
            );
        }
        Ok(liquidated)
    }

    /// Realized learnable PnL across the cohort: each agent's fill stream
    /// replayed against its allocation. Liquidation fills are excluded by
    /// construction.
    fn generation_realized_pnl(&self, generation_id: &str) -> Result<f64> {
        let mut total = 0.0;
        for agent in self.db.list_generation_agents(generation_id)? {
            let fills = self.db.list_learnable_fills(&agent.id)?;
            if fills.is_empty() {
                continue;
            }
            let replay = fitness::replay_fills(&fills, agent.capital_allocation);
            total += replay.final_equity - agent.capital_allocation;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::breeding::GeneticBreeder;
    use crate::models::GenerationStatus;

    fn generation_started_at(started_at: i64) -> Generation {
        Generation {
            id: "gen-1".to_string(),
            number: 1,
            status: GenerationStatus::Active,
            started_at,
            ended_at: None,
            termination_reason: None,
            total_pnl: 0.0,
            trade_count: 0,
            max_drawdown: 0.0,
        }
    }

    #[test]
    fn test_termination_time_limit() {
        let cfg = RuntimeConfig::default();
        let generation = generation_started_at(0);
        let limit_secs = (cfg.generation_max_days * 86_400.0) as i64;

        assert_eq!(
            check_termination(&generation, &cfg, 50, 0, 0.0, limit_secs),
            Some(TerminationReason::Time)
        );
        assert_eq!(
            check_termination(&generation, &cfg, 50, 0, 0.0, limit_secs - 1),
            None
        );
    }

    #[test]
    fn test_termination_trade_limit() {
        let cfg = RuntimeConfig::default();
        let generation = generation_started_at(0);

        assert_eq!(
            check_termination(&generation, &cfg, cfg.generation_max_trades, 0, 0.0, 3_600),
            Some(TerminationReason::Trades)
        );
        assert_eq!(
            check_termination(&generation, &cfg, cfg.generation_max_trades - 1, 0, 0.0, 3_600),
            None
        );
    }

    #[test]
    fn test_termination_drawdown_boundary() {
        let cfg = RuntimeConfig::default();
        let generation = generation_started_at(0);

        // Exactly at the 15% limit ends; a hair under does not.
        assert_eq!(
            check_termination(&generation, &cfg, 50, 0, 0.15, 3_600),
            Some(TerminationReason::Drawdown)
        );
        assert_eq!(check_termination(&generation, &cfg, 50, 0, 0.1499, 3_600), None);
    }

    #[test]
    fn test_termination_stagnation_counts_shadows() {
        let cfg = RuntimeConfig::default();
        let generation = generation_started_at(0);
        let old = (cfg.stagnation_days * 86_400.0) as i64 + 3_600;

        // 4 real + 2 shadow = 6 < 10: stagnant.
        assert_eq!(
            check_termination(&generation, &cfg, 4, 2, 0.0, old),
            Some(TerminationReason::Drought)
        );
        // 4 real + 7 shadow = 11: enough evidence to keep going.
        assert_eq!(check_termination(&generation, &cfg, 4, 7, 0.0, old), None);
        // Young generation is never stagnant.
        assert_eq!(check_termination(&generation, &cfg, 0, 0, 0.0, 3_600), None);
    }

    fn seeded_manager(now: i64) -> (LedgerDb, LifecycleManager, String) {
        let db = LedgerDb::open_in_memory().unwrap();
        let app = AppConfig {
            database_path: ":memory:".to_string(),
            account_id: "primary".to_string(),
            symbols: vec!["BTC-USD".to_string()],
            decision_interval_secs: 300,
            starting_capital: 10_000.0,
            exchange_base_url: "http://localhost".to_string(),
            exchange_timeout_secs: 5,
        };
        db.ensure_account(&app.account_id, app.starting_capital, now)
            .unwrap();
        let generation = db.create_generation(now).unwrap();
        db.activate_generation(&generation.id).unwrap();
        let breeder = GeneticBreeder::new(db.clone(), app.symbols.len());
        breeder
            .seed_initial(&generation.id, app.starting_capital, now)
            .unwrap();

        let manager = LifecycleManager::new(
            db.clone(),
            Arc::new(GeneticBreeder::new(db.clone(), app.symbols.len())),
            app,
        );
        (db, manager, generation.id)
    }

    #[test]
    fn test_healthy_generation_continues() {
        let now = 1_700_000_000;
        let (db, manager, generation_id) = seeded_manager(now);
        db.upsert_market_snapshot("BTC-USD", 50_000.0, 1.0, 1e6, 0.1, 1.0, "calm", now)
            .unwrap();

        let outcome = manager.run(now + 3_600).unwrap();
        assert_eq!(outcome, LifecycleOutcome::NoChange);
        assert_eq!(
            db.get_active_generation().unwrap().unwrap().id,
            generation_id
        );
    }

    #[test]
    fn test_time_limit_rolls_generation_with_liquidation() {
        let started = 1_700_000_000;
        let (db, manager, generation_id) = seeded_manager(started);
        db.upsert_market_snapshot("BTC-USD", 52_000.0, 1.0, 1e6, 0.1, 1.0, "calm", started)
            .unwrap();

        // An open position that must be force-closed at roll time.
        let agents = db.list_active_agents(&generation_id).unwrap();
        let order = OrderRecord {
            id: "open-pos".to_string(),
            account_id: "primary".to_string(),
            agent_id: agents[0].id.clone(),
            generation_id: generation_id.clone(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.01,
            mode: TradeMode::Paper,
            tags: Vec::new(),
            is_learnable: true,
            status: OrderStatus::Filled,
            reject_reason: None,
            created_at: started + 100,
        };
        let fill = FillRecord {
            id: "open-pos-fill".to_string(),
            order_id: order.id.clone(),
            agent_id: agents[0].id.clone(),
            generation_id: generation_id.clone(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.01,
            price: 50_000.0,
            fee: 2.5,
            slippage_pct: 0.0,
            is_learnable: true,
            filled_at: started + 100,
        };
        db.record_execution(&order, Some(&fill)).unwrap();
        let cash_before = db.get_account("primary").unwrap().unwrap().cash;

        // 31 days later: past the 30 day limit.
        let later = started + 31 * 86_400;
        let outcome = manager.run(later).unwrap();
        let LifecycleOutcome::Rolled {
            ended_generation,
            new_generation,
            reason,
        } = outcome
        else {
            panic!("expected roll, got {:?}", outcome);
        };
        assert_eq!(ended_generation, generation_id);
        assert_eq!(reason, TerminationReason::Time);

        // Position force-closed at the stored mark and cash credited.
        assert!(db
            .get_position("primary", "BTC-USD")
            .unwrap()
            .is_none());
        let cash_after = db.get_account("primary").unwrap().unwrap().cash;
        assert!((cash_after - (cash_before + 0.01 * 52_000.0)).abs() < 1e-6);

        // Old generation finalized, cohort retired, successor live.
        let ended = db.get_generation(&generation_id).unwrap().unwrap();
        assert_eq!(ended.status, GenerationStatus::Ended);
        assert_eq!(ended.termination_reason, Some(TerminationReason::Time));
        assert!(db.list_active_agents(&generation_id).unwrap().is_empty());
        let active = db.get_active_generation().unwrap().unwrap();
        assert_eq!(active.id, new_generation);
        assert!(!db.list_active_agents(&active.id).unwrap().is_empty());

        // Liquidation order is tagged and excluded from learnable counts.
        assert_eq!(db.count_learnable_orders(&generation_id).unwrap(), 1);

        // Second run sees a healthy young generation.
        assert_eq!(manager.run(later + 60).unwrap(), LifecycleOutcome::NoChange);
    }

    #[test]
    fn test_resume_completes_interrupted_handoff() {
        let now = 1_700_000_000;
        let (db, manager, generation_id) = seeded_manager(now);
        db.upsert_market_snapshot("BTC-USD", 50_000.0, 1.0, 1e6, 0.1, 1.0, "calm", now)
            .unwrap();

        // Simulate a crash mid-roll: old generation fully ended, successor
        // created but never bred or activated.
        assert!(db.begin_ending_generation(&generation_id).unwrap());
        assert!(db
            .end_generation(&generation_id, TerminationReason::Time, 0.0, 0, 0.0, now)
            .unwrap());
        db.retire_agents(&generation_id).unwrap();
        let orphan = db.create_generation(now + 10).unwrap();

        let outcome = manager.run(now + 60).unwrap();
        let LifecycleOutcome::Resumed { new_generation } = outcome else {
            panic!("expected resume, got {:?}", outcome);
        };
        assert_eq!(new_generation, orphan.id);
        let active = db.get_active_generation().unwrap().unwrap();
        assert_eq!(active.id, orphan.id);
        assert!(!db.list_active_agents(&orphan.id).unwrap().is_empty());
    }
}
