use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ledger::LedgerDb;
use crate::models::{Agent, FillRecord, OrderSide, RuntimeConfig, ShadowTrade};

/// Composite weights. Fixed by design; tuning selection pressure happens
/// through the config knobs (caps, floors), not by reweighting the score.
const W_PNL: f64 = 0.35;
const W_SHARPE: f64 = 0.25;
const W_PROFIT_DAYS: f64 = 0.15;
const W_DRAWDOWN: f64 = 0.15;
const W_OVERTRADING: f64 = 0.10;

/// Overtrading arms only once fees eat past this share of gross profit.
const FEE_DRAG_THRESHOLD: f64 = 0.30;

/// Shadow blend: real weight ramps 0.3 -> 0.7 as the real sample approaches
/// the minimum floor. Empirically tuned upstream; do not re-derive.
const SHADOW_BLEND_BASE: f64 = 0.3;
const SHADOW_BLEND_RANGE: f64 = 0.4;

const SECS_PER_DAY: i64 = 86_400;
const QTY_EPSILON: f64 = 1e-9;

/// Everything the composite is built from, kept for dashboards and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitnessMetrics {
    pub trade_count: i64,
    pub realized_trades: i64,
    pub total_pnl: f64,
    pub total_fees: f64,
    pub gross_profit: f64,
    pub final_equity: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub profitable_day_ratio: f64,
    pub overtrading_penalty: f64,
    pub diversity_penalty: f64,
    pub symbols_traded: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitnessReport {
    pub agent_id: String,
    /// Final score after any shadow blending.
    pub score: f64,
    pub real_score: f64,
    pub shadow_score: Option<f64>,
    pub metrics: FitnessMetrics,
}

/// Per-symbol average-entry basis.
#[derive(Debug, Clone, Copy)]
struct Lot {
    quantity: f64,
    avg_entry: f64,
}

/// Result of replaying a fill stream against starting capital.
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub curve: Vec<(i64, f64)>,
    pub trade_pnls: Vec<f64>,
    pub total_fees: f64,
    pub gross_profit: f64,
    pub final_equity: f64,
    pub symbols_traded: HashSet<String>,
    pub fill_count: i64,
}

/// Replay chronologically sorted fills with average-entry accounting. A buy
/// re-weights the average entry and charges its fee immediately; a sell
/// realizes `(price - avg_entry) * min(qty, held) - fee`. Sells beyond the
/// held quantity realize only the held part.
pub fn replay_fills(fills: &[FillRecord], starting_capital: f64) -> Replay {
    let mut lots: HashMap<&str, Lot> = HashMap::new();
    let mut equity = starting_capital;
    let mut out = Replay {
        curve: Vec::with_capacity(fills.len() + 1),
        ..Replay::default()
    };

    for fill in fills {
        match fill.side {
            OrderSide::Buy => {
                let lot = lots.entry(fill.symbol.as_str()).or_insert(Lot {
                    quantity: 0.0,
                    avg_entry: 0.0,
                });
                let new_qty = lot.quantity + fill.quantity;
                if new_qty > QTY_EPSILON {
                    lot.avg_entry = (lot.quantity * lot.avg_entry
                        + fill.quantity * fill.price)
                        / new_qty;
                }
                lot.quantity = new_qty;
                equity -= fill.fee;
                out.total_fees += fill.fee;
            }
            OrderSide::Sell => {
                let Some(lot) = lots.get_mut(fill.symbol.as_str()) else {
                    warn!(
                        "Fill {} sells {} with no cost basis; skipped",
                        fill.id, fill.symbol
                    );
                    continue;
                };
                let sold = fill.quantity.min(lot.quantity);
                let pnl = (fill.price - lot.avg_entry) * sold - fill.fee;
                equity += pnl;
                out.total_fees += fill.fee;
                out.trade_pnls.push(pnl);
                if pnl > 0.0 {
                    out.gross_profit += pnl;
                }
                lot.quantity -= sold;
                if lot.quantity <= QTY_EPSILON {
                    lots.remove(fill.symbol.as_str());
                }
            }
        }
        out.symbols_traded.insert(fill.symbol.clone());
        out.curve.push((fill.filled_at, equity));
        out.fill_count += 1;
    }

    out.final_equity = equity;
    out
}

/// Peak-to-trough drawdown over an equity curve, as a fraction of the peak.
pub fn max_drawdown(starting_capital: f64, curve: &[(i64, f64)]) -> f64 {
    let mut peak = starting_capital.max(0.0);
    let mut worst = 0.0_f64;
    for &(_, equity) in curve {
        if equity > peak {
            peak = equity;
        } else if peak > 0.0 {
            worst = worst.max((peak - equity) / peak);
        }
    }
    worst.clamp(0.0, 1.0)
}

/// Daily returns: group the curve by UTC day, each day's return measured
/// against the equity at its start. Days with no fills contribute nothing.
pub fn daily_returns(starting_capital: f64, curve: &[(i64, f64)]) -> Vec<f64> {
    if curve.is_empty() {
        return Vec::new();
    }
    let mut returns = Vec::new();
    let mut day = curve[0].0.div_euclid(SECS_PER_DAY);
    let mut day_start_equity = starting_capital;
    let mut last_equity = starting_capital;

    for &(ts, equity) in curve {
        let this_day = ts.div_euclid(SECS_PER_DAY);
        if this_day != day {
            if day_start_equity > 0.0 {
                returns.push((last_equity - day_start_equity) / day_start_equity);
            }
            day = this_day;
            day_start_equity = last_equity;
        }
        last_equity = equity;
    }
    if day_start_equity > 0.0 {
        returns.push((last_equity - day_start_equity) / day_start_equity);
    }
    returns
}

/// Sharpe-like ratio over daily returns, annualized by sqrt(365) and clamped
/// to [-3, 3]. Degenerate inputs (under two days, zero variance) score 0.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std < 1e-12 {
        return 0.0;
    }
    (mean / std * 365.0_f64.sqrt()).clamp(-3.0, 3.0)
}

/// Overtrading penalty in [0, 1]. Arms on fee drag past 30% of gross profit
/// or on trade frequency past the per-day cap, whichever bites harder.
pub fn overtrading_penalty(
    total_fees: f64,
    gross_profit: f64,
    fills: i64,
    active_days: f64,
    max_trades_per_day: f64,
) -> f64 {
    let fee_component = if total_fees <= 0.0 {
        0.0
    } else if gross_profit > 0.0 {
        let ratio = total_fees / gross_profit;
        ((ratio - FEE_DRAG_THRESHOLD) / (1.0 - FEE_DRAG_THRESHOLD)).clamp(0.0, 1.0)
    } else {
        // Paying fees with nothing gross to show for it.
        1.0
    };

    let freq_component = if active_days > 0.0 && max_trades_per_day > 0.0 {
        let per_day = fills as f64 / active_days;
        ((per_day - max_trades_per_day) / max_trades_per_day).clamp(0.0, 1.0)
    } else {
        0.0
    };

    fee_component.max(freq_component)
}

/// Diversity penalty in [0, cap]: zero when the agent spreads across the
/// available symbols, full cap when it trades exactly one of many. Applies
/// only past the minimum sample size.
pub fn diversity_penalty(
    symbols_traded: usize,
    symbols_available: usize,
    fills: i64,
    min_sample: i64,
    cap: f64,
) -> f64 {
    if fills < min_sample || symbols_available <= 1 || symbols_traded == 0 {
        return 0.0;
    }
    let spread = (symbols_traded - 1) as f64 / (symbols_available - 1) as f64;
    (cap * (1.0 - spread)).clamp(0.0, cap)
}

/// Score one fill stream. Exactly 0.0 for an empty stream: every component
/// is neutral, and no penalty may push a never-traded agent negative.
pub fn score_fills(
    fills: &[FillRecord],
    starting_capital: f64,
    cfg: &RuntimeConfig,
    symbols_available: usize,
) -> (f64, FitnessMetrics) {
    if fills.is_empty() {
        return (0.0, FitnessMetrics::default());
    }

    let replay = replay_fills(fills, starting_capital);
    let dd = max_drawdown(starting_capital, &replay.curve);
    let returns = daily_returns(starting_capital, &replay.curve);
    let sharpe = sharpe_ratio(&returns);
    let profitable_days = returns.iter().filter(|r| **r > 0.0).count();
    let profitable_day_ratio = if returns.is_empty() {
        0.0
    } else {
        profitable_days as f64 / returns.len() as f64
    };

    let active_days = if replay.curve.is_empty() {
        0.0
    } else {
        let first = replay.curve[0].0.div_euclid(SECS_PER_DAY);
        let last = replay.curve[replay.curve.len() - 1].0.div_euclid(SECS_PER_DAY);
        (last - first + 1) as f64
    };
    let overtrading = overtrading_penalty(
        replay.total_fees,
        replay.gross_profit,
        replay.fill_count,
        active_days,
        cfg.fitness_max_trades_per_day,
    );
    let diversity = diversity_penalty(
        replay.symbols_traded.len(),
        symbols_available,
        replay.fill_count,
        cfg.min_sample_trades,
        cfg.fitness_diversity_cap,
    );

    let total_pnl = replay.final_equity - starting_capital;
    let pnl_score = if starting_capital > 0.0 {
        (total_pnl / starting_capital).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let sharpe_score = sharpe / 3.0;

    let composite = W_PNL * pnl_score + W_SHARPE * sharpe_score
        + W_PROFIT_DAYS * profitable_day_ratio
        - W_DRAWDOWN * dd
        - W_OVERTRADING * overtrading
        - diversity;

    // Small samples get up to a 50% haircut so two lucky trades cannot
    // outrank a season of steady ones.
    let maturity = 0.5
        + 0.5 * (replay.fill_count as f64 / cfg.min_sample_trades.max(1) as f64).min(1.0);
    let score = composite * maturity;

    let metrics = FitnessMetrics {
        trade_count: replay.fill_count,
        realized_trades: replay.trade_pnls.len() as i64,
        total_pnl,
        total_fees: replay.total_fees,
        gross_profit: replay.gross_profit,
        final_equity: replay.final_equity,
        max_drawdown: dd,
        sharpe,
        profitable_day_ratio,
        overtrading_penalty: overtrading,
        diversity_penalty: diversity,
        symbols_traded: replay.symbols_traded.len(),
    };
    (score, metrics)
}

/// Resolved counterfactuals as a synthetic fill stream: entry at creation,
/// exit at resolution, no fees (a shadow never touched the venue).
pub fn shadow_fills(trades: &[ShadowTrade]) -> Vec<FillRecord> {
    let mut fills = Vec::with_capacity(trades.len() * 2);
    for trade in trades {
        let (Some(resolved_at), Some(exit_price)) = (trade.resolved_at, trade.exit_price) else {
            continue;
        };
        let entry_side = trade.side;
        let exit_side = match trade.side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };
        fills.push(FillRecord {
            id: format!("{}-entry", trade.id),
            order_id: trade.id.clone(),
            agent_id: trade.agent_id.clone(),
            generation_id: trade.generation_id.clone(),
            symbol: trade.symbol.clone(),
            side: entry_side,
            quantity: trade.quantity,
            price: trade.entry_price,
            fee: 0.0,
            slippage_pct: 0.0,
            is_learnable: false,
            filled_at: trade.created_at,
        });
        fills.push(FillRecord {
            id: format!("{}-exit", trade.id),
            order_id: trade.id.clone(),
            agent_id: trade.agent_id.clone(),
            generation_id: trade.generation_id.clone(),
            symbol: trade.symbol.clone(),
            side: exit_side,
            quantity: trade.quantity,
            price: exit_price,
            fee: 0.0,
            slippage_pct: 0.0,
            is_learnable: false,
            filled_at: resolved_at,
        });
    }
    fills.sort_by(|a, b| {
        a.filled_at
            .cmp(&b.filled_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    fills
}

/// Maturity-weighted blend: majority-shadow while the real sample is thin,
/// majority-real once it approaches the floor. Constants preserved from the
/// tuned originals.
pub fn blend_weight(real_fills: i64, floor: i64) -> f64 {
    let progress = (real_fills.max(0) as f64 / floor.max(1) as f64).min(1.0);
    SHADOW_BLEND_BASE + SHADOW_BLEND_RANGE * progress
}

pub struct FitnessEngine {
    db: LedgerDb,
}

impl FitnessEngine {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    /// Score one agent: real fills first, with the shadow stream blended in
    /// only while the real sample is below the minimum floor.
    pub fn score_agent(
        &self,
        agent: &Agent,
        cfg: &RuntimeConfig,
        symbols_available: usize,
    ) -> Result<FitnessReport> {
        let fills = self.db.list_learnable_fills(&agent.id)?;
        let (real_score, metrics) = score_fills(
            &fills,
            agent.capital_allocation,
            cfg,
            symbols_available,
        );

        let real_count = fills.len() as i64;
        let mut score = real_score;
        let mut shadow_score = None;

        if real_count < cfg.min_sample_trades {
            let shadows = self.db.list_resolved_shadow_trades(&agent.id)?;
            let synthetic = shadow_fills(&shadows);
            if !synthetic.is_empty() {
                let (s_score, _) = score_fills(
                    &synthetic,
                    agent.capital_allocation,
                    cfg,
                    symbols_available,
                );
                let w_real = blend_weight(real_count, cfg.min_sample_trades);
                score = w_real * real_score + (1.0 - w_real) * s_score;
                shadow_score = Some(s_score);
            }
        }

        Ok(FitnessReport {
            agent_id: agent.id.clone(),
            score,
            real_score,
            shadow_score,
            metrics,
        })
    }

    /// Score and rank a generation's active agents, best first. Ties break
    /// by agent id so the ordering is reproducible.
    pub fn rank_generation(
        &self,
        generation_id: &str,
        cfg: &RuntimeConfig,
        symbols_available: usize,
    ) -> Result<Vec<FitnessReport>> {
        let agents = self.db.list_active_agents(generation_id)?;
        let mut reports = Vec::with_capacity(agents.len());
        for agent in &agents {
            let report = self.score_agent(agent, cfg, symbols_available)?;
            debug!(
                "Fitness {}: {:.4} (real {:.4}, {} fills)",
                agent.id, report.score, report.real_score, report.metrics.trade_count
            );
            reports.push(report);
        }
        reports.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(symbol: &str, side: OrderSide, qty: f64, price: f64, fee: f64, ts: i64) -> FillRecord {
        FillRecord {
            id: format!("f-{}-{}", symbol, ts),
            order_id: "o".to_string(),
            agent_id: "a".to_string(),
            generation_id: "g".to_string(),
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            price,
            fee,
            slippage_pct: 0.0,
            is_learnable: true,
            filled_at: ts,
        }
    }

    #[test]
    fn test_round_trip_realizes_documented_pnl() {
        // $1000, buy 0.01 BTC @ 50k (fee 5), sell @ 51k (fee 5.10).
        let fills = vec![
            fill("BTC-USD", OrderSide::Buy, 0.01, 50_000.0, 5.0, 1_000),
            fill("BTC-USD", OrderSide::Sell, 0.01, 51_000.0, 5.10, 2_000),
        ];
        let replay = replay_fills(&fills, 1_000.0);

        assert_eq!(replay.trade_pnls.len(), 1);
        assert!((replay.trade_pnls[0] - 4.90).abs() < 1e-9);
        assert!((replay.final_equity - 999.90).abs() < 1e-9);
        assert!((replay.total_fees - 10.10).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_average_entry_across_buys() {
        let fills = vec![
            fill("ETH-USD", OrderSide::Buy, 1.0, 3_000.0, 0.0, 1_000),
            fill("ETH-USD", OrderSide::Buy, 1.0, 3_200.0, 0.0, 2_000),
            // Sell half the stack at 3_400 against a 3_100 average.
            fill("ETH-USD", OrderSide::Sell, 1.0, 3_400.0, 0.0, 3_000),
        ];
        let replay = replay_fills(&fills, 10_000.0);
        assert!((replay.trade_pnls[0] - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_never_realizes_more_than_held() {
        let fills = vec![
            fill("BTC-USD", OrderSide::Buy, 0.01, 50_000.0, 0.0, 1_000),
            // Requests double the held quantity; only 0.01 can realize.
            fill("BTC-USD", OrderSide::Sell, 0.02, 51_000.0, 0.0, 2_000),
        ];
        let replay = replay_fills(&fills, 1_000.0);
        assert!((replay.trade_pnls[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_without_basis_is_skipped() {
        let fills = vec![fill("BTC-USD", OrderSide::Sell, 0.01, 50_000.0, 1.0, 1_000)];
        let replay = replay_fills(&fills, 1_000.0);
        assert!(replay.trade_pnls.is_empty());
        assert!((replay.final_equity - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_trades_scores_exactly_zero() {
        let cfg = RuntimeConfig::default();
        let (score, metrics) = score_fills(&[], 1_000.0, &cfg, 6);
        assert_eq!(score, 0.0);
        assert_eq!(metrics.trade_count, 0);
    }

    #[test]
    fn test_drawdown_measured_from_peak() {
        let curve = vec![(1, 1_100.0), (2, 1_200.0), (3, 960.0), (4, 1_000.0)];
        // Peak 1200, trough 960: 20%.
        assert!((max_drawdown(1_000.0, &curve) - 0.20).abs() < 1e-9);
        assert_eq!(max_drawdown(1_000.0, &[]), 0.0);
    }

    #[test]
    fn test_daily_returns_use_day_start_equity() {
        let day = SECS_PER_DAY;
        let curve = vec![
            (day, 1_010.0),          // day 1 ends +1%
            (2 * day + 100, 1_020.0) // day 2 ends ~+0.99% on 1010
        ];
        let returns = daily_returns(1_000.0, &curve);
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.01).abs() < 1e-9);
        assert!((returns[1] - (10.0 / 1_010.0)).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_clamps_and_degenerates_to_zero() {
        assert_eq!(sharpe_ratio(&[]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01]), 0.0);
        assert_eq!(sharpe_ratio(&[0.01, 0.01, 0.01]), 0.0); // zero variance

        let strong = vec![0.01, 0.012, 0.009, 0.011, 0.010];
        assert!((sharpe_ratio(&strong) - 3.0).abs() < 1e-9);

        let weak = vec![-0.01, -0.012, -0.009, -0.011];
        assert!((sharpe_ratio(&weak) - (-3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_overtrading_arms_on_fee_drag() {
        // Fees at 20% of gross: quiet.
        assert_eq!(overtrading_penalty(20.0, 100.0, 10, 10.0, 20.0), 0.0);
        // Fees at 65% of gross: halfway between the 30% trigger and total.
        let p = overtrading_penalty(65.0, 100.0, 10, 10.0, 20.0);
        assert!((p - 0.5).abs() < 1e-9);
        // Frequency breach with benign fees.
        let p = overtrading_penalty(1.0, 100.0, 300, 10.0, 20.0);
        assert!(p > 0.0);
    }

    #[test]
    fn test_diversity_penalty_gating() {
        // Below the sample floor: no penalty regardless of concentration.
        assert_eq!(diversity_penalty(1, 6, 5, 10, 0.10), 0.0);
        // Single symbol of many, past the floor: full cap.
        assert!((diversity_penalty(1, 6, 20, 10, 0.10) - 0.10).abs() < 1e-12);
        // Fully spread: no penalty.
        assert_eq!(diversity_penalty(6, 6, 20, 10, 0.10), 0.0);
        // Only one symbol exists at all: nothing to diversify into.
        assert_eq!(diversity_penalty(1, 1, 20, 10, 0.10), 0.0);
    }

    #[test]
    fn test_profitable_run_outscores_losing_run() {
        let cfg = RuntimeConfig::default();
        let winner: Vec<FillRecord> = (0..6)
            .flat_map(|i| {
                let base = 1_000 + i * 2 * SECS_PER_DAY;
                vec![
                    fill("BTC-USD", OrderSide::Buy, 0.01, 50_000.0, 1.0, base),
                    fill("BTC-USD", OrderSide::Sell, 0.01, 51_000.0, 1.0, base + SECS_PER_DAY),
                ]
            })
            .collect();
        let loser: Vec<FillRecord> = (0..6)
            .flat_map(|i| {
                let base = 1_000 + i * 2 * SECS_PER_DAY;
                vec![
                    fill("BTC-USD", OrderSide::Buy, 0.01, 50_000.0, 1.0, base),
                    fill("BTC-USD", OrderSide::Sell, 0.01, 49_000.0, 1.0, base + SECS_PER_DAY),
                ]
            })
            .collect();

        let (w, _) = score_fills(&winner, 1_000.0, &cfg, 6);
        let (l, _) = score_fills(&loser, 1_000.0, &cfg, 6);
        assert!(w > l);
        assert!(w > 0.0);
        assert!(l < 0.0);
    }

    #[test]
    fn test_blend_weight_ramps_with_real_sample() {
        assert!((blend_weight(0, 10) - 0.3).abs() < 1e-12);
        assert!((blend_weight(5, 10) - 0.5).abs() < 1e-12);
        assert!((blend_weight(10, 10) - 0.7).abs() < 1e-12);
        assert!((blend_weight(50, 10) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_shadow_fill_synthesis() {
        let trades = vec![ShadowTrade {
            id: "s1".to_string(),
            agent_id: "a".to_string(),
            generation_id: "g".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.01,
            entry_price: 50_000.0,
            created_at: 1_000,
            resolved_at: Some(2_000),
            exit_price: Some(52_000.0),
            pnl: Some(20.0),
        }];
        let fills = shadow_fills(&trades);
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[0].side, OrderSide::Buy);
        assert_eq!(fills[1].side, OrderSide::Sell);

        let replay = replay_fills(&fills, 1_000.0);
        assert!((replay.trade_pnls[0] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_engine_blends_only_below_floor() {
        let db = LedgerDb::open_in_memory().unwrap();
        let cfg = RuntimeConfig::default();
        let now = 1_000;
        let generation = db.create_generation(now).unwrap();
        db.activate_generation(&generation.id).unwrap();

        let agent = Agent {
            id: "agent-1".to_string(),
            generation_id: generation.id.clone(),
            name: "a1".to_string(),
            template: crate::models::StrategyTemplate::Momentum,
            genes: HashMap::new(),
            capital_allocation: 1_000.0,
            role: crate::models::AgentRole::Core,
            status: crate::models::AgentStatus::Active,
            created_at: now,
        };
        db.insert_agents(std::slice::from_ref(&agent)).unwrap();

        // No real fills, one profitable resolved shadow.
        db.insert_shadow_trade(&ShadowTrade {
            id: "s1".to_string(),
            agent_id: agent.id.clone(),
            generation_id: generation.id.clone(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.01,
            entry_price: 50_000.0,
            created_at: now,
            resolved_at: None,
            exit_price: None,
            pnl: None,
        })
        .unwrap();
        assert!(db
            .resolve_shadow_trade("s1", 52_000.0, 20.0, now + 3_600)
            .unwrap());

        let engine = FitnessEngine::new(db.clone());
        let report = engine.score_agent(&agent, &cfg, 6).unwrap();

        // Real component is exactly zero; the blend leans 70% shadow.
        assert_eq!(report.real_score, 0.0);
        let shadow = report.shadow_score.expect("shadow stream scored");
        assert!((report.score - 0.7 * shadow).abs() < 1e-9);
    }
}
