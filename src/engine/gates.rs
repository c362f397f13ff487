use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::market::MarketSnapshot;
use crate::models::{reasons, Agent, DecisionKind, GateFailure, PositionRecord, StrategyTemplate};

/// Trades below this many learnable fills scale entry confidence down;
/// a brand-new agent emits zero-confidence entries no matter how strong the
/// raw edge looks.
pub const CONFIDENCE_MATURITY_TRADES: f64 = 30.0;

/// Whether relaxing a gate means lowering or raising its threshold. Getting
/// this wrong silently inverts the gate, so the mapping lives in exactly one
/// place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateClass {
    Min,
    Max,
}

/// Stable gate identifiers. These are telemetry keys: the tuner tallies them
/// out of stored decision events, so renaming one orphans its history.
pub mod gate {
    pub const MOMENTUM_CHANGE: &str = "momentum_change";
    pub const MOMENTUM_TREND: &str = "momentum_trend";
    pub const MOMENTUM_VOLUME: &str = "momentum_volume";
    pub const MOMENTUM_VOLATILITY: &str = "momentum_volatility";
    pub const REVERSION_DROP: &str = "reversion_drop";
    pub const REVERSION_VOLATILITY: &str = "reversion_volatility";
    pub const BREAKOUT_CHANGE: &str = "breakout_change";
    pub const BREAKOUT_VOLATILITY: &str = "breakout_volatility";
    pub const BREAKOUT_VOLUME: &str = "breakout_volume";
}

pub fn entry_gates(template: StrategyTemplate) -> &'static [&'static str] {
    match template {
        StrategyTemplate::Momentum => &[
            gate::MOMENTUM_CHANGE,
            gate::MOMENTUM_TREND,
            gate::MOMENTUM_VOLUME,
            gate::MOMENTUM_VOLATILITY,
        ],
        StrategyTemplate::MeanReversion => &[gate::REVERSION_DROP, gate::REVERSION_VOLATILITY],
        StrategyTemplate::Breakout => &[
            gate::BREAKOUT_CHANGE,
            gate::BREAKOUT_VOLATILITY,
            gate::BREAKOUT_VOLUME,
        ],
    }
}

pub fn gate_class(gate: &str) -> GateClass {
    match gate {
        gate::MOMENTUM_VOLATILITY | gate::REVERSION_VOLATILITY => GateClass::Max,
        _ => GateClass::Min,
    }
}

/// Baseline threshold when the agent's genes don't carry the key. Seeded
/// cohorts always do; this is the safety net for hand-edited agents.
pub fn default_threshold(gate: &str) -> f64 {
    match gate {
        gate::MOMENTUM_CHANGE => 2.0,
        gate::MOMENTUM_TREND => 0.1,
        gate::MOMENTUM_VOLUME => 500_000.0,
        gate::MOMENTUM_VOLATILITY => 2.5,
        gate::REVERSION_DROP => 3.0,
        gate::REVERSION_VOLATILITY => 2.0,
        gate::BREAKOUT_CHANGE => 4.0,
        gate::BREAKOUT_VOLATILITY => 1.5,
        gate::BREAKOUT_VOLUME => 1_000_000.0,
        _ => 1.0,
    }
}

/// Effective thresholds for one agent: gene baselines shifted by the tuner's
/// per-gate offsets, optionally widened further while drought relaxation is
/// in force. Baselines are positive magnitudes by construction, so the
/// multiplicative offset keeps every threshold positive.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSet {
    values: HashMap<String, f64>,
}

impl ThresholdSet {
    pub fn effective(
        agent: &Agent,
        offsets: &HashMap<String, f64>,
        drought_relax: Option<f64>,
        max_relax: f64,
    ) -> Self {
        let mut values = HashMap::new();
        for &gate in entry_gates(agent.template) {
            let base = agent.gene(gate, default_threshold(gate)).abs();
            let offset = offsets
                .get(gate)
                .copied()
                .unwrap_or(0.0)
                .clamp(-max_relax, max_relax);
            let mut value = base * (1.0 + offset);
            if let Some(relax) = drought_relax {
                let relax = relax.clamp(0.0, 0.9);
                value *= match gate_class(gate) {
                    GateClass::Min => 1.0 - relax,
                    GateClass::Max => 1.0 + relax,
                };
            }
            values.insert(gate.to_string(), value.max(1e-9));
        }
        Self { values }
    }

    pub fn baseline(agent: &Agent) -> Self {
        Self::effective(agent, &HashMap::new(), None, 0.0)
    }

    pub fn get(&self, gate: &str) -> f64 {
        self.values
            .get(gate)
            .copied()
            .unwrap_or_else(|| default_threshold(gate))
    }
}

/// Outcome of one gate evaluation for one (agent, symbol) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub decision: DecisionKind,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub exit_reason: Option<String>,
    pub gate_failures: Vec<GateFailure>,
    pub nearest_miss: Option<GateFailure>,
}

impl GateDecision {
    fn hold(reason: &str) -> Self {
        Self {
            decision: DecisionKind::Hold,
            confidence: 0.0,
            reasons: vec![reason.to_string()],
            exit_reason: None,
            gate_failures: Vec::new(),
            nearest_miss: None,
        }
    }
}

struct GateCheck {
    gate: &'static str,
    actual: f64,
}

/// Evaluate one agent against one snapshot. Pure: no clock, no I/O, no
/// randomness — everything it needs arrives as arguments.
///
/// With a position held only the template's exit condition is checked; with
/// no position only the entry condition is. Gate failures are recorded
/// solely for entry gates that were actually checked, so a template whose
/// premise never arms contributes `no_signal` holds with zero failures.
pub fn evaluate(
    agent: &Agent,
    snapshot: &MarketSnapshot,
    position: Option<&PositionRecord>,
    thresholds: &ThresholdSet,
    trade_count: i64,
) -> GateDecision {
    let held_qty = position.map(|p| p.quantity).unwrap_or(0.0);

    if held_qty > 0.0 {
        let Some(position) = position else {
            return GateDecision::hold("position_held");
        };
        return evaluate_exit(agent, snapshot, position, trade_count);
    }

    evaluate_entry(agent, snapshot, thresholds, trade_count)
}

fn evaluate_entry(
    agent: &Agent,
    snapshot: &MarketSnapshot,
    thresholds: &ThresholdSet,
    trade_count: i64,
) -> GateDecision {
    // Template premise: when the market shape makes this template
    // inapplicable, the entry condition is not checked at all.
    let armed = match agent.template {
        StrategyTemplate::Momentum => snapshot.change_24h > 0.0,
        StrategyTemplate::MeanReversion => snapshot.change_24h < 0.0,
        StrategyTemplate::Breakout => snapshot.trend_slope > 0.0,
    };
    if !armed {
        return GateDecision::hold(reasons::NO_SIGNAL);
    }

    let checks: Vec<GateCheck> = entry_gates(agent.template)
        .iter()
        .map(|&g| GateCheck {
            gate: g,
            actual: gate_actual(g, snapshot),
        })
        .collect();

    let mut failures = Vec::new();
    let mut pass_margins = Vec::new();
    for check in &checks {
        let threshold = thresholds.get(check.gate);
        let margin = match gate_class(check.gate) {
            GateClass::Min => check.actual - threshold,
            GateClass::Max => threshold - check.actual,
        };
        if margin < 0.0 {
            failures.push(GateFailure {
                gate: check.gate.to_string(),
                actual: check.actual,
                threshold,
                margin,
            });
        } else {
            pass_margins.push(margin / threshold.abs().max(1e-9));
        }
    }

    if !failures.is_empty() {
        // Nearest miss: the failure with the smallest distance to passing.
        let nearest = failures
            .iter()
            .cloned()
            .max_by(|a, b| a.margin.partial_cmp(&b.margin).unwrap_or(std::cmp::Ordering::Equal));
        return GateDecision {
            decision: DecisionKind::Hold,
            confidence: 0.0,
            reasons: vec![format!("{}_gates_failed", agent.template.as_str())],
            exit_reason: None,
            gate_failures: failures,
            nearest_miss: nearest,
        };
    }

    // All gates cleared: raw edge from normalized clearance, then maturity
    // calibration so cold-start agents stay quiet.
    let avg_excess = if pass_margins.is_empty() {
        0.0
    } else {
        pass_margins.iter().sum::<f64>() / pass_margins.len() as f64
    };
    let raw = (0.5 + 0.5 * avg_excess.min(1.0)).clamp(0.0, 1.0);
    let confidence = calibrate_confidence(raw, trade_count);

    GateDecision {
        decision: DecisionKind::Buy,
        confidence,
        reasons: vec![format!("{}_entry", agent.template.as_str())],
        exit_reason: None,
        gate_failures: Vec::new(),
        nearest_miss: None,
    }
}

fn evaluate_exit(
    agent: &Agent,
    snapshot: &MarketSnapshot,
    position: &PositionRecord,
    trade_count: i64,
) -> GateDecision {
    let entry = position.avg_entry_price.max(1e-9);
    let pnl_pct = (snapshot.price - entry) / entry;

    let stop_loss = agent.gene("stop_loss_pct", 0.05).abs();
    let take_profit = agent.gene("take_profit_pct", 0.08).abs();

    let exit: Option<(&str, f64)> = if pnl_pct <= -stop_loss {
        Some(("stop_loss", 0.9))
    } else if pnl_pct >= take_profit {
        Some(("take_profit", 0.75))
    } else {
        match agent.template {
            StrategyTemplate::Momentum => {
                let reversal = agent.gene("exit_trend_slope", 0.05).abs();
                (snapshot.trend_slope < -reversal).then_some(("trend_reversal", 0.6))
            }
            StrategyTemplate::MeanReversion => {
                let recovery = agent.gene("exit_recovery_pct", 1.0).abs();
                (snapshot.change_24h >= recovery).then_some(("reverted_to_mean", 0.6))
            }
            StrategyTemplate::Breakout => {
                let fade = agent.gene("exit_trend_slope", 0.05).abs();
                (snapshot.trend_slope < -fade).then_some(("momentum_fade", 0.6))
            }
        }
    };

    match exit {
        Some((reason, raw)) => GateDecision {
            decision: DecisionKind::Sell,
            confidence: calibrate_confidence(raw, trade_count),
            reasons: vec![format!("{}_exit", agent.template.as_str())],
            exit_reason: Some(reason.to_string()),
            gate_failures: Vec::new(),
            nearest_miss: None,
        },
        None => GateDecision::hold("position_held"),
    }
}

fn gate_actual(gate: &str, snapshot: &MarketSnapshot) -> f64 {
    match gate {
        gate::MOMENTUM_CHANGE | gate::BREAKOUT_CHANGE => snapshot.change_24h,
        gate::MOMENTUM_TREND => snapshot.trend_slope,
        gate::MOMENTUM_VOLUME | gate::BREAKOUT_VOLUME => snapshot.volume_24h,
        gate::MOMENTUM_VOLATILITY | gate::REVERSION_VOLATILITY | gate::BREAKOUT_VOLATILITY => {
            snapshot.volatility_ratio
        }
        // Drop magnitude: a -4% day has a drop of 4.
        gate::REVERSION_DROP => -snapshot.change_24h,
        _ => 0.0,
    }
}

pub fn calibrate_confidence(raw: f64, trade_count: i64) -> f64 {
    let maturity = (trade_count.max(0) as f64 / CONFIDENCE_MATURITY_TRADES).min(1.0);
    (raw * maturity).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::models::{AgentRole, AgentStatus};

    fn agent(template: StrategyTemplate, genes: &[(&str, f64)]) -> Agent {
        Agent {
            id: "a1".to_string(),
            generation_id: "g1".to_string(),
            name: "test-agent".to_string(),
            template,
            genes: genes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            capital_allocation: 1_000.0,
            role: AgentRole::Core,
            status: AgentStatus::Active,
            created_at: 0,
        }
    }

    fn snapshot(change_24h: f64, volume: f64, trend: f64, vol_ratio: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTC-USD".to_string(),
            price: 50_000.0,
            change_24h,
            volume_24h: volume,
            trend_slope: trend,
            volatility_ratio: vol_ratio,
            regime: "trending".to_string(),
            updated_at: 0,
        }
    }

    fn position(qty: f64, avg_entry: f64) -> PositionRecord {
        PositionRecord {
            account_id: "acct".to_string(),
            symbol: "BTC-USD".to_string(),
            quantity: qty,
            avg_entry_price: avg_entry,
            updated_at: 0,
        }
    }

    #[test]
    fn test_unarmed_premise_is_no_signal_with_zero_failures() {
        let a = agent(StrategyTemplate::Momentum, &[("momentum_change", 2.0)]);
        // Market is down: momentum entry is not applicable, not "failed".
        let snap = snapshot(-1.5, 1e6, 0.3, 1.0);
        let d = evaluate(&a, &snap, None, &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Hold);
        assert!(d.reasons.iter().any(|r| r == reasons::NO_SIGNAL));
        assert!(d.gate_failures.is_empty());
        assert!(d.nearest_miss.is_none());
    }

    #[test]
    fn test_failing_gates_record_margins_and_nearest_miss() {
        let a = agent(
            StrategyTemplate::Momentum,
            &[
                ("momentum_change", 2.0),
                ("momentum_trend", 0.2),
                ("momentum_volume", 1_000_000.0),
                ("momentum_volatility", 2.5),
            ],
        );
        // change passes (2.5 > 2.0), trend fails barely, volume fails badly.
        let snap = snapshot(2.5, 400_000.0, 0.18, 1.0);
        let d = evaluate(&a, &snap, None, &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Hold);
        assert_eq!(d.gate_failures.len(), 2);
        for f in &d.gate_failures {
            assert!(f.margin < 0.0, "failure margins are negative: {:?}", f);
        }
        let nearest = d.nearest_miss.expect("nearest miss present");
        assert_eq!(nearest.gate, gate::MOMENTUM_TREND);
        assert!((nearest.margin - (0.18 - 0.2)).abs() < 1e-9);
    }

    #[test]
    fn test_all_gates_clear_produces_buy() {
        let a = agent(
            StrategyTemplate::Momentum,
            &[
                ("momentum_change", 2.0),
                ("momentum_trend", 0.1),
                ("momentum_volume", 500_000.0),
                ("momentum_volatility", 2.5),
            ],
        );
        let snap = snapshot(3.5, 2_000_000.0, 0.5, 1.2);
        let d = evaluate(&a, &snap, None, &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Buy);
        assert!(d.confidence > 0.5);
        assert!(d.gate_failures.is_empty());
    }

    #[test]
    fn test_confidence_calibration_scales_with_history() {
        let raw = 0.8;
        assert!((calibrate_confidence(raw, 0) - 0.0).abs() < 1e-12);
        assert!((calibrate_confidence(raw, 15) - 0.4).abs() < 1e-12);
        assert!((calibrate_confidence(raw, 30) - 0.8).abs() < 1e-12);
        assert!((calibrate_confidence(raw, 500) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_max_class_gate_blocks_high_volatility_entries() {
        let a = agent(
            StrategyTemplate::MeanReversion,
            &[("reversion_drop", 3.0), ("reversion_volatility", 2.0)],
        );
        // Deep drop but chaotic tape: volatility gate must fail.
        let snap = snapshot(-5.0, 1e6, -0.2, 3.5);
        let d = evaluate(&a, &snap, None, &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Hold);
        assert_eq!(d.gate_failures.len(), 1);
        assert_eq!(d.gate_failures[0].gate, gate::REVERSION_VOLATILITY);
        // Max class: margin = threshold - actual = 2.0 - 3.5.
        assert!((d.gate_failures[0].margin - (2.0 - 3.5)).abs() < 1e-9);
    }

    #[test]
    fn test_exit_stop_loss_overrides_everything() {
        let a = agent(StrategyTemplate::Momentum, &[("stop_loss_pct", 0.05)]);
        let snap = snapshot(3.0, 2e6, 0.5, 1.0); // entry would also fire
        let pos = position(0.01, 53_000.0); // price 50k => ~-5.7%
        let d = evaluate(&a, &snap, Some(&pos), &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Sell);
        assert_eq!(d.exit_reason.as_deref(), Some("stop_loss"));
        assert!(d.confidence > 0.8);
    }

    #[test]
    fn test_holding_without_exit_reports_position_held() {
        let a = agent(StrategyTemplate::Momentum, &[]);
        let snap = snapshot(1.0, 2e6, 0.2, 1.0);
        let pos = position(0.01, 49_500.0); // ~+1%, between stop and target
        let d = evaluate(&a, &snap, Some(&pos), &ThresholdSet::baseline(&a), 100);

        assert_eq!(d.decision, DecisionKind::Hold);
        assert!(d.reasons.iter().any(|r| r == "position_held"));
        assert!(d.gate_failures.is_empty());
    }

    #[test]
    fn test_threshold_offsets_respect_gate_class() {
        let a = agent(
            StrategyTemplate::MeanReversion,
            &[("reversion_drop", 3.0), ("reversion_volatility", 2.0)],
        );

        let baseline = ThresholdSet::baseline(&a);
        let mut offsets = HashMap::new();
        offsets.insert(gate::REVERSION_DROP.to_string(), -0.10);
        offsets.insert(gate::REVERSION_VOLATILITY.to_string(), 0.10);
        let relaxed = ThresholdSet::effective(&a, &offsets, None, 0.30);

        // Min gate relaxed: effective threshold strictly decreases.
        assert!(relaxed.get(gate::REVERSION_DROP) < baseline.get(gate::REVERSION_DROP));
        // Max gate relaxed: effective threshold strictly increases.
        assert!(relaxed.get(gate::REVERSION_VOLATILITY) > baseline.get(gate::REVERSION_VOLATILITY));
    }

    #[test]
    fn test_drought_relax_widens_in_class_direction() {
        let a = agent(
            StrategyTemplate::Momentum,
            &[("momentum_change", 2.0), ("momentum_volatility", 2.5)],
        );
        let baseline = ThresholdSet::baseline(&a);
        let relaxed = ThresholdSet::effective(&a, &HashMap::new(), Some(0.15), 0.30);

        assert!(relaxed.get(gate::MOMENTUM_CHANGE) < baseline.get(gate::MOMENTUM_CHANGE));
        assert!(relaxed.get(gate::MOMENTUM_VOLATILITY) > baseline.get(gate::MOMENTUM_VOLATILITY));
    }
}
