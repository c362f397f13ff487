use std::collections::HashMap;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};

use crate::engine::gates::{gate_class, GateClass};
use crate::ledger::LedgerDb;
use crate::models::{DecisionEvent, DroughtSnapshot, RuntimeConfig, TuningState};

/// Offsets whose magnitude falls below this are dropped from the map.
const OFFSET_EPSILON: f64 = 1e-6;

/// What the tuner did this invocation, for the event log.
#[derive(Debug, Clone, PartialEq)]
pub enum TuneAction {
    /// Nothing to do: tuning disabled, or no offsets and no drought.
    Idle,
    /// Drought inactive: existing offsets stepped back toward zero.
    Decayed { gates: Vec<String> },
    /// Drought active: exactly one gate relaxed by one step.
    Relaxed { gate: String, offset: f64 },
    /// Drought active but the adjustment cooldown has not elapsed.
    CoolingDown,
    /// Drought active but recent telemetry names no candidate gate.
    NoCandidate,
}

/// Step every offset toward zero, removing the negligible ones. Pure so the
/// direction-handling is trivially testable.
pub fn decay_offsets(offsets: &mut HashMap<String, f64>, step: f64) -> Vec<String> {
    let mut touched = Vec::new();
    let keys: Vec<String> = offsets.keys().cloned().collect();
    for key in keys {
        let Some(value) = offsets.get_mut(&key) else {
            continue;
        };
        if value.abs() <= step + OFFSET_EPSILON {
            offsets.remove(&key);
        } else {
            *value -= value.signum() * step;
        }
        touched.push(key);
    }
    touched
}

/// Pick the gate to relax from recent telemetry: the most frequent
/// nearest-miss gate, falling back to the most frequent outright failure.
/// Ties break lexicographically so the choice is stable run to run.
pub fn pick_relax_candidate(events: &[DecisionEvent]) -> Option<String> {
    let mut nearest: HashMap<&str, usize> = HashMap::new();
    let mut failures: HashMap<&str, usize> = HashMap::new();
    for event in events {
        if let Some(miss) = &event.nearest_miss {
            *nearest.entry(miss.gate.as_str()).or_insert(0) += 1;
        }
        for failure in &event.gate_failures {
            *failures.entry(failure.gate.as_str()).or_insert(0) += 1;
        }
    }

    let best = |tally: &HashMap<&str, usize>| {
        tally
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(gate, _)| gate.to_string())
    };
    best(&nearest).or_else(|| best(&failures))
}

/// Apply one relax step to a single gate, respecting its class: relaxing a
/// min-gate pushes the offset negative (lower bar), relaxing a max-gate
/// pushes it positive (higher ceiling). Returns the new offset.
pub fn relax_gate(state: &mut TuningState, gate: &str, step: f64, max_relax: f64) -> f64 {
    let direction = match gate_class(gate) {
        GateClass::Min => -1.0,
        GateClass::Max => 1.0,
    };
    let entry = state.offsets.entry(gate.to_string()).or_insert(0.0);
    *entry = (*entry + direction * step).clamp(-max_relax, max_relax);
    *entry
}

pub struct AdaptiveTuner {
    db: LedgerDb,
}

impl AdaptiveTuner {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    /// One tuner pass, called after the cycle's decision event is stored.
    /// At most one gate moves per invocation; everything else is decay.
    pub fn run(
        &self,
        cfg: &RuntimeConfig,
        drought: &DroughtSnapshot,
        now: i64,
    ) -> Result<TuneAction> {
        if !cfg.tuning_enabled {
            return Ok(TuneAction::Idle);
        }

        if !drought.active {
            if cfg.tuning.offsets.is_empty() {
                return Ok(TuneAction::Idle);
            }
            let mut gates = Vec::new();
            let updated = self.db.mutate_runtime_config(now, |c| {
                gates = decay_offsets(&mut c.tuning.offsets, c.tuning_step);
            })?;
            debug!(
                "Tuner decay: {} gate offset(s) remain",
                updated.tuning.offsets.len()
            );
            return Ok(TuneAction::Decayed { gates });
        }

        let cooldown_secs = cfg.tuning_cooldown_minutes * 60;
        if let Some(last) = cfg.tuning.last_adjusted_at {
            if now - last < cooldown_secs {
                return Ok(TuneAction::CoolingDown);
            }
        }

        let events = self.db.recent_decision_events(cfg.tuning_window_events)?;
        let Some(gate) = pick_relax_candidate(&events) else {
            return Ok(TuneAction::NoCandidate);
        };

        let mut new_offset = 0.0;
        self.db.mutate_runtime_config(now, |c| {
            new_offset = relax_gate(&mut c.tuning, &gate, c.tuning_step, c.tuning_max_relax);
            c.tuning.last_adjusted_at = Some(now);
        })?;

        self.db.log_event(
            "tuner_relax",
            json!({ "gate": gate, "offset": new_offset }),
            now,
        )?;
        info!("🔧 Tuner relaxed gate '{}' to offset {:.3}", gate, new_offset);
        Ok(TuneAction::Relaxed {
            gate,
            offset: new_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::gates::gate;
    use crate::models::{DecisionKind, GateFailure};

    fn event_with(nearest: Option<&str>, failures: &[&str]) -> DecisionEvent {
        let failure = |g: &str| GateFailure {
            gate: g.to_string(),
            actual: 1.0,
            threshold: 2.0,
            margin: -1.0,
        };
        DecisionEvent {
            schema_version: crate::models::DECISION_SCHEMA_VERSION,
            id: "e".to_string(),
            agent_id: "a".to_string(),
            generation_id: "g".to_string(),
            symbol: Some("BTC-USD".to_string()),
            decision: DecisionKind::Hold,
            confidence: 0.0,
            reasons: Vec::new(),
            exit_reason: None,
            gate_failures: failures.iter().map(|g| failure(g)).collect(),
            nearest_miss: nearest.map(failure),
            drought: DroughtSnapshot::default(),
            order_id: None,
            ext: serde_json::Value::Null,
            created_at: 0,
        }
    }

    #[test]
    fn test_decay_steps_toward_zero_and_removes_negligible() {
        let mut offsets = HashMap::new();
        offsets.insert("a".to_string(), -0.12);
        offsets.insert("b".to_string(), 0.04);

        decay_offsets(&mut offsets, 0.05);

        assert!((offsets["a"] - (-0.07)).abs() < 1e-9);
        assert!(!offsets.contains_key("b"));

        decay_offsets(&mut offsets, 0.05);
        assert!((offsets["a"] - (-0.02)).abs() < 1e-9);
        decay_offsets(&mut offsets, 0.05);
        assert!(offsets.is_empty());
    }

    #[test]
    fn test_candidate_prefers_nearest_miss_tally() {
        let events = vec![
            event_with(Some(gate::MOMENTUM_TREND), &[gate::MOMENTUM_VOLUME]),
            event_with(Some(gate::MOMENTUM_TREND), &[gate::MOMENTUM_VOLUME]),
            event_with(Some(gate::MOMENTUM_VOLUME), &[gate::MOMENTUM_VOLUME]),
        ];
        assert_eq!(
            pick_relax_candidate(&events).as_deref(),
            Some(gate::MOMENTUM_TREND)
        );
    }

    #[test]
    fn test_candidate_falls_back_to_failures() {
        let events = vec![
            event_with(None, &[gate::BREAKOUT_VOLUME, gate::BREAKOUT_CHANGE]),
            event_with(None, &[gate::BREAKOUT_VOLUME]),
        ];
        assert_eq!(
            pick_relax_candidate(&events).as_deref(),
            Some(gate::BREAKOUT_VOLUME)
        );
        assert_eq!(pick_relax_candidate(&[]), None);
    }

    #[test]
    fn test_relax_direction_follows_gate_class() {
        let mut state = TuningState::default();

        // Min gate: offset goes negative.
        let v = relax_gate(&mut state, gate::MOMENTUM_CHANGE, 0.05, 0.30);
        assert!((v - (-0.05)).abs() < 1e-12);

        // Max gate: offset goes positive.
        let v = relax_gate(&mut state, gate::REVERSION_VOLATILITY, 0.05, 0.30);
        assert!((v - 0.05).abs() < 1e-12);

        // Clamped at the max relax magnitude.
        for _ in 0..20 {
            relax_gate(&mut state, gate::MOMENTUM_CHANGE, 0.05, 0.30);
        }
        assert!((state.offsets[gate::MOMENTUM_CHANGE] - (-0.30)).abs() < 1e-12);
    }

    #[test]
    fn test_run_relaxes_exactly_one_gate() {
        let db = LedgerDb::open_in_memory().unwrap();
        let tuner = AdaptiveTuner::new(db.clone());
        let cfg = db.load_runtime_config().unwrap();

        // Seed telemetry: trend is the chronic nearest miss, volume fails too.
        for i in 0..10 {
            let mut e = event_with(Some(gate::MOMENTUM_TREND), &[gate::MOMENTUM_VOLUME]);
            e.id = format!("e{}", i);
            e.created_at = i;
            db.insert_decision_event(&e).unwrap();
        }

        let drought = DroughtSnapshot {
            detected: true,
            active: true,
            blocked: false,
            killed: false,
            reasons: Vec::new(),
        };
        let action = tuner.run(&cfg, &drought, 10_000).unwrap();
        match action {
            TuneAction::Relaxed {
                gate: ref relaxed,
                offset,
            } => {
                assert_eq!(relaxed, gate::MOMENTUM_TREND);
                assert!((offset - (-cfg.tuning_step)).abs() < 1e-12);
            }
            other => panic!("expected Relaxed, got {:?}", other),
        }

        // Only one gate got an offset.
        let stored = db.load_runtime_config().unwrap();
        assert_eq!(stored.tuning.offsets.len(), 1);
        assert_eq!(stored.tuning.last_adjusted_at, Some(10_000));

        // Immediately re-running hits the adjustment cooldown.
        let cfg = db.load_runtime_config().unwrap();
        let action = tuner.run(&cfg, &drought, 10_060).unwrap();
        assert_eq!(action, TuneAction::CoolingDown);
    }

    #[test]
    fn test_run_decays_when_drought_inactive() {
        let db = LedgerDb::open_in_memory().unwrap();
        let tuner = AdaptiveTuner::new(db.clone());

        db.mutate_runtime_config(0, |c| {
            c.tuning.offsets.insert(gate::MOMENTUM_TREND.to_string(), -0.15);
        })
        .unwrap();

        let cfg = db.load_runtime_config().unwrap();
        let drought = DroughtSnapshot::default();
        let action = tuner.run(&cfg, &drought, 1_000).unwrap();
        assert!(matches!(action, TuneAction::Decayed { .. }));

        let stored = db.load_runtime_config().unwrap();
        let remaining = stored.tuning.offsets[gate::MOMENTUM_TREND];
        assert!((remaining - (-0.10)).abs() < 1e-9);
    }
}
