use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::ledger::LedgerDb;
use crate::market::MarketSnapshot;
use crate::models::{reasons, DroughtOverride, DroughtSnapshot, RuntimeConfig};

/// Hold/order tallies over the two detection windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DroughtWindows {
    pub short_holds: i64,
    pub short_orders: i64,
    pub long_holds: i64,
    pub long_orders: i64,
}

/// Inputs for the kill switch. `peak_equity` is the persisted monotone
/// watermark, already folded with the current equity by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillInputs {
    pub equity: f64,
    pub peak_equity: f64,
    pub max_volatility_ratio: f64,
}

/// Drawdown measured against the running peak, never against starting
/// capital. A zero or negative peak means no history yet, which is zero
/// drawdown by definition.
pub fn drawdown_from_peak(equity: f64, peak: f64) -> f64 {
    if peak <= 0.0 {
        return 0.0;
    }
    ((peak - equity) / peak).clamp(0.0, 1.0)
}

/// Pure drought assessment. `detected` is the raw statistical signal;
/// `active` means relaxed thresholds apply this cycle; `blocked` means
/// relaxation was wanted but suppressed; `killed` is the hard stop.
pub fn assess(
    cfg: &RuntimeConfig,
    windows: &DroughtWindows,
    kill: &KillInputs,
    now: i64,
) -> DroughtSnapshot {
    let mut out_reasons: Vec<String> = Vec::new();

    let short = windows.short_holds >= cfg.drought_short_min_holds
        && windows.short_orders <= cfg.drought_short_max_orders;
    let long = windows.long_holds >= cfg.drought_long_min_holds
        && windows.long_orders <= cfg.drought_long_max_orders;
    if short {
        out_reasons.push(reasons::SHORT_DROUGHT.to_string());
    }
    if long {
        out_reasons.push(reasons::LONG_DROUGHT.to_string());
    }
    let detected = short || long;

    let mut killed = false;
    let drawdown = drawdown_from_peak(kill.equity, kill.peak_equity);
    if drawdown >= cfg.drought_kill_drawdown_pct {
        killed = true;
        out_reasons.push(reasons::KILL_DRAWDOWN.to_string());
    }
    if kill.max_volatility_ratio >= cfg.drought_kill_volatility_ratio {
        killed = true;
        out_reasons.push(reasons::KILL_VOLATILITY.to_string());
    }

    let forced_on = cfg.drought_override == DroughtOverride::ForceOn;
    let forced_off = cfg.drought_override == DroughtOverride::ForceOff;
    let in_cooldown = cfg.drought_cooldown_until.map_or(false, |until| now < until);

    let wants_relax = forced_on || (detected && !forced_off);
    let mut blocked = false;
    if detected || forced_on {
        if forced_off {
            blocked = true;
            out_reasons.push(reasons::OVERRIDE_OFF.to_string());
        }
        if in_cooldown {
            blocked = true;
            out_reasons.push(reasons::COOLDOWN.to_string());
        }
        if killed {
            blocked = true;
        }
    }
    let active = wants_relax && !forced_off && !in_cooldown && !killed;

    DroughtSnapshot {
        detected,
        active,
        blocked,
        killed,
        reasons: out_reasons,
    }
}

impl DroughtSnapshot {
    /// Orchestrator-side suppression (hourly cap, insufficient cash). Keeps
    /// the detection facts but withdraws the relaxation for this cycle.
    pub fn suppress(&mut self, reason: &str) {
        self.active = false;
        self.blocked = true;
        if !self.reasons.iter().any(|r| r == reason) {
            self.reasons.push(reason.to_string());
        }
    }
}

/// Stateful wrapper: pulls window tallies from the ledger, maintains the
/// peak-equity watermark, and on a kill writes the cooldown expiry into the
/// persistent config so it outlives this process.
pub struct DroughtResolver {
    db: LedgerDb,
}

impl DroughtResolver {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    pub fn resolve(
        &self,
        cfg: &mut RuntimeConfig,
        snapshots: &[MarketSnapshot],
        equity: f64,
        now: i64,
    ) -> Result<DroughtSnapshot> {
        let (short_holds, short_orders) =
            self.db.decision_counts_last_n(cfg.drought_short_window_cycles)?;
        let long_since = now - cfg.drought_long_window_hours * 3600;
        let (long_holds, long_orders) = self.db.decision_counts_since(long_since)?;
        let windows = DroughtWindows {
            short_holds,
            short_orders,
            long_holds,
            long_orders,
        };

        // Watermark first: the kill must see the peak including today's high.
        if equity > cfg.peak_equity {
            let updated = self
                .db
                .mutate_runtime_config(now, |c| {
                    if equity > c.peak_equity {
                        c.peak_equity = equity;
                    }
                })?;
            cfg.peak_equity = updated.peak_equity;
            cfg.version = updated.version;
        }

        let max_volatility_ratio = snapshots
            .iter()
            .map(|s| s.volatility_ratio)
            .fold(0.0_f64, f64::max);
        let kill = KillInputs {
            equity,
            peak_equity: cfg.peak_equity,
            max_volatility_ratio,
        };

        let snapshot = assess(cfg, &windows, &kill, now);

        if snapshot.killed && cfg.drought_cooldown_until.map_or(true, |until| until <= now) {
            let cooldown_until = now + cfg.drought_cooldown_hours * 3600;
            let drawdown = drawdown_from_peak(equity, cfg.peak_equity);
            let updated = self.db.mutate_runtime_config(now, |c| {
                c.drought_cooldown_until = Some(cooldown_until);
            })?;
            cfg.drought_cooldown_until = updated.drought_cooldown_until;
            cfg.version = updated.version;
            self.db.log_event(
                "drought_kill",
                json!({
                    "drawdown": drawdown,
                    "peak_equity": cfg.peak_equity,
                    "equity": equity,
                    "max_volatility_ratio": max_volatility_ratio,
                    "cooldown_until": cooldown_until,
                    "reasons": snapshot.reasons,
                }),
                now,
            )?;
            warn!(
                "🛑 Drought kill-switch fired: drawdown {:.2}%, max vol ratio {:.2}, cooldown until {}",
                drawdown * 100.0,
                max_volatility_ratio,
                cooldown_until
            );
        } else if snapshot.detected {
            debug!(
                "Drought detected (active={}, blocked={}): {:?}",
                snapshot.active, snapshot.blocked, snapshot.reasons
            );
        }

        Ok(snapshot)
    }
}
