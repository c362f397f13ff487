//! Live Safety Gate Chain.
//!
//! Every request to spend real capital walks the same strictly ordered
//! checks. Gates 1-7 are pure reads evaluated fresh per request; the arm
//! session spend is the only stateful step and always runs last, so a request
//! that loses any earlier gate never consumes the canary. Every block is
//! written to the event log before the caller sees it.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::LedgerDb;
use crate::live::keys::EcKeyMaterial;
use crate::models::{reasons, OrderSide, RuntimeConfig};

pub const GATE_LIVE_ENABLED: &str = "live_enabled";
pub const GATE_CREDENTIALS: &str = "credentials_present";
pub const GATE_ARM_SESSION: &str = "arm_session_valid";
pub const GATE_PER_TRADE_CAP: &str = "per_trade_cap";
pub const GATE_DAILY_CAP: &str = "daily_cap";
pub const GATE_CASH: &str = "cash_sufficient";
pub const GATE_ASSET: &str = "asset_sufficient";
pub const GATE_SPEND: &str = "spend_arm_session";

/// Exchange API credential pair, read fresh from the environment per request.
#[derive(Debug, Clone)]
pub struct LiveCredentials {
    pub key_id: String,
    pub key: EcKeyMaterial,
}

impl LiveCredentials {
    pub const KEY_ID_ENV: &'static str = "EXCHANGE_API_KEY_ID";
    pub const SECRET_ENV: &'static str = "EXCHANGE_API_SECRET";

    /// Unset or blank variables mean "not configured" (`Ok(None)`); material
    /// that is present but undecodable is an operator error worth surfacing.
    pub fn from_env() -> Result<Option<Self>> {
        let (Ok(key_id), Ok(secret)) = (env::var(Self::KEY_ID_ENV), env::var(Self::SECRET_ENV))
        else {
            return Ok(None);
        };
        if key_id.trim().is_empty() || secret.trim().is_empty() {
            return Ok(None);
        }
        let key = EcKeyMaterial::decode(&secret).context("decode exchange private key")?;
        Ok(Some(Self {
            key_id: key_id.trim().to_string(),
            key,
        }))
    }
}

/// Exchange-held balances, fetched fresh for each request by the live
/// adapter before the chain runs. Assets are keyed by base currency.
#[derive(Debug, Clone, Default)]
pub struct LiveBalances {
    pub cash: f64,
    pub assets: HashMap<String, f64>,
}

impl LiveBalances {
    /// Held quantity of a symbol's base currency ("BTC-USD" reads "BTC").
    pub fn asset(&self, symbol: &str) -> f64 {
        let base = symbol.split('-').next().unwrap_or(symbol);
        self.assets.get(base).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct LiveOrderRequest {
    pub agent_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub mark_price: f64,
}

impl LiveOrderRequest {
    pub fn notional(&self) -> f64 {
        self.quantity * self.mark_price
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// All gates passed and the arm session was spent; the order may be
    /// placed under `request_id`.
    Cleared {
        session_id: String,
        request_id: String,
        orders_remaining: i64,
    },
    Blocked {
        gate: &'static str,
        reason: String,
    },
}

impl GateOutcome {
    pub fn is_cleared(&self) -> bool {
        matches!(self, GateOutcome::Cleared { .. })
    }
}

#[derive(Clone)]
pub struct LiveSafetyChain {
    db: LedgerDb,
}

impl LiveSafetyChain {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    /// Walk the chain in order and stop at the first failure. Credentials and
    /// balances are resolved by the caller immediately before this call so
    /// nothing is cached across requests.
    pub fn clear(
        &self,
        req: &LiveOrderRequest,
        cfg: &RuntimeConfig,
        credentials: Option<&LiveCredentials>,
        balances: &LiveBalances,
        now: i64,
    ) -> Result<GateOutcome> {
        // 1. Master switch.
        if !cfg.live_trading_enabled {
            return self.block(req, GATE_LIVE_ENABLED, reasons::LIVE_DISABLED, now);
        }

        // 2. Signing material must exist before anything else matters.
        if credentials.is_none() {
            return self.block(req, GATE_CREDENTIALS, reasons::NO_CREDENTIALS, now);
        }

        // 3. A live, unspent canary.
        let session = match self.db.latest_arm_session()? {
            None => return self.block(req, GATE_ARM_SESSION, reasons::NOT_ARMED, now),
            Some(s) if s.is_spent() => {
                return self.block(req, GATE_ARM_SESSION, reasons::NOT_ARMED, now)
            }
            Some(s) if s.is_expired(now) => {
                return self.block(req, GATE_ARM_SESSION, reasons::CANARY_EXPIRED, now)
            }
            Some(s) => s,
        };

        // 4. Per-trade notional cap.
        let notional = req.notional();
        if notional > cfg.canary_max_notional_per_trade {
            return self.block(req, GATE_PER_TRADE_CAP, reasons::TRADE_CAP_EXCEEDED, now);
        }

        // 5. Daily notional cap over the UTC day.
        let day_start = now - now.rem_euclid(86_400);
        let spent_today = self.db.live_notional_since(day_start)?;
        if spent_today + notional > cfg.canary_max_notional_per_day {
            return self.block(req, GATE_DAILY_CAP, reasons::DAILY_CAP_EXCEEDED, now);
        }

        // 6/7. Funds on the venue side, per direction.
        match req.side {
            OrderSide::Buy => {
                if balances.cash < notional {
                    return self.block(req, GATE_CASH, reasons::INSUFFICIENT_CASH, now);
                }
            }
            OrderSide::Sell => {
                if balances.asset(&req.symbol) < req.quantity {
                    return self.block(req, GATE_ASSET, reasons::INSUFFICIENT_ASSET, now);
                }
            }
        }

        // 8. Spend the canary. Minute-bucketed request id, so a retried
        // invocation inside the same bucket presents the same id.
        let request_id = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!(
                "evobot:live:{}:{}:{}:{}:{}",
                session.id,
                req.agent_id,
                req.symbol,
                req.side.as_str(),
                now / 60
            )
            .as_bytes(),
        )
        .to_string();
        let spend = self.db.spend_arm_session(&session.id, &request_id, now)?;
        if !spend.success {
            let reason = spend
                .reason
                .unwrap_or_else(|| reasons::CANARY_ALREADY_CONSUMED.to_string());
            return self.block_with(req, GATE_SPEND, reason, now);
        }

        self.db.log_event(
            "live_gate_cleared",
            json!({
                "session_id": session.id,
                "request_id": request_id,
                "symbol": req.symbol,
                "side": req.side.as_str(),
                "quantity": req.quantity,
                "notional": notional,
                "orders_remaining": spend.orders_remaining,
            }),
            now,
        )?;
        info!(
            "🔓 Live order cleared: {} {} {:.8} (${:.2} notional, session {})",
            req.side.as_str(),
            req.symbol,
            req.quantity,
            notional,
            session.id
        );

        Ok(GateOutcome::Cleared {
            session_id: session.id,
            request_id,
            orders_remaining: spend.orders_remaining,
        })
    }

    fn block(
        &self,
        req: &LiveOrderRequest,
        gate: &'static str,
        reason: &str,
        now: i64,
    ) -> Result<GateOutcome> {
        self.block_with(req, gate, reason.to_string(), now)
    }

    fn block_with(
        &self,
        req: &LiveOrderRequest,
        gate: &'static str,
        reason: String,
        now: i64,
    ) -> Result<GateOutcome> {
        warn!(
            "🛑 Live order blocked at {}: {} ({} {} {:.8})",
            gate,
            reason,
            req.side.as_str(),
            req.symbol,
            req.quantity
        );
        self.db.log_event(
            "live_gate_blocked",
            json!({
                "gate": gate,
                "reason": reason,
                "agent_id": req.agent_id,
                "symbol": req.symbol,
                "side": req.side.as_str(),
                "quantity": req.quantity,
                "notional": req.notional(),
            }),
            now,
        )?;
        Ok(GateOutcome::Blocked { gate, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::live::keys;
    use crate::models::{FillRecord, OrderRecord, OrderStatus, TradeMode};

    fn chain() -> (LedgerDb, LiveSafetyChain) {
        let db = LedgerDb::open_in_memory().unwrap();
        (db.clone(), LiveSafetyChain::new(db))
    }

    fn live_cfg() -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.live_trading_enabled = true;
        cfg
    }

    fn creds() -> LiveCredentials {
        LiveCredentials {
            key_id: "test-key".to_string(),
            key: keys::test_key_material(),
        }
    }

    /// $5 notional buy, under the $10 default per-trade cap.
    fn small_buy() -> LiveOrderRequest {
        LiveOrderRequest {
            agent_id: "agent-1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.0001,
            mark_price: 50_000.0,
        }
    }

    fn funded() -> LiveBalances {
        LiveBalances {
            cash: 100.0,
            assets: HashMap::new(),
        }
    }

    fn expect_block(outcome: GateOutcome, gate: &str, reason: &str) {
        match outcome {
            GateOutcome::Blocked {
                gate: g,
                reason: r,
            } => {
                assert_eq!(g, gate);
                assert_eq!(r, reason);
            }
            other => panic!("expected block at {}, got {:?}", gate, other),
        }
    }

    #[test]
    fn test_blocked_when_live_disabled() {
        let (db, chain) = chain();
        let cfg = RuntimeConfig::default();

        let outcome = chain
            .clear(&small_buy(), &cfg, Some(&creds()), &funded(), 1_000)
            .unwrap();
        expect_block(outcome, GATE_LIVE_ENABLED, reasons::LIVE_DISABLED);

        // The block is explained in the event log.
        let events = db.recent_events(5).unwrap();
        assert_eq!(events[0].action, "live_gate_blocked");
        assert_eq!(events[0].metadata["reason"], reasons::LIVE_DISABLED);
    }

    #[test]
    fn test_blocked_without_credentials() {
        let (_db, chain) = chain();
        let outcome = chain
            .clear(&small_buy(), &live_cfg(), None, &funded(), 1_000)
            .unwrap();
        expect_block(outcome, GATE_CREDENTIALS, reasons::NO_CREDENTIALS);
    }

    #[test]
    fn test_blocked_when_never_armed() {
        let (_db, chain) = chain();
        let outcome = chain
            .clear(&small_buy(), &live_cfg(), Some(&creds()), &funded(), 1_000)
            .unwrap();
        expect_block(outcome, GATE_ARM_SESSION, reasons::NOT_ARMED);
    }

    #[test]
    fn test_blocked_when_session_expired() {
        let (db, chain) = chain();
        db.create_arm_session(1, 1, 1_000).unwrap(); // expires at 1_060

        let outcome = chain
            .clear(&small_buy(), &live_cfg(), Some(&creds()), &funded(), 1_061)
            .unwrap();
        expect_block(outcome, GATE_ARM_SESSION, reasons::CANARY_EXPIRED);
    }

    #[test]
    fn test_blocked_over_per_trade_cap() {
        let (db, chain) = chain();
        db.create_arm_session(10, 1, 1_000).unwrap();

        let mut big = small_buy();
        big.quantity = 0.0004; // $20 > $10 cap
        let outcome = chain
            .clear(&big, &live_cfg(), Some(&creds()), &funded(), 1_000)
            .unwrap();
        expect_block(outcome, GATE_PER_TRADE_CAP, reasons::TRADE_CAP_EXCEEDED);
    }

    #[test]
    fn test_blocked_over_daily_cap() {
        let (db, chain) = chain();
        let now = 1_700_000_000;
        db.ensure_account("primary", 1_000.0, now).unwrap();
        db.create_arm_session(10, 1, now).unwrap();

        // $20 of live fills already today against the $25 daily cap.
        let order = OrderRecord {
            id: "live-1".to_string(),
            account_id: "primary".to_string(),
            agent_id: "agent-1".to_string(),
            generation_id: "gen-1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.0004,
            mode: TradeMode::Live,
            tags: Vec::new(),
            is_learnable: true,
            status: OrderStatus::Filled,
            reject_reason: None,
            created_at: now,
        };
        let fill = FillRecord {
            id: "live-1-fill".to_string(),
            order_id: "live-1".to_string(),
            agent_id: "agent-1".to_string(),
            generation_id: "gen-1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.0004,
            price: 50_000.0,
            fee: 0.1,
            slippage_pct: 0.0,
            is_learnable: true,
            filled_at: now,
        };
        db.record_execution(&order, Some(&fill)).unwrap();

        // Another $8 would put the day at $28.
        let mut next = small_buy();
        next.quantity = 0.00016;
        let outcome = chain
            .clear(&next, &live_cfg(), Some(&creds()), &funded(), now + 60)
            .unwrap();
        expect_block(outcome, GATE_DAILY_CAP, reasons::DAILY_CAP_EXCEEDED);
    }

    #[test]
    fn test_blocked_insufficient_cash() {
        let (db, chain) = chain();
        db.create_arm_session(10, 1, 1_000).unwrap();

        let broke = LiveBalances {
            cash: 1.0,
            assets: HashMap::new(),
        };
        let outcome = chain
            .clear(&small_buy(), &live_cfg(), Some(&creds()), &broke, 1_000)
            .unwrap();
        expect_block(outcome, GATE_CASH, reasons::INSUFFICIENT_CASH);
    }

    #[test]
    fn test_blocked_insufficient_asset_on_sell() {
        let (db, chain) = chain();
        db.create_arm_session(10, 1, 1_000).unwrap();

        let mut sell = small_buy();
        sell.side = OrderSide::Sell;
        let outcome = chain
            .clear(&sell, &live_cfg(), Some(&creds()), &funded(), 1_000)
            .unwrap();
        expect_block(outcome, GATE_ASSET, reasons::INSUFFICIENT_ASSET);
    }

    #[test]
    fn test_clear_spends_the_session_exactly_once() {
        let (db, chain) = chain();
        let session = db.create_arm_session(10, 1, 1_000).unwrap();

        let first = chain
            .clear(&small_buy(), &live_cfg(), Some(&creds()), &funded(), 1_010)
            .unwrap();
        let GateOutcome::Cleared {
            session_id,
            orders_remaining,
            ..
        } = first
        else {
            panic!("expected cleared, got {:?}", first);
        };
        assert_eq!(session_id, session.id);
        assert_eq!(orders_remaining, 0);
        assert!(db.get_arm_session(&session.id).unwrap().unwrap().is_spent());

        // The consumed canary no longer arms anything.
        let second = chain
            .clear(&small_buy(), &live_cfg(), Some(&creds()), &funded(), 1_020)
            .unwrap();
        expect_block(second, GATE_ARM_SESSION, reasons::NOT_ARMED);
    }

    #[test]
    fn test_concurrent_clear_has_single_winner() {
        let (db, chain) = chain();
        db.create_arm_session(10, 1, 1_000).unwrap();
        let cfg = live_cfg();

        let mut handles = Vec::new();
        for agent in ["agent-a", "agent-b"] {
            let chain = chain.clone();
            let cfg = cfg.clone();
            let mut req = small_buy();
            req.agent_id = agent.to_string();
            handles.push(std::thread::spawn(move || {
                chain
                    .clear(&req, &cfg, Some(&creds()), &funded(), 1_010)
                    .unwrap()
            }));
        }

        let outcomes: Vec<GateOutcome> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let cleared = outcomes.iter().filter(|o| o.is_cleared()).count();
        assert_eq!(cleared, 1, "exactly one caller may win: {:?}", outcomes);

        // Losing thread fails at the spend CAS or, if it read late, at the
        // arm gate; either way the canary is burned for it.
        let loser = outcomes.iter().find(|o| !o.is_cleared()).unwrap();
        match loser {
            GateOutcome::Blocked { reason, .. } => {
                assert!(
                    reason == reasons::CANARY_ALREADY_CONSUMED || reason == reasons::NOT_ARMED,
                    "unexpected loser reason {}",
                    reason
                );
            }
            _ => unreachable!(),
        }
        let _ = db;
    }
}
