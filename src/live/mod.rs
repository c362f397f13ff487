//! Real-capital path: tolerant key decoding, the ordered safety gate chain,
//! and the signed exchange client. Nothing in this module places an order
//! without walking the full chain first.

pub mod exchange;
pub mod keys;
pub mod safety;

pub use exchange::ExchangeClient;
pub use keys::EcKeyMaterial;
pub use safety::{GateOutcome, LiveBalances, LiveCredentials, LiveOrderRequest, LiveSafetyChain};

use anyhow::{anyhow, Result};
use chrono::Utc;

use crate::config::AppConfig;
use crate::execution::{ExecutionAdapter, ExecutionFill, ExecutionRequest};
use crate::ledger::LedgerDb;

/// Live execution: safety chain, then the venue, under the spent session's
/// request id. Any failure anywhere returns an error, which callers treat as
/// a rejected order.
pub struct LiveExecutionAdapter {
    db: LedgerDb,
    chain: LiveSafetyChain,
    app: AppConfig,
}

impl LiveExecutionAdapter {
    pub fn new(db: LedgerDb, app: AppConfig) -> Self {
        Self {
            chain: LiveSafetyChain::new(db.clone()),
            db,
            app,
        }
    }
}

#[async_trait::async_trait]
impl ExecutionAdapter for LiveExecutionAdapter {
    async fn submit_order(&self, req: ExecutionRequest) -> Result<ExecutionFill> {
        let now = Utc::now().timestamp();
        let cfg = self.db.load_runtime_config()?;
        let credentials = LiveCredentials::from_env()?;

        // Balances are read fresh per request. When live trading is off or
        // credentials are absent, the chain blocks before inspecting them, so
        // the venue is never contacted.
        let (client, balances) = match &credentials {
            Some(creds) if cfg.live_trading_enabled => {
                let client = ExchangeClient::new(
                    &self.app.exchange_base_url,
                    creds.clone(),
                    self.app.exchange_timeout_secs,
                )?;
                let balances = client.get_balances().await?;
                (Some(client), balances)
            }
            _ => (None, LiveBalances::default()),
        };

        let live_req = LiveOrderRequest {
            agent_id: req.agent_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            quantity: req.quantity,
            mark_price: req.mark_price,
        };
        let request_id = match self
            .chain
            .clear(&live_req, &cfg, credentials.as_ref(), &balances, now)?
        {
            GateOutcome::Cleared { request_id, .. } => request_id,
            GateOutcome::Blocked { gate, reason } => {
                return Err(anyhow!("live order blocked at {gate}: {reason}"));
            }
        };

        let client = client.ok_or_else(|| anyhow!("exchange client unavailable"))?;
        let started = std::time::Instant::now();
        let ack = client
            .place_market_order(&request_id, &req.symbol, req.side, req.quantity)
            .await?;

        // TODO: reconcile actual fill price and fee from the venue's order
        // endpoint; until then the fill is recorded at mark.
        Ok(ExecutionFill {
            order_ref: ack.order_ref,
            fill_price: req.mark_price,
            filled_quantity: req.quantity,
            fee: 0.0,
            slippage_pct: 0.0,
            latency_ms: started.elapsed().as_millis() as u64,
            filled_at: Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::OrderSide;

    #[tokio::test]
    async fn test_submit_fails_closed_when_live_disabled() {
        let db = LedgerDb::open_in_memory().unwrap();
        let app = AppConfig {
            database_path: ":memory:".to_string(),
            account_id: "primary".to_string(),
            symbols: vec!["BTC-USD".to_string()],
            decision_interval_secs: 300,
            starting_capital: 10_000.0,
            exchange_base_url: "https://api.exchange.test".to_string(),
            exchange_timeout_secs: 5,
        };
        let adapter = LiveExecutionAdapter::new(db.clone(), app);

        let req = ExecutionRequest {
            request_id: "req-1".to_string(),
            agent_id: "agent-1".to_string(),
            generation_id: "gen-1".to_string(),
            symbol: "BTC-USD".to_string(),
            side: OrderSide::Buy,
            quantity: 0.0001,
            mark_price: 50_000.0,
            tags: Vec::new(),
        };
        let err = adapter.submit_order(req).await.unwrap_err();
        assert!(err.to_string().contains("LIVE_DISABLED"));

        // The block is explained in the event log before the error returns.
        let events = db.recent_events(5).unwrap();
        assert_eq!(events[0].action, "live_gate_blocked");
    }
}
