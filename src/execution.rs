use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::models::OrderSide;

/// An order handed to an execution collaborator. `request_id` is the
/// idempotency key: the same request replayed must not double-execute, and
/// the paper simulator keys its randomness off it so replays reproduce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub agent_id: String,
    pub generation_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    /// Mark price at decision time; the adapter slips from here.
    pub mark_price: f64,
    pub tags: Vec<String>,
}

/// Realized execution. Quantity may be below the requested amount when the
/// venue partially fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFill {
    pub order_ref: String,
    pub fill_price: f64,
    pub filled_quantity: f64,
    pub fee: f64,
    pub slippage_pct: f64,
    pub latency_ms: u64,
    pub filled_at: i64,
}

#[async_trait::async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn submit_order(&self, req: ExecutionRequest) -> Result<ExecutionFill>;
}

/// Paper execution tuning for realistic simulation.
#[derive(Debug, Clone)]
pub struct PaperExecutionConfig {
    /// Base latency in ms (plus random jitter per order)
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Market impact in bps per $1000 notional
    pub slippage_bps_per_1k: f64,
    /// Spread-crossing cost in bps
    pub base_slippage_bps: f64,
    pub fee_rate: f64,
    pub partial_fill_prob: f64,
    pub min_fill_ratio: f64,
    pub reject_prob: f64,
}

impl Default for PaperExecutionConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 40,
            latency_jitter_ms: 60,
            slippage_bps_per_1k: 2.0,
            base_slippage_bps: 5.0,
            fee_rate: 0.005,
            partial_fill_prob: 0.10,
            min_fill_ratio: 0.5,
            reject_prob: 0.01,
        }
    }
}

impl PaperExecutionConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PAPER_BASE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.base_latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_LATENCY_JITTER_MS") {
            if let Ok(ms) = v.parse() {
                config.latency_jitter_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_SLIPPAGE_BPS_PER_1K") {
            if let Ok(bps) = v.parse() {
                config.slippage_bps_per_1k = bps;
            }
        }
        if let Ok(v) = std::env::var("PAPER_BASE_SLIPPAGE_BPS") {
            if let Ok(bps) = v.parse() {
                config.base_slippage_bps = bps;
            }
        }
        if let Ok(v) = std::env::var("PAPER_FEE_RATE") {
            if let Ok(rate) = v.parse() {
                config.fee_rate = rate;
            }
        }
        if let Ok(v) = std::env::var("PAPER_PARTIAL_FILL_PROB") {
            if let Ok(prob) = v.parse() {
                config.partial_fill_prob = prob;
            }
        }
        if let Ok(v) = std::env::var("PAPER_REJECT_PROB") {
            if let Ok(prob) = v.parse() {
                config.reject_prob = prob;
            }
        }

        config
    }
}

/// Simulated venue. All randomness is drawn from a rng seeded by the request
/// id, so the same request always produces the same fill.
#[derive(Debug, Clone)]
pub struct PaperExecutionAdapter {
    pub config: PaperExecutionConfig,
}

impl Default for PaperExecutionAdapter {
    fn default() -> Self {
        Self {
            config: PaperExecutionConfig::from_env(),
        }
    }
}

impl PaperExecutionAdapter {
    pub fn new(config: PaperExecutionConfig) -> Self {
        Self { config }
    }

    fn rng_for(request_id: &str) -> ChaCha8Rng {
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_URL, request_id.as_bytes());
        ChaCha8Rng::seed_from_u64(digest.as_u128() as u64)
    }
}

#[async_trait::async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn submit_order(&self, req: ExecutionRequest) -> Result<ExecutionFill> {
        let mut rng = Self::rng_for(&req.request_id);

        if !(req.mark_price.is_finite() && req.mark_price > 0.0) {
            return Err(anyhow!("invalid mark price: {}", req.mark_price));
        }
        if !(req.quantity.is_finite() && req.quantity > 0.0) {
            return Err(anyhow!("invalid quantity: {}", req.quantity));
        }

        // Simulate network + matching latency
        let jitter: u64 = rng.gen_range(0..=self.config.latency_jitter_ms);
        let latency_ms = self.config.base_latency_ms + jitter;
        sleep(Duration::from_millis(latency_ms)).await;

        if rng.gen::<f64>() < self.config.reject_prob {
            return Err(anyhow!("order rejected (simulated)"));
        }

        // Slippage: spread crossing plus size-driven market impact, always
        // adverse to the trader.
        let notional = req.quantity * req.mark_price;
        let total_slippage_bps =
            self.config.base_slippage_bps + self.config.slippage_bps_per_1k * (notional / 1000.0);
        let slip = total_slippage_bps / 10_000.0;
        let fill_price = match req.side {
            OrderSide::Buy => req.mark_price * (1.0 + slip),
            OrderSide::Sell => req.mark_price * (1.0 - slip),
        };

        let fill_ratio = if rng.gen::<f64>() < self.config.partial_fill_prob {
            rng.gen_range(self.config.min_fill_ratio..1.0)
        } else {
            1.0
        };
        let filled_quantity = req.quantity * fill_ratio;
        let fee = filled_quantity * fill_price * self.config.fee_rate;

        Ok(ExecutionFill {
            order_ref: format!("paper:{}", req.request_id),
            fill_price,
            filled_quantity,
            fee,
            slippage_pct: total_slippage_bps / 100.0,
            latency_ms,
            filled_at: Utc::now().timestamp(),
        })
    }
}
