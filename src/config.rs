//! Process-level configuration from the environment. Runtime policy (caps,
//! overrides, tuning offsets) lives in the ledger's config document, not
//! here; this covers only what an invocation needs before the ledger opens.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub account_id: String,
    pub symbols: Vec<String>,
    pub decision_interval_secs: u64,
    pub starting_capital: f64,
    pub exchange_base_url: String,
    pub exchange_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("EVOBOT_DB_PATH").unwrap_or_else(|_| "./evobot.db".to_string());

        let account_id =
            std::env::var("EVOBOT_ACCOUNT_ID").unwrap_or_else(|_| "primary".to_string());

        let symbols = parse_symbols(
            &std::env::var("EVOBOT_SYMBOLS")
                .unwrap_or_else(|_| "BTC-USD,ETH-USD,SOL-USD,DOGE-USD,AVAX-USD,LINK-USD".to_string()),
        );

        let decision_interval_secs = std::env::var("EVOBOT_DECISION_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 10)
            .unwrap_or(300);

        let starting_capital = std::env::var("EVOBOT_STARTING_CAPITAL")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(10_000.0);

        let exchange_base_url = std::env::var("EVOBOT_EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.coinbase.com".to_string());

        let exchange_timeout_secs = std::env::var("EVOBOT_EXCHANGE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1 && *v <= 60)
            .unwrap_or(10);

        Ok(Self {
            database_path,
            account_id,
            symbols,
            decision_interval_secs,
            starting_capital,
            exchange_base_url,
            exchange_timeout_secs,
        })
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
