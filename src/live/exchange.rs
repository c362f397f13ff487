//! Signed live-exchange client: authenticated balance reads and order
//! placement. Each request carries a short-lived ES256 token minted from the
//! decoded key material; nothing here ever logs authorization headers.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::live::safety::{LiveBalances, LiveCredentials};
use crate::models::OrderSide;

const ACCOUNTS_PATH: &str = "/api/v3/brokerage/accounts";
const ORDERS_PATH: &str = "/api/v3/brokerage/orders";

/// Tokens are valid for two minutes; clock skew beyond that means a retry.
const TOKEN_TTL_SECS: i64 = 120;

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    uri: String,
    nbf: i64,
    exp: i64,
    nonce: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_ref: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeClient {
    client: Client,
    base_url: String,
    host: String,
    credentials: LiveCredentials,
}

impl ExchangeClient {
    pub fn new(base_url: &str, credentials: LiveCredentials, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .context("build exchange http client")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let host = base_url
            .strip_prefix("https://")
            .or_else(|| base_url.strip_prefix("http://"))
            .unwrap_or(&base_url)
            .to_string();
        Ok(Self {
            client,
            base_url,
            host,
            credentials,
        })
    }

    /// Mint a one-request bearer token. The uri claim binds it to this
    /// method + host + path, the nonce makes every token unique.
    fn bearer_token(&self, method: &str, path: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let claims = TokenClaims {
            sub: self.credentials.key_id.clone(),
            uri: format!("{} {}{}", method, self.host, path),
            nbf: now,
            exp: now + TOKEN_TTL_SECS,
            nonce: hex::encode(nonce),
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.credentials.key_id.clone());

        let key = EncodingKey::from_ec_der(self.credentials.key.pkcs8_der());
        encode(&header, &claims, &key).context("sign exchange request token")
    }

    /// Available balances across all venue accounts, mapped to cash (USD and
    /// USD stables) plus per-currency asset quantities.
    pub async fn get_balances(&self) -> Result<LiveBalances> {
        let token = self.bearer_token("GET", ACCOUNTS_PATH)?;
        let url = format!("{}{}", self.base_url, ACCOUNTS_PATH);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("balance read failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("balance read returned {}", status);
        }

        let parsed: AccountsResponse = resp.json().await.context("parse balance response")?;
        debug!("Balance read ok ({} accounts)", parsed.accounts.len());
        Ok(parsed.into_balances())
    }

    /// Place a market IOC order. `request_id` doubles as the venue-side
    /// client order id, so a replayed request cannot double-execute.
    pub async fn place_market_order(
        &self,
        request_id: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<OrderAck> {
        let token = self.bearer_token("POST", ORDERS_PATH)?;
        let url = format!("{}{}", self.base_url, ORDERS_PATH);
        let body = order_body(request_id, symbol, side, quantity);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("order placement failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("order placement returned {}: {}", status, text);
        }

        let parsed: PlaceOrderResponse = resp.json().await.context("parse order response")?;
        if !parsed.success {
            let detail = parsed
                .error_response
                .map(|e| if e.message.is_empty() { e.error } else { e.message })
                .unwrap_or_default();
            return Err(anyhow!("venue rejected order: {}", detail));
        }

        let order_ref = parsed
            .success_response
            .and_then(|s| s.order_id)
            .unwrap_or_else(|| request_id.to_string());
        debug!("Order accepted: {} {} {:.8}", symbol, side.as_str(), quantity);
        Ok(OrderAck { order_ref })
    }
}

fn order_body(request_id: &str, symbol: &str, side: OrderSide, quantity: f64) -> serde_json::Value {
    json!({
        "client_order_id": request_id,
        "product_id": symbol,
        "side": match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        },
        "order_configuration": {
            "market_market_ioc": {
                "base_size": format!("{:.8}", quantity),
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<ExchangeAccount>,
}

#[derive(Debug, Deserialize)]
struct ExchangeAccount {
    currency: String,
    available_balance: ExchangeMoney,
}

#[derive(Debug, Deserialize)]
struct ExchangeMoney {
    value: String,
}

impl AccountsResponse {
    fn into_balances(self) -> LiveBalances {
        let mut balances = LiveBalances::default();
        for account in self.accounts {
            let Ok(value) = account.available_balance.value.parse::<f64>() else {
                continue;
            };
            if account.currency == "USD" || account.currency == "USDC" {
                balances.cash += value;
            } else {
                *balances.assets.entry(account.currency).or_insert(0.0) += value;
            }
        }
        balances
    }
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    success_response: Option<OrderSuccess>,
    #[serde(default)]
    error_response: Option<OrderError>,
}

#[derive(Debug, Deserialize)]
struct OrderSuccess {
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error: String,
}
