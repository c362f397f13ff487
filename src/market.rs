use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ledger::LedgerDb;

/// One symbol's market state as supplied by the out-of-process ingester.
/// `regime` is a free-form tag carried through to telemetry; decisions key on
/// the numeric fields only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub trend_slope: f64,
    pub volatility_ratio: f64,
    pub regime: String,
    pub updated_at: i64,
}

impl MarketSnapshot {
    /// Staleness is the caller's responsibility: a snapshot older than the
    /// freshness bound must not drive a decision.
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.updated_at > max_age_secs
    }
}

/// Read seam over the market-data tables. Ingestion itself lives outside this
/// system; we only ever read what the ingester last wrote.
pub trait SnapshotProvider: Send + Sync {
    fn get_snapshots(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>>;
}

/// Reads snapshots straight from the ledger's market table.
#[derive(Clone)]
pub struct LedgerSnapshotProvider {
    ledger: LedgerDb,
}

impl LedgerSnapshotProvider {
    pub fn new(ledger: LedgerDb) -> Self {
        Self { ledger }
    }
}

impl SnapshotProvider for LedgerSnapshotProvider {
    fn get_snapshots(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>> {
        let rows = self.ledger.read_market_snapshots(symbols)?;
        Ok(rows
            .into_iter()
            .map(
                |(symbol, price, change_24h, volume_24h, trend_slope, volatility_ratio, regime, updated_at)| {
                    MarketSnapshot {
                        symbol,
                        price,
                        change_24h,
                        volume_24h,
                        trend_slope,
                        volatility_ratio,
                        regime,
                        updated_at,
                    }
                },
            )
            .collect())
    }
}

/// Fixed in-memory provider for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct FixedSnapshotProvider {
    pub snapshots: Vec<MarketSnapshot>,
}

impl FixedSnapshotProvider {
    pub fn new(snapshots: Vec<MarketSnapshot>) -> Self {
        Self { snapshots }
    }
}

impl SnapshotProvider for FixedSnapshotProvider {
    fn get_snapshots(&self, symbols: &[String]) -> Result<Vec<MarketSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|s| symbols.iter().any(|sym| sym == &s.symbol))
            .cloned()
            .collect())
    }
}
