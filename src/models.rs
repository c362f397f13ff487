use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Version stamp written into every decision-telemetry row. Bump when the
/// structural fields change; readers must check it before trusting the shape.
pub const DECISION_SCHEMA_VERSION: u32 = 2;

/// Machine-readable reason codes shared by the safety chain, the drought
/// resolver, and the event log.
pub mod reasons {
    pub const LIVE_DISABLED: &str = "LIVE_DISABLED";
    pub const NO_CREDENTIALS: &str = "NO_CREDENTIALS";
    pub const NOT_ARMED: &str = "NOT_ARMED";
    pub const CANARY_EXPIRED: &str = "CANARY_EXPIRED";
    pub const CANARY_NOT_FOUND: &str = "CANARY_NOT_FOUND";
    pub const CANARY_ALREADY_CONSUMED: &str = "CANARY_ALREADY_CONSUMED";
    pub const TRADE_CAP_EXCEEDED: &str = "TRADE_CAP_EXCEEDED";
    pub const DAILY_CAP_EXCEEDED: &str = "DAILY_CAP_EXCEEDED";
    pub const INSUFFICIENT_CASH: &str = "INSUFFICIENT_CASH";
    pub const INSUFFICIENT_ASSET: &str = "INSUFFICIENT_ASSET";

    pub const NO_SIGNAL: &str = "no_signal";
    pub const SHORT_DROUGHT: &str = "short_drought";
    pub const LONG_DROUGHT: &str = "long_drought";
    pub const OVERRIDE_OFF: &str = "override_off";
    pub const COOLDOWN: &str = "cooldown";
    pub const HOURLY_CAP: &str = "hourly_cap";
    pub const KILL_DRAWDOWN: &str = "kill_drawdown";
    pub const KILL_VOLATILITY: &str = "kill_volatility";
}

/// Strategy templates — the closed set of entry/exit shapes an agent can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTemplate {
    Momentum,
    MeanReversion,
    Breakout,
}

impl StrategyTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTemplate::Momentum => "momentum",
            StrategyTemplate::MeanReversion => "mean_reversion",
            StrategyTemplate::Breakout => "breakout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "momentum" => Some(StrategyTemplate::Momentum),
            "mean_reversion" => Some(StrategyTemplate::MeanReversion),
            "breakout" => Some(StrategyTemplate::Breakout),
            _ => None,
        }
    }

    pub const ALL: [StrategyTemplate; 3] = [
        StrategyTemplate::Momentum,
        StrategyTemplate::MeanReversion,
        StrategyTemplate::Breakout,
    ];
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Core,
    Explorer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Core => "core",
            AgentRole::Explorer => "explorer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(AgentRole::Core),
            "explorer" => Some(AgentRole::Explorer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Retired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AgentStatus::Active),
            "retired" => Some(AgentStatus::Retired),
            _ => None,
        }
    }
}

/// One parameterized strategy instance. Genes are immutable for the agent's
/// lifetime; thresholds are keyed by gate name plus a handful of exit/sizing
/// keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub generation_id: String,
    pub name: String,
    pub template: StrategyTemplate,
    pub genes: HashMap<String, f64>,
    pub capital_allocation: f64,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub created_at: i64,
}

impl Agent {
    pub fn gene(&self, key: &str, default: f64) -> f64 {
        self.genes.get(key).copied().unwrap_or(default)
    }
}

/// Generation run states. Transitions are validated, never overwritten blindly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Starting,
    Active,
    Ending,
    Ended,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Starting => "starting",
            GenerationStatus::Active => "active",
            GenerationStatus::Ending => "ending",
            GenerationStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(GenerationStatus::Starting),
            "active" => Some(GenerationStatus::Active),
            "ending" => Some(GenerationStatus::Ending),
            "ended" => Some(GenerationStatus::Ended),
            _ => None,
        }
    }

    /// Legal forward transitions only; everything else is rejected.
    pub fn can_transition_to(&self, next: GenerationStatus) -> bool {
        matches!(
            (self, next),
            (GenerationStatus::Starting, GenerationStatus::Active)
                | (GenerationStatus::Active, GenerationStatus::Ending)
                | (GenerationStatus::Ending, GenerationStatus::Ended)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Time,
    Trades,
    Drawdown,
    Drought,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Time => "time",
            TerminationReason::Trades => "trades",
            TerminationReason::Drawdown => "drawdown",
            TerminationReason::Drought => "drought",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time" => Some(TerminationReason::Time),
            "trades" => Some(TerminationReason::Trades),
            "drawdown" => Some(TerminationReason::Drawdown),
            "drought" => Some(TerminationReason::Drought),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub number: i64,
    pub status: GenerationStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub termination_reason: Option<TerminationReason>,
    pub total_pnl: f64,
    pub trade_count: i64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: String,
    pub cash: f64,
    pub starting_capital: f64,
    pub updated_at: i64,
}

/// Per-symbol holding. Quantity never goes negative; no shorting is modeled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub account_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    Paper,
    Live,
    Test,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Paper => "paper",
            TradeMode::Live => "live",
            TradeMode::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paper" => Some(TradeMode::Paper),
            "live" => Some(TradeMode::Live),
            "test" => Some(TradeMode::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Filled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filled" => Some(OrderStatus::Filled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

/// Tag applied to liquidation sells at generation end. Fills carrying it are
/// excluded from fitness as learnable trades.
pub const TAG_FORCED_LIQUIDATION: &str = "forced_liquidation";

/// An order request as accepted by the system. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub account_id: String,
    pub agent_id: String,
    pub generation_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub mode: TradeMode,
    pub tags: Vec<String>,
    pub is_learnable: bool,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: i64,
}

impl OrderRecord {
    /// Learnable means the fill may feed fitness: paper/live mode and not a
    /// forced liquidation or rollover artifact.
    pub fn compute_learnable(mode: TradeMode, tags: &[String]) -> bool {
        if mode == TradeMode::Test {
            return false;
        }
        !tags.iter().any(|t| t == TAG_FORCED_LIQUIDATION || t == "rollover")
    }
}

/// The realized execution of an order. Immutable once written; denormalized
/// with agent/generation/symbol so fitness reads need no joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub id: String,
    pub order_id: String,
    pub agent_id: String,
    pub generation_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub slippage_pct: f64,
    pub is_learnable: bool,
    pub filled_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Buy,
    Sell,
    Hold,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Buy => "buy",
            DecisionKind::Sell => "sell",
            DecisionKind::Hold => "hold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(DecisionKind::Buy),
            "sell" => Some(DecisionKind::Sell),
            "hold" => Some(DecisionKind::Hold),
            _ => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, DecisionKind::Hold)
    }
}

/// One gate that was checked and did not clear. Margin is the signed shortfall
/// from the threshold: negative while failing, and the failure closest to zero
/// is the "nearest miss" the tuner keys on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: String,
    pub actual: f64,
    pub threshold: f64,
    pub margin: f64,
}

/// Compact drought facts embedded in every decision event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroughtSnapshot {
    pub detected: bool,
    pub active: bool,
    pub blocked: bool,
    pub killed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// Versioned decision-telemetry record, one per cycle. Write-once, read-many:
/// the tuner and the drought windows consume these rows, so the structural
/// fields are typed and `ext` is reserved for diagnostics nothing depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub schema_version: u32,
    pub id: String,
    pub agent_id: String,
    pub generation_id: String,
    pub symbol: Option<String>,
    pub decision: DecisionKind,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub exit_reason: Option<String>,
    pub gate_failures: Vec<GateFailure>,
    pub nearest_miss: Option<GateFailure>,
    pub drought: DroughtSnapshot,
    pub order_id: Option<String>,
    #[serde(default)]
    pub ext: serde_json::Value,
    pub created_at: i64,
}

/// Single-use, time-boxed authorization for one live order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSession {
    pub id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub max_orders: i64,
    pub spent_at: Option<i64>,
    pub spent_by_request_id: Option<String>,
}

impl ArmSession {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_spent(&self) -> bool {
        self.spent_at.is_some()
    }
}

/// Result of an arm-session spend attempt. Exactly one concurrent caller can
/// ever observe `success == true` for a given session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSpendOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub orders_remaining: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DroughtOverride {
    Auto,
    ForceOff,
    ForceOn,
}

impl DroughtOverride {
    pub fn as_str(&self) -> &'static str {
        match self {
            DroughtOverride::Auto => "auto",
            DroughtOverride::ForceOff => "force_off",
            DroughtOverride::ForceOn => "force_on",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(DroughtOverride::Auto),
            "force_off" => Some(DroughtOverride::ForceOff),
            "force_on" => Some(DroughtOverride::ForceOn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    Running,
    Paused,
}

impl SystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemStatus::Running => "running",
            SystemStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SystemStatus::Running),
            "paused" => Some(SystemStatus::Paused),
            _ => None,
        }
    }
}

/// Adaptive-tuning state carried inside the runtime config document: signed
/// fractional offsets per gate plus the last adjustment time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TuningState {
    #[serde(default)]
    pub offsets: HashMap<String, f64>,
    #[serde(default)]
    pub last_adjusted_at: Option<i64>,
}

/// The single mutable runtime-policy document. Read fresh at the start of
/// every invocation, passed down as an immutable snapshot, written back only
/// through the version-guarded update in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub version: i64,
    pub system_status: SystemStatus,
    pub trading_mode: TradeMode,

    // Live-capital caps (canary limits)
    pub live_trading_enabled: bool,
    pub canary_max_notional_per_trade: f64,
    pub canary_max_notional_per_day: f64,
    pub arm_session_minutes: i64,

    // Drought detection and response
    pub drought_override: DroughtOverride,
    pub drought_cooldown_until: Option<i64>,
    pub drought_short_window_cycles: i64,
    pub drought_short_min_holds: i64,
    pub drought_short_max_orders: i64,
    pub drought_long_window_hours: i64,
    pub drought_long_min_holds: i64,
    pub drought_long_max_orders: i64,
    pub drought_kill_drawdown_pct: f64,
    pub drought_kill_volatility_ratio: f64,
    pub drought_cooldown_hours: i64,
    pub drought_relax_fraction: f64,

    // Peak-equity watermark: monotone, survives restarts
    pub peak_equity: f64,

    // Adaptive tuner
    pub tuning_enabled: bool,
    pub tuning_step: f64,
    pub tuning_max_relax: f64,
    pub tuning_cooldown_minutes: i64,
    pub tuning_window_events: i64,
    pub tuning: TuningState,

    // Cycle behavior
    pub snapshot_max_age_secs: i64,
    pub symbols_per_cycle: i64,
    pub min_confidence: f64,
    pub max_trades_per_hour: i64,
    pub explorer_min_confidence: f64,
    pub explorer_max_trades_per_hour: i64,

    // Generation lifecycle limits
    pub generation_max_days: f64,
    pub generation_max_trades: i64,
    pub generation_max_drawdown_pct: f64,
    pub stagnation_days: f64,
    pub min_sample_trades: i64,

    // Fitness shaping
    pub fitness_max_trades_per_day: f64,
    pub fitness_diversity_cap: f64,
    pub shadow_horizon_hours: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 0,
            system_status: SystemStatus::Running,
            trading_mode: TradeMode::Paper,

            live_trading_enabled: false,
            canary_max_notional_per_trade: 10.0,
            canary_max_notional_per_day: 25.0,
            arm_session_minutes: 15,

            drought_override: DroughtOverride::Auto,
            drought_cooldown_until: None,
            drought_short_window_cycles: 30,
            drought_short_min_holds: 20,
            drought_short_max_orders: 3,
            drought_long_window_hours: 24,
            drought_long_min_holds: 100,
            drought_long_max_orders: 5,
            drought_kill_drawdown_pct: 0.10,
            drought_kill_volatility_ratio: 3.0,
            drought_cooldown_hours: 6,
            drought_relax_fraction: 0.15,

            peak_equity: 0.0,

            tuning_enabled: true,
            tuning_step: 0.05,
            tuning_max_relax: 0.30,
            tuning_cooldown_minutes: 60,
            tuning_window_events: 50,
            tuning: TuningState::default(),

            snapshot_max_age_secs: 300,
            symbols_per_cycle: 3,
            // Entry confidence is calibrated down to zero for brand-new
            // agents, so a nonzero base floor would starve the cohort before
            // it ever trades. Only explorers carry a real floor by default.
            min_confidence: 0.0,
            max_trades_per_hour: 6,
            explorer_min_confidence: 0.55,
            explorer_max_trades_per_hour: 2,

            generation_max_days: 30.0,
            generation_max_trades: 200,
            generation_max_drawdown_pct: 0.15,
            stagnation_days: 10.0,
            min_sample_trades: 10,

            fitness_max_trades_per_day: 20.0,
            fitness_diversity_cap: 0.10,
            shadow_horizon_hours: 6,
        }
    }
}

/// Per-cycle account valuation: cash plus mark-to-market positions. The feed
/// for the peak watermark and every drawdown boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavSnapshot {
    pub id: String,
    pub ts: i64,
    pub cash: f64,
    pub positions_value: f64,
    pub equity: f64,
}

/// A counterfactual trade recorded when a candidate was blocked from
/// dispatch. Resolved later against the market and blended into fitness while
/// real samples are scarce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTrade {
    pub id: String,
    pub agent_id: String,
    pub generation_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub created_at: i64,
    pub resolved_at: Option<i64>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
}
