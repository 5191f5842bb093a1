//! The play: one declarative trade and its lifecycle.
//!
//! A play is the atomic unit the whole engine operates on. It is stored as a
//! JSON record in exactly one state directory; moving between directories is
//! the state transition. The schema here is the single authoritative shape —
//! unknown keys are preserved opaquely for round-trip, unknown enum values
//! fail validation.

pub mod migrate;
pub mod store;

use chrono::{DateTime, NaiveDate, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{OrderSide, OrderType, TimeInForce};
use crate::error::{EngineError, Result};
use crate::market::{Greeks, OptionSide};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayState {
    New,
    PendingOpening,
    Open,
    PendingClosing,
    Closed,
    Expired,
}

impl PlayState {
    pub const ALL: [PlayState; 6] = [
        PlayState::New,
        PlayState::PendingOpening,
        PlayState::Open,
        PlayState::PendingClosing,
        PlayState::Closed,
        PlayState::Expired,
    ];

    /// Directory name under the play store root.
    pub fn dir_name(self) -> &'static str {
        match self {
            PlayState::New => "new",
            PlayState::PendingOpening => "pending-opening",
            PlayState::Open => "open",
            PlayState::PendingClosing => "pending-closing",
            PlayState::Closed => "closed",
            PlayState::Expired => "expired",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.dir_name() == name)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlayState::Closed | PlayState::Expired)
    }

    /// The permitted transitions of the lifecycle. A roll is the one legal
    /// self-transition (OPEN → OPEN with a new contract).
    pub fn can_transition(self, to: PlayState) -> bool {
        use PlayState::{Closed, Expired, New, Open, PendingClosing, PendingOpening};
        matches!(
            (self, to),
            (New, PendingOpening)
                | (PendingOpening, Open | New | Expired)
                | (Open, PendingClosing | Expired | Open)
                | (PendingClosing, Closed | Open)
        )
    }
}

impl std::fmt::Display for PlayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    #[serde(rename = "BTO")]
    BuyToOpen,
    #[serde(rename = "STC")]
    SellToClose,
    #[serde(rename = "STO")]
    SellToOpen,
    #[serde(rename = "BTC")]
    BuyToClose,
}

impl OrderAction {
    pub fn broker_side(self) -> OrderSide {
        match self {
            OrderAction::BuyToOpen | OrderAction::BuyToClose => OrderSide::Buy,
            OrderAction::SellToOpen | OrderAction::SellToClose => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    #[default]
    Long,
    Short,
}

impl PositionSide {
    pub fn opening_action(self) -> OrderAction {
        match self {
            PositionSide::Long => OrderAction::BuyToOpen,
            PositionSide::Short => OrderAction::SellToOpen,
        }
    }

    pub fn closing_action(self) -> OrderAction {
        match self {
            PositionSide::Long => OrderAction::SellToClose,
            PositionSide::Short => OrderAction::BuyToClose,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceReference {
    #[default]
    Last,
    Bid,
    Ask,
    Mid,
}

/// How the entry (or exit) order is priced once its trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderPolicy {
    Market,
    #[default]
    LimitAtBid,
    LimitAtAsk,
    LimitAtMid,
    LimitAtLast,
}

// ---------------------------------------------------------------------------
// Specs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Instrument {
    /// Underlying ticker. Hand-authored records pass through here, so the
    /// shape is checked, not just the length.
    #[garde(length(min = 1, max = 6), pattern(r"^[A-Za-z0-9.]+$"))]
    pub symbol: String,
    #[garde(length(min = 16, max = 21))]
    pub occ_symbol: String,
    #[garde(skip)]
    pub side: OptionSide,
    #[garde(range(min = 0.01))]
    pub strike: f64,
    #[garde(skip)]
    pub expiration: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EntrySpec {
    #[garde(range(min = 0.01))]
    pub target_stock_price: f64,
    #[garde(skip)]
    #[serde(default)]
    pub reference: PriceReference,
    #[garde(range(min = 0.0))]
    pub buffer: f64,
    #[garde(skip)]
    #[serde(default)]
    pub order_policy: OrderPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TakeProfitMode {
    #[default]
    Single,
    Multiple,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLossMode {
    #[default]
    Stop,
    Limit,
    Contingency,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailType {
    Percent,
    Atr,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TrailingSpec {
    #[garde(skip)]
    pub trail_type: TrailType,
    /// Trail distance as a fraction (Percent) — 0.02 is 2%.
    #[garde(inner(range(min = 0.0001, max = 1.0)))]
    #[serde(default)]
    pub percent: Option<f64>,
    /// Trail distance in price units (Fixed).
    #[garde(inner(range(min = 0.01)))]
    #[serde(default)]
    pub amount: Option<f64>,
    #[garde(inner(range(min = 2, max = 200)))]
    #[serde(default)]
    pub atr_period: Option<usize>,
    #[garde(inner(range(min = 0.1)))]
    #[serde(default)]
    pub atr_multiplier: Option<f64>,
    /// Profit fraction that must be reached before the trail activates.
    #[garde(range(min = 0.0))]
    #[serde(default)]
    pub activation_pct: f64,
    /// Once active, never let the level give back more than this fraction
    /// of the peak move.
    #[garde(inner(range(min = 0.0, max = 1.0)))]
    #[serde(default)]
    pub min_lock_pct: Option<f64>,
    /// Smallest level change worth persisting.
    #[garde(range(min = 0.0))]
    #[serde(default = "default_min_tick")]
    pub min_tick: f64,
    /// Track premium peaks instead of stock-price peaks.
    #[garde(skip)]
    #[serde(default)]
    pub on_premium: bool,
}

fn default_min_tick() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Default)]
pub struct TakeProfitSpec {
    #[garde(skip)]
    #[serde(default)]
    pub mode: TakeProfitMode,
    #[garde(inner(range(min = 0.01)))]
    #[serde(default)]
    pub stock_price: Option<f64>,
    #[garde(inner(range(min = 0.01)))]
    #[serde(default)]
    pub premium: Option<f64>,
    /// Premium move as a fraction of entry, converted to an absolute target
    /// at fill time.
    #[garde(inner(range(min = 0.0001)))]
    #[serde(default)]
    pub premium_pct: Option<f64>,
    #[garde(dive)]
    #[serde(default)]
    pub trailing: Option<TrailingSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ContingencySpec {
    /// Looser stock-price level that forces a market exit when the ordinary
    /// stop cannot execute (stale option, blown-out spread).
    #[garde(range(min = 0.01))]
    pub stock_price: f64,
    #[garde(skip)]
    #[serde(default)]
    pub reference: PriceReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Default)]
pub struct StopLossSpec {
    #[garde(skip)]
    #[serde(default)]
    pub mode: StopLossMode,
    #[garde(inner(range(min = 0.01)))]
    #[serde(default)]
    pub stock_price: Option<f64>,
    #[garde(inner(range(min = 0.01)))]
    #[serde(default)]
    pub premium: Option<f64>,
    #[garde(inner(range(min = 0.0001)))]
    #[serde(default)]
    pub premium_pct: Option<f64>,
    #[garde(dive)]
    #[serde(default)]
    pub contingency: Option<ContingencySpec>,
    #[garde(dive)]
    #[serde(default)]
    pub trailing: Option<TrailingSpec>,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrderIds {
    /// Entry order id, recorded durably before the NEW → PENDING_OPENING
    /// move. A play found in NEW with this set is an orphan to reconcile.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default)]
    pub exit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Fills {
    /// Premium paid at open (LONG) or credit received (SHORT), per contract.
    #[serde(default)]
    pub entry_premium: Option<f64>,
    #[serde(default)]
    pub exit_premium: Option<f64>,
    /// Contracts actually filled when the entry ended partially filled.
    #[serde(default)]
    pub entry_filled_qty: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub at: DateTime<Utc>,
    pub peak: f64,
    pub level: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrailState {
    /// Peak favorable price (stock or premium, per trailing config).
    #[serde(default)]
    pub peak: Option<f64>,
    #[serde(default)]
    pub tp_level: Option<f64>,
    #[serde(default)]
    pub sl_level: Option<f64>,
    #[serde(default)]
    pub history: Vec<TrailPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuditLog {
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub open_stock_price: Option<f64>,
    #[serde(default)]
    pub close_stock_price: Option<f64>,
    #[serde(default)]
    pub greeks_at_open: Option<Greeks>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    /// Last non-fatal error recorded against this play (risk denial,
    /// broker rejection, ...). Shown by `status`.
    #[serde(default)]
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Play
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Play {
    #[garde(length(min = 1))]
    pub id: String,
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub strategy_tag: String,
    #[garde(skip)]
    #[serde(default)]
    pub creator: String,
    #[garde(skip)]
    pub created_at: DateTime<Utc>,
    #[garde(skip)]
    pub state: PlayState,
    #[garde(dive)]
    pub instrument: Instrument,
    #[garde(skip)]
    #[serde(default)]
    pub position_side: PositionSide,
    #[garde(skip)]
    pub order_action: OrderAction,
    #[garde(range(min = 1))]
    pub contracts: u32,
    #[garde(dive)]
    pub entry: EntrySpec,
    #[garde(dive)]
    #[serde(default)]
    pub take_profit: TakeProfitSpec,
    #[garde(dive)]
    #[serde(default)]
    pub stop_loss: StopLossSpec,
    #[garde(skip)]
    #[serde(default)]
    pub order_ids: OrderIds,
    #[garde(skip)]
    #[serde(default)]
    pub fills: Fills,
    #[garde(skip)]
    #[serde(default)]
    pub trail: TrailState,
    #[garde(skip)]
    #[serde(default)]
    pub audit: AuditLog,
    #[garde(skip)]
    #[serde(default)]
    pub roll_count: u32,
    /// Expiration of the first contract, preserved across rolls.
    #[garde(skip)]
    #[serde(default)]
    pub original_expiration: Option<NaiveDate>,
    /// Unknown keys from older or richer records, preserved round-trip.
    #[garde(skip)]
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Play {
    /// A fresh hand-shaped play in NEW. The OCC symbol is derived from the
    /// instrument fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        strategy_tag: &str,
        symbol: &str,
        side: OptionSide,
        strike: f64,
        expiration: NaiveDate,
        position_side: PositionSide,
        contracts: u32,
        entry: EntrySpec,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            strategy_tag: strategy_tag.to_string(),
            creator: String::new(),
            created_at: Utc::now(),
            state: PlayState::New,
            instrument: Instrument {
                symbol: symbol.to_uppercase(),
                occ_symbol: occ::format(symbol, expiration, side, strike),
                side,
                strike,
                expiration,
            },
            position_side,
            order_action: position_side.opening_action(),
            contracts,
            entry,
            take_profit: TakeProfitSpec::default(),
            stop_loss: StopLossSpec::default(),
            order_ids: OrderIds::default(),
            fills: Fills::default(),
            trail: TrailState::default(),
            audit: AuditLog::default(),
            roll_count: 0,
            original_expiration: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Entry premium/credit per contract; `None` until the entry fills.
    pub fn entry_premium(&self) -> Option<f64> {
        self.fills.entry_premium
    }

    /// Contracts effectively held: the filled quantity if the entry was
    /// partial, the configured count otherwise.
    pub fn held_contracts(&self) -> u32 {
        self.fills.entry_filled_qty.unwrap_or(self.contracts)
    }

    pub fn opening_order_side(&self) -> OrderSide {
        self.position_side.opening_action().broker_side()
    }

    pub fn closing_order_side(&self) -> OrderSide {
        self.position_side.closing_action().broker_side()
    }

    /// Full structural validation: garde field ranges plus the cross-field
    /// invariants no single field can express.
    pub fn validate_record(&self) -> Result<()> {
        Validate::validate(self)
            .map_err(|report| EngineError::Validation(format!("play {}: {report}", self.id)))?;

        // position_side and order_action must agree.
        if self.order_action != self.position_side.opening_action()
            && self.order_action != self.position_side.closing_action()
        {
            return Err(EngineError::Validation(format!(
                "play {}: order_action {:?} inconsistent with position_side {:?}",
                self.id, self.order_action, self.position_side
            )));
        }

        // OCC symbol must match the instrument fields.
        let expected = occ::format(
            &self.instrument.symbol,
            self.instrument.expiration,
            self.instrument.side,
            self.instrument.strike,
        );
        if self.instrument.occ_symbol != expected {
            return Err(EngineError::Validation(format!(
                "play {}: occ_symbol {} does not match instrument (expected {})",
                self.id, self.instrument.occ_symbol, expected
            )));
        }

        // A play in OPEN must know what it paid or collected.
        if self.state == PlayState::Open && self.fills.entry_premium.is_none() {
            return Err(EngineError::Validation(format!(
                "play {}: OPEN with no entry premium recorded",
                self.id
            )));
        }

        // Premium target direction per position side, once entry is known.
        if let (Some(entry), Some(tp)) = (self.fills.entry_premium, self.take_profit.premium) {
            let ok = match self.position_side {
                PositionSide::Long => tp > entry,
                PositionSide::Short => tp < entry,
            };
            if !ok {
                return Err(EngineError::Validation(format!(
                    "play {}: TP premium {tp} on wrong side of entry {entry} for {:?}",
                    self.id, self.position_side
                )));
            }
        }
        if let (Some(entry), Some(sl)) = (self.fills.entry_premium, self.stop_loss.premium) {
            let ok = match self.position_side {
                PositionSide::Long => sl < entry,
                PositionSide::Short => sl > entry,
            };
            if !ok {
                return Err(EngineError::Validation(format!(
                    "play {}: SL premium {sl} on wrong side of entry {entry} for {:?}",
                    self.id, self.position_side
                )));
            }
        }

        // Contingency stop must be strictly further from entry than the
        // ordinary stop.
        if let (Some(ordinary), Some(contingency)) = (
            self.stop_loss.stock_price,
            self.stop_loss.contingency.as_ref().map(|c| c.stock_price),
        ) {
            let favorable_up = self.stock_up_is_favorable();
            let further = if favorable_up {
                contingency < ordinary
            } else {
                contingency > ordinary
            };
            if !further {
                return Err(EngineError::Validation(format!(
                    "play {}: contingency stop {contingency} not beyond ordinary stop {ordinary}",
                    self.id
                )));
            }
        }

        // Pending states carry exactly one outstanding broker order id.
        let outstanding = match self.state {
            PlayState::PendingOpening => self.order_ids.entry.is_some() && self.order_ids.exit.is_none(),
            PlayState::PendingClosing => self.order_ids.exit.is_some(),
            _ => true,
        };
        if !outstanding {
            return Err(EngineError::Validation(format!(
                "play {}: state {} without matching broker order id",
                self.id, self.state
            )));
        }

        Ok(())
    }

    /// Whether a rising underlying is the favorable direction for this play.
    pub fn stock_up_is_favorable(&self) -> bool {
        match (self.position_side, self.instrument.side) {
            (PositionSide::Long, OptionSide::Call) | (PositionSide::Short, OptionSide::Put) => true,
            (PositionSide::Long, OptionSide::Put) | (PositionSide::Short, OptionSide::Call) => {
                false
            }
        }
    }

    /// Default time-in-force: day orders, so unfilled entries expire at the
    /// close instead of lingering.
    pub fn tif(&self) -> TimeInForce {
        TimeInForce::Day
    }

    /// Resolve the configured order policy against an option quote.
    pub fn resolve_order_price(
        policy: OrderPolicy,
        quote: &crate::market::OptionQuote,
    ) -> (OrderType, Option<f64>) {
        match policy {
            OrderPolicy::Market => (OrderType::Market, None),
            OrderPolicy::LimitAtBid => (OrderType::Limit, Some(quote.bid)),
            OrderPolicy::LimitAtAsk => (OrderType::Limit, Some(quote.ask)),
            OrderPolicy::LimitAtMid => (OrderType::Limit, Some(quote.mid())),
            OrderPolicy::LimitAtLast => (OrderType::Limit, Some(quote.last)),
        }
    }
}

// ---------------------------------------------------------------------------
// OCC symbols
// ---------------------------------------------------------------------------

/// The exchange-standard option contract identifier:
/// root (padded to 6), yymmdd, C/P, strike × 1000 zero-padded to 8 digits.
pub mod occ {
    use chrono::NaiveDate;

    use crate::error::EngineError;
    use crate::market::OptionSide;

    pub fn format(symbol: &str, expiration: NaiveDate, side: OptionSide, strike: f64) -> String {
        let millis = (strike * 1000.0).round() as u64;
        format!(
            "{:<6}{}{}{millis:08}",
            symbol.to_uppercase(),
            expiration.format("%y%m%d"),
            side.occ_char(),
        )
    }

    pub fn parse(occ: &str) -> Result<(String, NaiveDate, OptionSide, f64), EngineError> {
        let bad = |msg: &str| EngineError::Validation(format!("occ symbol {occ:?}: {msg}"));
        if occ.len() < 16 {
            return Err(bad("too short"));
        }
        let (root, rest) = occ.split_at(occ.len() - 15);
        let symbol = root.trim_end().to_string();
        if symbol.is_empty() {
            return Err(bad("empty root"));
        }
        let date = NaiveDate::parse_from_str(&rest[..6], "%y%m%d")
            .map_err(|_| bad("bad expiration"))?;
        let side = match &rest[6..7] {
            "C" => OptionSide::Call,
            "P" => OptionSide::Put,
            _ => return Err(bad("side must be C or P")),
        };
        let millis: u64 = rest[7..]
            .parse()
            .map_err(|_| bad("bad strike"))?;
        Ok((symbol, date, side, millis as f64 / 1000.0))
    }
}
