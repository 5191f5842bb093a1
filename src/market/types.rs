use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Option contract side. Serialized in the exchange convention (`CALL`/`PUT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    pub fn occ_char(self) -> char {
        match self {
            OptionSide::Call => 'C',
            OptionSide::Put => 'P',
        }
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionSide::Call => write!(f, "CALL"),
            OptionSide::Put => write!(f, "PUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

impl StockQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub occ_symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub implied_volatility: Option<f64>,
    pub greeks: Option<Greeks>,
    pub timestamp: DateTime<Utc>,
}

impl OptionQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// One contract row of an option chain, as reported by a provider.
/// `side` comes from the provider's own call/put field; consumers must split
/// chains on it and never on contract-symbol substrings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub occ_symbol: String,
    pub side: OptionSide,
    pub strike: f64,
    pub expiration: NaiveDate,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub delta: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub open_interest: Option<u64>,
    pub volume: Option<u64>,
}

impl ChainEntry {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub underlying: String,
    /// Implied-volatility rank of the underlying when the provider supplies
    /// one. Strategies that gate on IV rank skip symbols without it.
    pub iv_rank: Option<f64>,
    pub entries: Vec<ChainEntry>,
}

impl OptionChain {
    pub fn calls(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries
            .iter()
            .filter(|e| e.side == OptionSide::Call)
    }

    pub fn puts(&self) -> impl Iterator<Item = &ChainEntry> {
        self.entries.iter().filter(|e| e.side == OptionSide::Put)
    }

    pub fn expirations(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.entries.iter().map(|e| e.expiration).collect();
        dates.sort_unstable();
        dates.dedup();
        dates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}
