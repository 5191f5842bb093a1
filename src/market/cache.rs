//! Short-TTL in-memory cache for market data.
//!
//! Keys are (endpoint, normalized arguments). Quote entries live single-digit
//! seconds, chains until the end of the primary session, historical lookups
//! forever. Cache hits never touch a provider, so they do not count against
//! provider rate limits.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;

use super::types::{Candle, OptionChain, OptionQuote, StockQuote};

pub const QUOTE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Timed<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T: Clone> Timed<T> {
    fn fresh(&self) -> Option<T> {
        match self.expires_at {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(self.value.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct QuoteCache {
    stocks: DashMap<String, Timed<StockQuote>>,
    options: DashMap<String, Timed<OptionQuote>>,
    chains: DashMap<String, Timed<OptionChain>>,
    historical: DashMap<(String, NaiveDate), Option<OptionQuote>>,
    candles: DashMap<(String, u32), Timed<Vec<Candle>>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain_key(underlying: &str, expiration: Option<NaiveDate>) -> String {
        match expiration {
            Some(exp) => format!("{}:{exp}", underlying.to_uppercase()),
            None => format!("{}:*", underlying.to_uppercase()),
        }
    }

    pub fn stock(&self, symbol: &str) -> Option<StockQuote> {
        self.stocks.get(&symbol.to_uppercase())?.fresh()
    }

    pub fn put_stock(&self, quote: StockQuote) {
        self.stocks.insert(
            quote.symbol.to_uppercase(),
            Timed {
                value: quote,
                expires_at: Some(Instant::now() + QUOTE_TTL),
            },
        );
    }

    pub fn option(&self, occ_symbol: &str) -> Option<OptionQuote> {
        self.options.get(occ_symbol)?.fresh()
    }

    pub fn put_option(&self, quote: OptionQuote) {
        self.options.insert(
            quote.occ_symbol.clone(),
            Timed {
                value: quote,
                expires_at: Some(Instant::now() + QUOTE_TTL),
            },
        );
    }

    pub fn chain(&self, underlying: &str, expiration: Option<NaiveDate>) -> Option<OptionChain> {
        self.chains
            .get(&Self::chain_key(underlying, expiration))?
            .fresh()
    }

    /// `valid_for` is the remaining time in the current primary session.
    pub fn put_chain(
        &self,
        expiration: Option<NaiveDate>,
        chain: OptionChain,
        valid_for: Duration,
    ) {
        self.chains.insert(
            Self::chain_key(&chain.underlying, expiration),
            Timed {
                value: chain,
                expires_at: Some(Instant::now() + valid_for),
            },
        );
    }

    /// Historical quotes are immutable; `None` results are cached too so a
    /// known-empty (symbol, date) is not re-queried.
    pub fn historical(&self, occ_symbol: &str, date: NaiveDate) -> Option<Option<OptionQuote>> {
        self.historical
            .get(&(occ_symbol.to_string(), date))
            .map(|e| e.value().clone())
    }

    pub fn put_historical(&self, occ_symbol: &str, date: NaiveDate, quote: Option<OptionQuote>) {
        self.historical.insert((occ_symbol.to_string(), date), quote);
    }

    pub fn candles(&self, symbol: &str, lookback_days: u32) -> Option<Vec<Candle>> {
        self.candles
            .get(&(symbol.to_uppercase(), lookback_days))?
            .fresh()
    }

    pub fn put_candles(&self, symbol: &str, lookback_days: u32, candles: Vec<Candle>) {
        // Daily bars only change once per session; a long TTL is fine.
        self.candles.insert(
            (symbol.to_uppercase(), lookback_days),
            Timed {
                value: candles,
                expires_at: Some(Instant::now() + Duration::from_secs(6 * 3600)),
            },
        );
    }

    /// Drop only the short-TTL quote entries. Chains, historical lookups,
    /// and candles keep their longer lifetimes.
    pub fn clear_quotes(&self) {
        self.stocks.clear();
        self.options.clear();
    }

    pub fn clear(&self) {
        self.stocks.clear();
        self.options.clear();
        self.chains.clear();
        self.historical.clear();
        self.candles.clear();
    }
}
