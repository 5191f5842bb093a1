//! Market-data providers.
//!
//! Each provider implements the full capability trait; the gateway owns the
//! failover policy, so providers report plain per-call outcomes. `Ok(None)`
//! means the provider answered cleanly but has no data for the key, which the
//! gateway treats differently from a transport error.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::types::{Candle, ChainEntry, Greeks, OptionChain, OptionQuote, OptionSide, StockQuote};
use crate::config::ProviderConfig;

const PROVIDER_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider payload: {0}")]
    Decode(String),
}

pub type ProviderResult<T> = Result<Option<T>, ProviderError>;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stock_quote(&self, symbol: &str) -> ProviderResult<StockQuote>;

    async fn option_quote(&self, occ_symbol: &str) -> ProviderResult<OptionQuote>;

    async fn option_chain(
        &self,
        underlying: &str,
        expiration: Option<NaiveDate>,
    ) -> ProviderResult<OptionChain>;

    async fn historical_option_quote(
        &self,
        occ_symbol: &str,
        date: NaiveDate,
    ) -> ProviderResult<OptionQuote>;

    async fn greeks(&self, occ_symbol: &str) -> ProviderResult<Greeks>;

    async fn daily_candles(&self, symbol: &str, lookback_days: u32) -> ProviderResult<Vec<Candle>>;
}

// ---------------------------------------------------------------------------
// REST provider
// ---------------------------------------------------------------------------

/// Generic JSON-over-REST provider. The wire format below is the common
/// denominator the configured vendors expose; the `side` field on chain rows
/// is the provider's own call/put flag.
pub struct RestProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RestProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            name: config.name.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ProviderResult<T> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            req = req.query(&[("api_token", key.as_str())]);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();

        // 404 means the provider answered and has nothing for this key.
        if status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status, body });
        }

        let body = resp
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(Some(body))
    }
}

#[derive(Debug, Deserialize)]
struct WireStockQuote {
    symbol: String,
    bid: f64,
    ask: f64,
    last: f64,
}

#[derive(Debug, Deserialize)]
struct WireOptionQuote {
    bid: f64,
    ask: f64,
    last: f64,
    implied_volatility: Option<f64>,
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    rho: Option<f64>,
}

impl WireOptionQuote {
    fn into_quote(self, occ_symbol: &str) -> OptionQuote {
        let greeks = match (self.delta, self.gamma, self.theta, self.vega, self.rho) {
            (Some(delta), Some(gamma), Some(theta), Some(vega), Some(rho)) => Some(Greeks {
                delta,
                gamma,
                theta,
                vega,
                rho,
            }),
            _ => None,
        };
        OptionQuote {
            occ_symbol: occ_symbol.to_string(),
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            implied_volatility: self.implied_volatility,
            greeks,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChain {
    iv_rank: Option<f64>,
    rows: Vec<WireChainRow>,
}

#[derive(Debug, Deserialize)]
struct WireChainRow {
    contract: String,
    side: OptionSide,
    strike: f64,
    expiration: NaiveDate,
    bid: f64,
    ask: f64,
    last: f64,
    delta: Option<f64>,
    implied_volatility: Option<f64>,
    open_interest: Option<u64>,
    volume: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireGreeks {
    delta: f64,
    gamma: f64,
    theta: f64,
    vega: f64,
    rho: f64,
}

#[derive(Debug, Deserialize)]
struct WireCandle {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: u64,
}

#[async_trait]
impl MarketDataProvider for RestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stock_quote(&self, symbol: &str) -> ProviderResult<StockQuote> {
        let wire: Option<WireStockQuote> = self
            .get_json(&format!("/v1/stocks/{}/quote", symbol.to_uppercase()), &[])
            .await?;
        Ok(wire.map(|w| StockQuote {
            symbol: w.symbol,
            bid: w.bid,
            ask: w.ask,
            last: w.last,
            timestamp: Utc::now(),
        }))
    }

    async fn option_quote(&self, occ_symbol: &str) -> ProviderResult<OptionQuote> {
        let wire: Option<WireOptionQuote> = self
            .get_json(&format!("/v1/options/{occ_symbol}/quote"), &[])
            .await?;
        Ok(wire.map(|w| w.into_quote(occ_symbol)))
    }

    async fn option_chain(
        &self,
        underlying: &str,
        expiration: Option<NaiveDate>,
    ) -> ProviderResult<OptionChain> {
        let mut params = Vec::new();
        if let Some(exp) = expiration {
            params.push(("expiration", exp.format("%Y-%m-%d").to_string()));
        }
        let wire: Option<WireChain> = self
            .get_json(
                &format!("/v1/options/chain/{}", underlying.to_uppercase()),
                &params,
            )
            .await?;
        Ok(wire.map(|w| OptionChain {
            underlying: underlying.to_uppercase(),
            iv_rank: w.iv_rank,
            entries: w
                .rows
                .into_iter()
                .map(|r| ChainEntry {
                    occ_symbol: r.contract,
                    side: r.side,
                    strike: r.strike,
                    expiration: r.expiration,
                    bid: r.bid,
                    ask: r.ask,
                    last: r.last,
                    delta: r.delta,
                    implied_volatility: r.implied_volatility,
                    open_interest: r.open_interest,
                    volume: r.volume,
                })
                .collect(),
        }))
    }

    async fn historical_option_quote(
        &self,
        occ_symbol: &str,
        date: NaiveDate,
    ) -> ProviderResult<OptionQuote> {
        let wire: Option<WireOptionQuote> = self
            .get_json(
                &format!("/v1/options/{occ_symbol}/eod"),
                &[("date", date.format("%Y-%m-%d").to_string())],
            )
            .await?;
        Ok(wire.map(|w| w.into_quote(occ_symbol)))
    }

    async fn greeks(&self, occ_symbol: &str) -> ProviderResult<Greeks> {
        let wire: Option<WireGreeks> = self
            .get_json(&format!("/v1/options/{occ_symbol}/greeks"), &[])
            .await?;
        Ok(wire.map(|w| Greeks {
            delta: w.delta,
            gamma: w.gamma,
            theta: w.theta,
            vega: w.vega,
            rho: w.rho,
        }))
    }

    async fn daily_candles(&self, symbol: &str, lookback_days: u32) -> ProviderResult<Vec<Candle>> {
        let wire: Option<Vec<WireCandle>> = self
            .get_json(
                &format!("/v1/stocks/{}/candles", symbol.to_uppercase()),
                &[("days", lookback_days.to_string())],
            )
            .await?;
        Ok(wire.map(|rows| {
            rows.into_iter()
                .map(|c| Candle {
                    date: c.date,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
                .collect()
        }))
    }
}

// ---------------------------------------------------------------------------
// Static provider
// ---------------------------------------------------------------------------

/// Fixed-answer provider backed by in-memory tables. Serves dry runs without
/// network access and gives tests full control over every quote. Can also be
/// scripted to fail, to exercise the gateway's failover chain.
#[derive(Default)]
pub struct StaticProvider {
    name: String,
    stocks: dashmap::DashMap<String, StockQuote>,
    options: dashmap::DashMap<String, OptionQuote>,
    chains: dashmap::DashMap<String, OptionChain>,
    historical: dashmap::DashMap<(String, NaiveDate), OptionQuote>,
    candles: dashmap::DashMap<String, Vec<Candle>>,
    fail_all: std::sync::atomic::AtomicBool,
}

impl StaticProvider {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn set_stock(&self, quote: StockQuote) {
        self.stocks.insert(quote.symbol.to_uppercase(), quote);
    }

    pub fn set_option(&self, quote: OptionQuote) {
        self.options.insert(quote.occ_symbol.clone(), quote);
    }

    pub fn set_chain(&self, chain: OptionChain) {
        self.chains.insert(chain.underlying.to_uppercase(), chain);
    }

    pub fn set_historical(&self, occ_symbol: &str, date: NaiveDate, quote: OptionQuote) {
        self.historical.insert((occ_symbol.to_string(), date), quote);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.insert(symbol.to_uppercase(), candles);
    }

    /// When set, every call reports a transport failure.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), ProviderError> {
        if self.fail_all.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 503,
                body: "scripted failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stock_quote(&self, symbol: &str) -> ProviderResult<StockQuote> {
        self.check_failing()?;
        Ok(self
            .stocks
            .get(&symbol.to_uppercase())
            .map(|q| q.value().clone()))
    }

    async fn option_quote(&self, occ_symbol: &str) -> ProviderResult<OptionQuote> {
        self.check_failing()?;
        Ok(self.options.get(occ_symbol).map(|q| q.value().clone()))
    }

    async fn option_chain(
        &self,
        underlying: &str,
        expiration: Option<NaiveDate>,
    ) -> ProviderResult<OptionChain> {
        self.check_failing()?;
        let chain = self
            .chains
            .get(&underlying.to_uppercase())
            .map(|c| c.value().clone());
        Ok(chain.map(|mut c| {
            if let Some(exp) = expiration {
                c.entries.retain(|e| e.expiration == exp);
            }
            c
        }))
    }

    async fn historical_option_quote(
        &self,
        occ_symbol: &str,
        date: NaiveDate,
    ) -> ProviderResult<OptionQuote> {
        self.check_failing()?;
        Ok(self
            .historical
            .get(&(occ_symbol.to_string(), date))
            .map(|q| q.value().clone()))
    }

    async fn greeks(&self, occ_symbol: &str) -> ProviderResult<Greeks> {
        self.check_failing()?;
        Ok(self
            .options
            .get(occ_symbol)
            .and_then(|q| q.value().greeks))
    }

    async fn daily_candles(&self, symbol: &str, _lookback_days: u32) -> ProviderResult<Vec<Candle>> {
        self.check_failing()?;
        Ok(self
            .candles
            .get(&symbol.to_uppercase())
            .map(|c| c.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(symbol: &str, last: f64) -> StockQuote {
        StockQuote {
            symbol: symbol.into(),
            bid: last - 0.05,
            ask: last + 0.05,
            last,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn static_provider_round_trip() {
        let provider = StaticProvider::named("fixture");
        provider.set_stock(quote("SPY", 500.0));
        let got = provider.stock_quote("spy").await.unwrap().unwrap();
        assert!((got.last - 500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn static_provider_no_data_is_clean_none() {
        let provider = StaticProvider::named("fixture");
        let got = provider.stock_quote("QQQ").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn static_provider_scripted_failure() {
        let provider = StaticProvider::named("fixture");
        provider.set_stock(quote("SPY", 500.0));
        provider.set_failing(true);
        assert!(provider.stock_quote("SPY").await.is_err());
        provider.set_failing(false);
        assert!(provider.stock_quote("SPY").await.is_ok());
    }

    #[tokio::test]
    async fn static_chain_filters_requested_expiration() {
        let provider = StaticProvider::named("fixture");
        let near = NaiveDate::from_ymd_opt(2025, 6, 20).unwrap();
        let far = NaiveDate::from_ymd_opt(2025, 7, 18).unwrap();
        let mk = |exp: NaiveDate| ChainEntry {
            occ_symbol: String::new(),
            side: OptionSide::Put,
            strike: 495.0,
            expiration: exp,
            bid: 2.4,
            ask: 2.6,
            last: 2.5,
            delta: Some(-0.30),
            implied_volatility: Some(0.18),
            open_interest: Some(1000),
            volume: Some(50),
        };
        provider.set_chain(OptionChain {
            underlying: "SPY".into(),
            iv_rank: Some(0.6),
            entries: vec![mk(near), mk(far)],
        });

        let full = provider.option_chain("SPY", None).await.unwrap().unwrap();
        assert_eq!(full.entries.len(), 2);
        let only_near = provider
            .option_chain("SPY", Some(near))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(only_near.entries.len(), 1);
        assert_eq!(only_near.entries[0].expiration, near);
    }
}
