//! Unified market-data access with provider failover and caching.
//!
//! Providers are tried strictly in configured order. A success on any
//! provider answers the call; the next call starts again from the first
//! enabled provider, so a recovered primary is picked back up automatically.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use futures::future::BoxFuture;

use super::cache::QuoteCache;
use super::providers::{MarketDataProvider, ProviderResult};
use super::types::{Candle, Greeks, OptionChain, OptionQuote, StockQuote};
use crate::clock::MarketClock;
use crate::error::{EngineError, Result};

type ProviderCall<T> = (String, BoxFuture<'static, ProviderResult<T>>);

pub struct MarketDataGateway {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    cache: QuoteCache,
    clock: MarketClock,
    /// `provider_fallback_count["primary->backup"]` increments whenever a
    /// call advances past a failed provider to the named successor.
    fallback_counts: DashMap<String, u64>,
}

impl MarketDataGateway {
    pub fn new(providers: Vec<Arc<dyn MarketDataProvider>>, clock: MarketClock) -> Self {
        Self {
            providers,
            cache: QuoteCache::new(),
            clock,
            fallback_counts: DashMap::new(),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn fallback_count(&self, edge: &str) -> u64 {
        self.fallback_counts.get(edge).map_or(0, |e| *e.value())
    }

    /// Log accumulated failover counters; called at cycle end.
    pub fn log_fallback_summary(&self) {
        for entry in &self.fallback_counts {
            tracing::info!(
                edge = %entry.key(),
                count = *entry.value(),
                "provider fallbacks this session"
            );
        }
    }

    /// Start-of-tick housekeeping: stale quotes from the previous cycle are
    /// dropped so every strategy reads a consistent fresh snapshot, while
    /// chains and historical data keep their longer lifetimes.
    pub fn begin_cycle(&self) {
        self.cache.clear_quotes();
    }

    #[cfg(test)]
    pub(crate) fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Await each prepared call in provider order. First success wins.
    /// `Ok(None)` from every provider is `NoData`; an error from every
    /// provider is `TransportFailure`.
    async fn run_failover<T>(&self, key: &str, calls: Vec<ProviderCall<T>>) -> Result<T> {
        if calls.is_empty() {
            return Err(EngineError::Config(
                "no market data providers enabled".into(),
            ));
        }

        let total = calls.len();
        let names: Vec<String> = calls.iter().map(|(name, _)| name.clone()).collect();
        let mut errors: Vec<String> = Vec::new();

        for (idx, (name, fut)) in calls.into_iter().enumerate() {
            match fut.await {
                Ok(Some(value)) => {
                    if !errors.is_empty() {
                        tracing::debug!(key, provider = %name, "failover succeeded");
                    }
                    return Ok(value);
                }
                Ok(None) => {
                    tracing::debug!(key, provider = %name, "provider has no data");
                }
                Err(e) => {
                    tracing::warn!(key, provider = %name, error = %e, "provider call failed");
                    errors.push(format!("{name}: {e}"));
                    if let Some(next) = names.get(idx + 1) {
                        let edge = format!("{name}->{next}");
                        *self.fallback_counts.entry(edge).or_insert(0) += 1;
                    }
                }
            }
        }

        if errors.len() == total {
            Err(EngineError::TransportFailure {
                key: key.to_string(),
                detail: errors.join("; "),
            })
        } else {
            Err(EngineError::NoData {
                key: key.to_string(),
            })
        }
    }

    pub async fn get_stock_quote(&self, symbol: &str) -> Result<StockQuote> {
        if let Some(hit) = self.cache.stock(symbol) {
            return Ok(hit);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let symbol = symbol.to_string();
                let fut: BoxFuture<'static, _> =
                    Box::pin(async move { p.stock_quote(&symbol).await });
                (name, fut)
            })
            .collect();
        let quote = self
            .run_failover(&format!("stock_quote:{symbol}"), calls)
            .await?;
        self.cache.put_stock(quote.clone());
        Ok(quote)
    }

    pub async fn get_option_quote(&self, occ_symbol: &str) -> Result<OptionQuote> {
        if let Some(hit) = self.cache.option(occ_symbol) {
            return Ok(hit);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let occ = occ_symbol.to_string();
                let fut: BoxFuture<'static, _> =
                    Box::pin(async move { p.option_quote(&occ).await });
                (name, fut)
            })
            .collect();
        let quote = self
            .run_failover(&format!("option_quote:{occ_symbol}"), calls)
            .await?;
        self.cache.put_option(quote.clone());
        Ok(quote)
    }

    pub async fn get_option_chain(
        &self,
        underlying: &str,
        expiration: Option<NaiveDate>,
    ) -> Result<OptionChain> {
        if let Some(hit) = self.cache.chain(underlying, expiration) {
            return Ok(hit);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let underlying = underlying.to_string();
                let fut: BoxFuture<'static, _> =
                    Box::pin(async move { p.option_chain(&underlying, expiration).await });
                (name, fut)
            })
            .collect();
        let chain = self
            .run_failover(&format!("option_chain:{underlying}"), calls)
            .await?;
        self.cache
            .put_chain(expiration, chain.clone(), self.chain_ttl());
        Ok(chain)
    }

    /// Historical lookups treat an empty answer as a valid, cacheable result
    /// rather than an error: `Ok(None)` means no quote existed on that date.
    pub async fn get_historical_option_quote(
        &self,
        occ_symbol: &str,
        date: NaiveDate,
    ) -> Result<Option<OptionQuote>> {
        if let Some(hit) = self.cache.historical(occ_symbol, date) {
            return Ok(hit);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let occ = occ_symbol.to_string();
                let fut: BoxFuture<'static, _> =
                    Box::pin(async move { p.historical_option_quote(&occ, date).await });
                (name, fut)
            })
            .collect();
        let result = match self
            .run_failover(&format!("historical:{occ_symbol}:{date}"), calls)
            .await
        {
            Ok(quote) => Some(quote),
            Err(EngineError::NoData { .. }) => None,
            Err(e) => return Err(e),
        };
        self.cache.put_historical(occ_symbol, date, result.clone());
        Ok(result)
    }

    pub async fn get_greeks(&self, occ_symbol: &str) -> Result<Greeks> {
        // A cached option quote may already carry greeks.
        if let Some(greeks) = self.cache.option(occ_symbol).and_then(|q| q.greeks) {
            return Ok(greeks);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let occ = occ_symbol.to_string();
                let fut: BoxFuture<'static, _> = Box::pin(async move { p.greeks(&occ).await });
                (name, fut)
            })
            .collect();
        self.run_failover(&format!("greeks:{occ_symbol}"), calls)
            .await
    }

    pub async fn get_daily_candles(&self, symbol: &str, lookback_days: u32) -> Result<Vec<Candle>> {
        if let Some(hit) = self.cache.candles(symbol, lookback_days) {
            return Ok(hit);
        }
        let calls = self
            .providers
            .iter()
            .map(|p| {
                let name = p_name(p);
                let p = Arc::clone(p);
                let symbol = symbol.to_string();
                let fut: BoxFuture<'static, _> =
                    Box::pin(async move { p.daily_candles(&symbol, lookback_days).await });
                (name, fut)
            })
            .collect();
        let candles = self
            .run_failover(&format!("candles:{symbol}"), calls)
            .await?;
        self.cache
            .put_candles(symbol, lookback_days, candles.clone());
        Ok(candles)
    }

    fn chain_ttl(&self) -> Duration {
        let now = self.clock.now();
        match self.clock.session_close_instant(now.date_naive()) {
            Some(close) if close > now => (close - now)
                .to_std()
                .unwrap_or_else(|_| Duration::from_secs(60)),
            // Outside a session chains barely move; hold for an hour.
            _ => Duration::from_secs(3600),
        }
    }
}

fn p_name(p: &Arc<dyn MarketDataProvider>) -> String {
    p.name().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::providers::StaticProvider;
    use chrono::Utc;
    use chrono_tz::America::New_York;

    fn quote(symbol: &str, last: f64) -> StockQuote {
        StockQuote {
            symbol: symbol.into(),
            bid: last - 0.05,
            ask: last + 0.05,
            last,
            timestamp: Utc::now(),
        }
    }

    fn gateway(providers: Vec<Arc<dyn MarketDataProvider>>) -> MarketDataGateway {
        MarketDataGateway::new(providers, MarketClock::new(New_York, false))
    }

    #[tokio::test]
    async fn first_provider_answers() {
        let primary = Arc::new(StaticProvider::named("primary"));
        primary.set_stock(quote("SPY", 500.0));
        let backup = Arc::new(StaticProvider::named("backup"));
        backup.set_stock(quote("SPY", 999.0));

        let gw = gateway(vec![primary, backup]);
        let got = gw.get_stock_quote("SPY").await.unwrap();
        assert!((got.last - 500.0).abs() < f64::EPSILON);
        assert_eq!(gw.fallback_count("primary->backup"), 0);
    }

    #[tokio::test]
    async fn failover_advances_and_counts() {
        let primary = Arc::new(StaticProvider::named("primary"));
        primary.set_failing(true);
        let backup = Arc::new(StaticProvider::named("backup"));
        backup.set_stock(quote("SPY", 500.0));

        let gw = gateway(vec![primary, backup]);
        let got = gw.get_stock_quote("SPY").await.unwrap();
        assert!((got.last - 500.0).abs() < f64::EPSILON);
        assert_eq!(gw.fallback_count("primary->backup"), 1);
    }

    #[tokio::test]
    async fn recovered_primary_is_used_again() {
        let primary = Arc::new(StaticProvider::named("primary"));
        primary.set_stock(quote("SPY", 500.0));
        primary.set_failing(true);
        let backup = Arc::new(StaticProvider::named("backup"));
        backup.set_stock(quote("SPY", 400.0));

        let gw = gateway(vec![primary.clone(), backup]);
        let via_backup = gw.get_stock_quote("SPY").await.unwrap();
        assert!((via_backup.last - 400.0).abs() < f64::EPSILON);

        // Primary recovers; the next (uncached) call starts from it again.
        primary.set_failing(false);
        gw.clear_cache();
        let via_primary = gw.get_stock_quote("SPY").await.unwrap();
        assert!((via_primary.last - 500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn all_no_data_is_nodata() {
        let a: Arc<dyn MarketDataProvider> = Arc::new(StaticProvider::named("a"));
        let b: Arc<dyn MarketDataProvider> = Arc::new(StaticProvider::named("b"));
        let gw = gateway(vec![a, b]);
        match gw.get_stock_quote("SPY").await {
            Err(EngineError::NoData { key }) => assert!(key.contains("SPY")),
            other => panic!("expected NoData, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_errors_is_transport_failure() {
        let a = Arc::new(StaticProvider::named("a"));
        a.set_failing(true);
        let b = Arc::new(StaticProvider::named("b"));
        b.set_failing(true);
        let gw = gateway(vec![a, b]);
        match gw.get_stock_quote("SPY").await {
            Err(EngineError::TransportFailure { key, .. }) => assert!(key.contains("SPY")),
            other => panic!("expected TransportFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mixed_error_and_no_data_is_nodata() {
        let a = Arc::new(StaticProvider::named("a"));
        a.set_failing(true);
        let b = Arc::new(StaticProvider::named("b")); // clean, but empty
        let gw = gateway(vec![a, b]);
        assert!(matches!(
            gw.get_stock_quote("SPY").await,
            Err(EngineError::NoData { .. })
        ));
    }

    #[tokio::test]
    async fn cache_hit_skips_providers() {
        let primary = Arc::new(StaticProvider::named("primary"));
        primary.set_stock(quote("SPY", 500.0));
        let gw = gateway(vec![primary.clone()]);
        gw.get_stock_quote("SPY").await.unwrap();

        // Break the provider; the cached quote still answers.
        primary.set_failing(true);
        let got = gw.get_stock_quote("SPY").await.unwrap();
        assert!((got.last - 500.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn historical_absence_is_cached_ok_none() {
        let a: Arc<dyn MarketDataProvider> = Arc::new(StaticProvider::named("a"));
        let gw = gateway(vec![a]);
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let got = gw
            .get_historical_option_quote("SPY250620C00500000", date)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn no_providers_is_config_error() {
        let gw = gateway(vec![]);
        assert!(matches!(
            gw.get_stock_quote("SPY").await,
            Err(EngineError::Config(_))
        ));
    }
}
