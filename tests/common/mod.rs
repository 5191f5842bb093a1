#![allow(dead_code)]

//! Shared fixtures: a temp data root, a scriptable market, a simulated
//! brokerage, and a fully wired `CycleCtx` pinned to a fixed in-session
//! clock (Tuesday 2025-06-10, 11:00 New York unless stated otherwise).

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;

use optioneer::broker::sim::SimBrokerage;
use optioneer::clock::MarketClock;
use optioneer::config::Config;
use optioneer::engine::{OrderExecutor, RiskGate, TrailingManager};
use optioneer::market::{
    ChainEntry, MarketDataGateway, MarketDataProvider, OptionChain, OptionQuote, OptionSide,
    StaticProvider, StockQuote,
};
use optioneer::play::store::PlayStore;
use optioneer::play::{occ, EntrySpec, OrderPolicy, Play, PositionSide, PriceReference};
use optioneer::strategy::CycleCtx;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub provider: Arc<StaticProvider>,
    pub broker: Arc<SimBrokerage>,
    pub ctx: Arc<CycleCtx>,
}

/// 11:00 New York on the given date, as a fixed clock.
pub fn session_clock(y: i32, m: u32, d: u32) -> MarketClock {
    let local = New_York.with_ymd_and_hms(y, m, d, 11, 0, 0).single().unwrap();
    MarketClock::fixed(New_York, local.with_timezone(&Utc))
}

pub fn after_close_clock(y: i32, m: u32, d: u32) -> MarketClock {
    let local = New_York.with_ymd_and_hms(y, m, d, 16, 30, 0).single().unwrap();
    MarketClock::fixed(New_York, local.with_timezone(&Utc))
}

pub fn harness_with(config_toml: &str, clock: MarketClock) -> Harness {
    harness_full(config_toml, clock, false)
}

pub fn harness_full(config_toml: &str, clock: MarketClock, dry_run: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::from_str(config_toml).unwrap());

    let provider = Arc::new(StaticProvider::named("primary"));
    let providers: Vec<Arc<dyn MarketDataProvider>> = vec![provider.clone()];
    let market = Arc::new(MarketDataGateway::new(providers, clock.clone()));

    let broker = Arc::new(SimBrokerage::default());
    let store = Arc::new(PlayStore::open(dir.path()).unwrap());
    let executor = Arc::new(OrderExecutor::new(
        broker.clone(),
        market.clone(),
        store.clone(),
        RiskGate::default(),
        clock.clone(),
        dry_run,
    ));
    let trailing = Arc::new(TrailingManager::new(market.clone()));

    let ctx = Arc::new(CycleCtx::new(
        config, store, market, broker.clone(), executor, trailing, clock,
    ));
    Harness {
        dir,
        provider,
        broker,
        ctx,
    }
}

pub fn swings_harness() -> Harness {
    harness_with(
        "[strategies.swings]\nenabled = true\n",
        session_clock(2025, 6, 10),
    )
}

pub fn set_stock(provider: &StaticProvider, symbol: &str, last: f64) {
    provider.set_stock(StockQuote {
        symbol: symbol.into(),
        bid: last - 0.05,
        ask: last + 0.05,
        last,
        timestamp: Utc::now(),
    });
}

pub fn set_option(provider: &StaticProvider, occ_symbol: &str, bid: f64, ask: f64) {
    provider.set_option(OptionQuote {
        occ_symbol: occ_symbol.into(),
        bid,
        ask,
        last: (bid + ask) / 2.0,
        implied_volatility: Some(0.18),
        greeks: Some(optioneer::market::Greeks {
            delta: 0.52,
            gamma: 0.03,
            theta: -0.05,
            vega: 0.11,
            rho: 0.02,
        }),
        timestamp: Utc::now(),
    });
}

/// Reference long call: SPY 2025-06-20 500 C, BTO 1 contract, entry target
/// 500.00 ± 0.50 limit @ ask, TP premium 3.00, SL premium 1.00.
pub fn spy_500_call_play() -> Play {
    let mut play = Play::new(
        "spy-500c",
        "swings",
        "SPY",
        OptionSide::Call,
        500.0,
        NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
        PositionSide::Long,
        1,
        EntrySpec {
            target_stock_price: 500.0,
            reference: PriceReference::Last,
            buffer: 0.50,
            order_policy: OrderPolicy::LimitAtAsk,
        },
    );
    play.take_profit.premium = Some(3.00);
    play.stop_loss.premium = Some(1.00);
    play
}

pub fn spy_call_occ() -> String {
    occ::format(
        "SPY",
        NaiveDate::from_ymd_opt(2025, 6, 20).unwrap(),
        OptionSide::Call,
        500.0,
    )
}

pub fn put_chain_entry(strike: f64, delta: f64, exp: NaiveDate, bid: f64, ask: f64) -> ChainEntry {
    ChainEntry {
        occ_symbol: occ::format("SPY", exp, OptionSide::Put, strike),
        side: OptionSide::Put,
        strike,
        expiration: exp,
        bid,
        ask,
        last: (bid + ask) / 2.0,
        delta: Some(delta),
        implied_volatility: Some(0.22),
        open_interest: Some(1_000),
        volume: Some(120),
    }
}

pub fn spy_put_chain(iv_rank: f64, entries: Vec<ChainEntry>) -> OptionChain {
    OptionChain {
        underlying: "SPY".into(),
        iv_rank: Some(iv_rank),
        entries,
    }
}
