//! CLI command bodies.
//!
//! One file per subcommand, plus the shared bootstrap that wires config,
//! clock, market gateway, brokerage, store, and executor into a `CycleCtx`.

pub mod once;
pub mod run;
pub mod status;
pub mod validate;

use std::path::Path;
use std::sync::Arc;

use crate::broker::rest::RestBrokerage;
use crate::broker::sim::SimBrokerage;
use crate::broker::Brokerage;
use crate::clock::MarketClock;
use crate::config::{self, Config};
use crate::engine::{OrderExecutor, RiskGate, TrailingManager};
use crate::error::{EngineError, Result};
use crate::market::{MarketDataGateway, MarketDataProvider, RestProvider};
use crate::play::store::PlayStore;
use crate::strategy::CycleCtx;

/// Wire every service from config. `force_dry_run` is set by the `dry-run`
/// subcommand and overrides the config flag.
pub fn bootstrap(data_root: &Path, force_dry_run: bool) -> Result<Arc<CycleCtx>> {
    let config = Arc::new(Config::load_or_init(data_root)?);
    let dry_run = force_dry_run || config.orchestration.dry_run;

    let clock = MarketClock::new(config.market.tz()?, config.market.extended_hours);

    let mut providers: Vec<Arc<dyn MarketDataProvider>> = Vec::new();
    for provider_cfg in config.market_data.enabled_providers() {
        let provider = RestProvider::new(provider_cfg)
            .map_err(|e| EngineError::Config(format!("provider {}: {e}", provider_cfg.name)))?;
        providers.push(Arc::new(provider));
    }
    if providers.is_empty() {
        tracing::warn!("no market data providers enabled; quotes will be unavailable");
    }
    let market = Arc::new(MarketDataGateway::new(providers, clock.clone()));

    let broker = build_broker(&config, dry_run)?;

    let store = Arc::new(PlayStore::open(data_root)?);

    // Risk limits come from the short-premium strategy block; the gate's own
    // defaults apply where the config is silent.
    let short_cfg = config.strategy("short_puts");
    let defaults = RiskGate::default();
    let risk = RiskGate::new(
        short_cfg
            .max_notional_leverage
            .unwrap_or(defaults.max_notional_leverage),
        short_cfg
            .capital_allocation_pct
            .unwrap_or(defaults.max_capital_allocation),
    );

    let executor = Arc::new(OrderExecutor::new(
        Arc::clone(&broker),
        Arc::clone(&market),
        Arc::clone(&store),
        risk,
        clock.clone(),
        dry_run,
    ));
    let trailing = Arc::new(TrailingManager::new(Arc::clone(&market)));

    Ok(Arc::new(CycleCtx::new(
        config, store, market, broker, executor, trailing, clock,
    )))
}

fn build_broker(config: &Config, dry_run: bool) -> Result<Arc<dyn Brokerage>> {
    let Some(account) = config.broker.default_account() else {
        if dry_run {
            tracing::info!("no broker account configured; dry run uses the simulated brokerage");
            return Ok(Arc::new(SimBrokerage::default()));
        }
        return Err(EngineError::Config(
            "no broker account configured (broker.accounts is empty)".into(),
        ));
    };

    let brokerage = RestBrokerage::new(account)
        .map_err(|e| EngineError::BrokerAuth(format!("account {}: {e}", account.name)))?;

    // Paper by default. A live endpoint requires the explicit opt-in.
    if !brokerage.is_paper() && !config::live_trading_approved() {
        return Err(EngineError::Config(format!(
            "broker base_url {} is a live endpoint; set {}=yes to enable live trading",
            brokerage.base_url(),
            config::LIVE_TRADING_ENV,
        )));
    }
    if !brokerage.is_paper() {
        tracing::warn!(base_url = %brokerage.base_url(), "LIVE TRADING MODE - real money at risk");
    }

    Ok(Arc::new(brokerage))
}
