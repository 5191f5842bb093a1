//! Strategy runners.
//!
//! Every strategy implements the same small capability set and is registered
//! under a string tag; the orchestrator enumerates the registry and filters
//! by the per-strategy enable flag in config. Strategies are peers — the
//! shared mechanics of driving owned plays through the lifecycle live in the
//! `helpers` module, not in a parent class.

pub mod momentum;
pub mod short_puts;
pub mod spreads;
pub mod swings;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;

use crate::broker::Brokerage;
use crate::clock::MarketClock;
use crate::config::Config;
use crate::engine::{OrderExecutor, TrailingManager};
use crate::error::Result;
use crate::market::MarketDataGateway;
use crate::play::store::PlayStore;

/// Shared services handed to every runner each phase.
pub struct CycleCtx {
    pub config: Arc<Config>,
    pub store: Arc<PlayStore>,
    pub market: Arc<MarketDataGateway>,
    pub broker: Arc<dyn Brokerage>,
    pub executor: Arc<OrderExecutor>,
    pub trailing: Arc<TrailingManager>,
    pub clock: MarketClock,
    /// (symbol, phase) pairs already logged as no-data this cycle, so the
    /// condition is reported once rather than per play.
    nodata_logged: DashSet<String>,
}

impl CycleCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: Arc<PlayStore>,
        market: Arc<MarketDataGateway>,
        broker: Arc<dyn Brokerage>,
        executor: Arc<OrderExecutor>,
        trailing: Arc<TrailingManager>,
        clock: MarketClock,
    ) -> Self {
        Self {
            config,
            store,
            market,
            broker,
            executor,
            trailing,
            clock,
            nodata_logged: DashSet::new(),
        }
    }

    /// Reset per-cycle bookkeeping. The orchestrator calls this at the top
    /// of every tick.
    pub fn begin_cycle(&self) {
        self.nodata_logged.clear();
        self.market.begin_cycle();
    }

    pub(crate) fn log_nodata_once(&self, symbol: &str, phase: &str, error: &crate::error::EngineError) {
        let key = format!("{symbol}:{phase}");
        if self.nodata_logged.insert(key) {
            tracing::warn!(symbol, phase, error = %error, "market data unavailable");
        }
    }
}

/// The capability set every runner implements.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Registry tag; also the `strategy_tag` on owned plays.
    fn tag(&self) -> &'static str;

    /// One-time setup per tick.
    async fn on_cycle_start(&self, _ctx: &CycleCtx) -> Result<()> {
        Ok(())
    }

    /// Act on owned plays waiting to enter (NEW and PENDING_OPENING).
    async fn evaluate_new_plays(&self, ctx: &CycleCtx) -> Result<()> {
        helpers::process_new_plays(ctx, self.tag()).await
    }

    /// Act on owned live plays (OPEN and PENDING_CLOSING).
    async fn evaluate_open_plays(&self, ctx: &CycleCtx) -> Result<()> {
        helpers::process_open_plays(ctx, self.tag()).await
    }

    /// Flush and log at tick end.
    async fn on_cycle_end(&self, _ctx: &CycleCtx) -> Result<()> {
        Ok(())
    }
}

/// All built-in runners. Adding a strategy means implementing the
/// capability set and adding the constructor here.
pub fn all_strategies() -> Vec<Arc<dyn Strategy>> {
    vec![
        Arc::new(swings::SwingsStrategy),
        Arc::new(momentum::MomentumStrategy),
        Arc::new(short_puts::ShortPutsStrategy),
        Arc::new(spreads::SpreadsStrategy),
    ]
}

pub fn find_strategy(tag: &str) -> Option<Arc<dyn Strategy>> {
    all_strategies().into_iter().find(|s| s.tag() == tag)
}

// ---------------------------------------------------------------------------
// Shared lifecycle mechanics
// ---------------------------------------------------------------------------

pub mod helpers {
    use super::CycleCtx;
    use crate::engine::{evaluate, Decision, EvalSnapshot};
    use crate::error::{EngineError, Result};
    use crate::market::{OptionQuote, StockQuote};
    use crate::play::{Play, PlayState};

    /// Load the plays in `state` owned by `tag`, oldest id first.
    pub fn owned_plays(ctx: &CycleCtx, state: PlayState, tag: &str) -> Result<Vec<Play>> {
        Ok(ctx
            .store
            .snapshot(state)?
            .into_iter()
            .filter(|p| p.strategy_tag == tag)
            .collect())
    }

    /// Fetch the quote pair for a play. A missing option quote degrades to
    /// `None` (stock-only triggers still work); a missing stock quote is a
    /// real failure for this play.
    pub async fn quotes_for(
        ctx: &CycleCtx,
        play: &Play,
        phase: &str,
    ) -> Result<(StockQuote, Option<OptionQuote>)> {
        let stock = ctx
            .market
            .get_stock_quote(&play.instrument.symbol)
            .await
            .inspect_err(|e| ctx.log_nodata_once(&play.instrument.symbol, phase, e))?;
        let option = match ctx
            .market
            .get_option_quote(&play.instrument.occ_symbol)
            .await
        {
            Ok(quote) => Some(quote),
            Err(e @ (EngineError::NoData { .. } | EngineError::TransportFailure { .. })) => {
                ctx.log_nodata_once(&play.instrument.occ_symbol, phase, &e);
                None
            }
            Err(e) => return Err(e),
        };
        Ok((stock, option))
    }

    /// Per-play error boundary: one bad play cannot stop the cycle. Fatal
    /// errors propagate; everything else is logged and swallowed.
    pub fn absorb(play_id: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(play_id, error = %e, "play skipped this cycle");
                Ok(())
            }
        }
    }

    /// Drive NEW and PENDING_OPENING plays for one strategy.
    pub async fn process_new_plays(ctx: &CycleCtx, tag: &str) -> Result<()> {
        // In-flight entries first: their orders are oldest.
        for mut play in owned_plays(ctx, PlayState::PendingOpening, tag)? {
            let id = play.id.clone();
            absorb(&id, ctx.executor.poll_pending_open(&mut play).await)?;
        }

        for mut play in owned_plays(ctx, PlayState::New, tag)? {
            let id = play.id.clone();

            // An entry order id on a NEW play is a crash orphan; reconcile
            // instead of evaluating (and never resubmit).
            if play.order_ids.entry.is_some() {
                absorb(&id, ctx.executor.reconcile_orphan(&mut play).await)?;
                continue;
            }

            let result = try_enter(ctx, &mut play).await;
            absorb(&id, result)?;
        }
        Ok(())
    }

    async fn try_enter(ctx: &CycleCtx, play: &mut Play) -> Result<()> {
        let (stock, option) = quotes_for(ctx, play, "entry").await?;
        let decision = evaluate(&EvalSnapshot {
            play,
            stock: &stock,
            option: option.as_ref(),
            clock: &ctx.clock,
        });
        match decision {
            Decision::EnterNow(request) => ctx.executor.open_position(play, &request).await,
            _ => Ok(()),
        }
    }

    /// Drive OPEN and PENDING_CLOSING plays for one strategy.
    pub async fn process_open_plays(ctx: &CycleCtx, tag: &str) -> Result<()> {
        for mut play in owned_plays(ctx, PlayState::PendingClosing, tag)? {
            let id = play.id.clone();
            absorb(&id, ctx.executor.poll_pending_close(&mut play).await)?;
        }

        for mut play in owned_plays(ctx, PlayState::Open, tag)? {
            let id = play.id.clone();
            let result = try_exit(ctx, &mut play).await;
            absorb(&id, result)?;
        }
        Ok(())
    }

    async fn try_exit(ctx: &CycleCtx, play: &mut Play) -> Result<()> {
        // Trailing levels move first so the evaluator reads fresh ratchets
        // on the same cycle.
        match ctx.trailing.update(play).await {
            Ok(true) => ctx.store.save(play)?,
            Ok(false) => {}
            Err(e) => tracing::warn!(play_id = %play.id, error = %e, "trail update skipped"),
        }

        let (stock, option) = quotes_for(ctx, play, "exit").await?;
        let decision = evaluate(&EvalSnapshot {
            play,
            stock: &stock,
            option: option.as_ref(),
            clock: &ctx.clock,
        });
        match decision {
            Decision::ExitNow { reason, request } => {
                ctx.executor.close_position(play, reason, &request).await
            }
            _ => Ok(()),
        }
    }

    /// True when the strategy already has a non-terminal play for `symbol`.
    pub fn has_active_play(ctx: &CycleCtx, tag: &str, symbol: &str) -> Result<bool> {
        for state in [
            PlayState::New,
            PlayState::PendingOpening,
            PlayState::Open,
            PlayState::PendingClosing,
        ] {
            let any = owned_plays(ctx, state, tag)?
                .iter()
                .any(|p| p.instrument.symbol.eq_ignore_ascii_case(symbol));
            if any {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
