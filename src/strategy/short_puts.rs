//! Cash-secured short puts.
//!
//! Scans the option chain for a put in the configured DTE window with
//! |delta| nearest the target, gated on IV rank, and creates an STO play
//! sized against the risk gate's capital allocation. Open positions roll
//! when DTE falls to the configured threshold and no exit is firing.

use async_trait::async_trait;

use super::{helpers, CycleCtx, Strategy};
use crate::engine::executor::select_roll_target;
use crate::engine::{evaluate, Decision, EvalSnapshot};
use crate::error::Result;
use crate::market::{ChainEntry, OptionSide};
use crate::play::{
    EntrySpec, OrderPolicy, Play, PlayState, PositionSide, PriceReference, StopLossSpec,
    TakeProfitSpec,
};

const DEFAULT_DTE_MIN: i64 = 35;
const DEFAULT_DTE_MAX: i64 = 49;
const DEFAULT_DELTA_TARGET: f64 = 0.30;
const DEFAULT_IV_RANK_MIN: f64 = 0.50;
const DEFAULT_ROLL_DTE: i64 = 21;
const DEFAULT_PROFIT_TARGET_PCT: f64 = 0.50;
const DEFAULT_STOP_LOSS_PCT: f64 = 2.0;

pub struct ShortPutsStrategy;

#[derive(Debug, Clone, Copy)]
struct Params {
    dte_min: i64,
    dte_max: i64,
    delta_target: f64,
    iv_rank_min: f64,
    roll_dte: i64,
    profit_target_pct: f64,
    stop_loss_pct: f64,
    contracts: u32,
}

impl Params {
    fn from_config(ctx: &CycleCtx) -> (Params, String) {
        let cfg = ctx.config.strategy("short_puts");
        let symbol = cfg.default_symbol.clone().unwrap_or_else(|| "SPY".into());
        (
            Params {
                dte_min: cfg.dte_min.unwrap_or(DEFAULT_DTE_MIN),
                dte_max: cfg.dte_max.unwrap_or(DEFAULT_DTE_MAX),
                delta_target: cfg.delta_target.unwrap_or(DEFAULT_DELTA_TARGET),
                iv_rank_min: cfg.iv_rank_min.unwrap_or(DEFAULT_IV_RANK_MIN),
                roll_dte: cfg.roll_dte.unwrap_or(DEFAULT_ROLL_DTE),
                profit_target_pct: cfg.profit_target_pct.unwrap_or(DEFAULT_PROFIT_TARGET_PCT),
                stop_loss_pct: cfg.stop_loss_pct.unwrap_or(DEFAULT_STOP_LOSS_PCT),
                contracts: cfg.contracts.unwrap_or(1),
            },
            symbol,
        )
    }
}

impl ShortPutsStrategy {
    /// Candidate put: same selection the roll path uses, restricted to puts.
    fn select_candidate<'a>(
        ctx: &CycleCtx,
        entries: &'a [ChainEntry],
        params: &Params,
    ) -> Option<&'a ChainEntry> {
        entries
            .iter()
            .filter(|e| e.side == OptionSide::Put)
            .filter(|e| {
                let dte = ctx.clock.days_to_expiration(e.expiration);
                dte >= params.dte_min && dte <= params.dte_max
            })
            .filter(|e| e.bid > 0.0 && e.delta.is_some())
            .min_by(|a, b| {
                let da = (a.delta.unwrap_or(0.0).abs() - params.delta_target).abs();
                let db = (b.delta.unwrap_or(0.0).abs() - params.delta_target).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    fn build_play(symbol: &str, candidate: &ChainEntry, params: &Params) -> Play {
        let mut play = Play::new(
            &format!("csp-{symbol}-{}", candidate.expiration.format("%y%m%d")),
            "short_puts",
            symbol,
            OptionSide::Put,
            candidate.strike,
            candidate.expiration,
            PositionSide::Short,
            params.contracts,
            EntrySpec {
                target_stock_price: candidate.strike,
                reference: PriceReference::Last,
                // Premium selling keys on the chain scan, not a stock level;
                // a wide buffer makes the entry fire on the next session tick.
                buffer: candidate.strike,
                order_policy: OrderPolicy::LimitAtBid,
            },
        );
        play.creator = "short-puts-scanner".to_string();
        play.take_profit = TakeProfitSpec {
            premium_pct: Some(params.profit_target_pct),
            ..TakeProfitSpec::default()
        };
        play.stop_loss = StopLossSpec {
            premium_pct: Some(params.stop_loss_pct),
            ..StopLossSpec::default()
        };
        play
    }

    async fn maybe_create(&self, ctx: &CycleCtx) -> Result<()> {
        let (params, symbol) = Params::from_config(ctx);

        if helpers::has_active_play(ctx, self.tag(), &symbol)? {
            return Ok(());
        }

        let chain = ctx.market.get_option_chain(&symbol, None).await?;

        // IV-rank gate. A chain without a rank is skipped conservatively.
        match chain.iv_rank {
            Some(rank) if rank >= params.iv_rank_min => {}
            Some(rank) => {
                tracing::debug!(%symbol, rank, min = params.iv_rank_min, "iv rank below threshold");
                return Ok(());
            }
            None => {
                tracing::debug!(%symbol, "no iv rank on chain; skipping entry scan");
                return Ok(());
            }
        }

        let Some(candidate) = Self::select_candidate(ctx, &chain.entries, &params) else {
            tracing::debug!(%symbol, "no contract in the dte/delta window");
            return Ok(());
        };

        let play = Self::build_play(&symbol, candidate, &params);
        play.validate_record()?;
        ctx.store.save(&play)?;
        tracing::info!(
            play_id = %play.id,
            contract = %candidate.occ_symbol,
            delta = ?candidate.delta,
            "short put candidate created"
        );
        Ok(())
    }

    /// Roll management: at or under the roll DTE, with no exit firing this
    /// cycle, buy back and re-sell at the target window.
    async fn maybe_roll(&self, ctx: &CycleCtx, play: &mut Play) -> Result<bool> {
        let (params, _) = Params::from_config(ctx);
        let dte = ctx.clock.days_to_expiration(play.instrument.expiration);
        if dte > params.roll_dte {
            return Ok(false);
        }

        // An exit decision outranks the roll.
        let (stock, option) = helpers::quotes_for(ctx, play, "roll").await?;
        let decision = evaluate(&EvalSnapshot {
            play,
            stock: &stock,
            option: option.as_ref(),
            clock: &ctx.clock,
        });
        if !matches!(decision, Decision::Wait) {
            return Ok(false);
        }

        let chain = ctx
            .market
            .get_option_chain(&play.instrument.symbol, None)
            .await?;
        if let Some(rank) = chain.iv_rank {
            if rank < params.iv_rank_min {
                tracing::debug!(play_id = %play.id, rank, "iv rank too low to roll; holding");
                return Ok(false);
            }
        }
        let Some(target) = select_roll_target(
            &chain.entries,
            play,
            &ctx.clock,
            params.dte_min,
            params.dte_max,
            params.delta_target,
        ) else {
            tracing::warn!(play_id = %play.id, "no roll target in window; holding");
            return Ok(false);
        };
        let target = target.clone();

        ctx.executor.roll_short(play, &target).await?;
        Ok(true)
    }
}

#[async_trait]
impl Strategy for ShortPutsStrategy {
    fn tag(&self) -> &'static str {
        "short_puts"
    }

    async fn on_cycle_start(&self, ctx: &CycleCtx) -> Result<()> {
        if !ctx.clock.is_primary_session() {
            return Ok(());
        }
        self.maybe_create(ctx).await
    }

    async fn evaluate_open_plays(&self, ctx: &CycleCtx) -> Result<()> {
        // Rolls first; a play that rolled stays OPEN on the new contract and
        // is simply re-evaluated (against the fresh credit) below.
        for mut play in helpers::owned_plays(ctx, PlayState::Open, self.tag())? {
            let id = play.id.clone();
            if let Err(e) = self.maybe_roll(ctx, &mut play).await {
                helpers::absorb(&id, Err(e))?;
            }
        }
        helpers::process_open_plays(ctx, self.tag()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn params() -> Params {
        Params {
            dte_min: DEFAULT_DTE_MIN,
            dte_max: DEFAULT_DTE_MAX,
            delta_target: DEFAULT_DELTA_TARGET,
            iv_rank_min: DEFAULT_IV_RANK_MIN,
            roll_dte: DEFAULT_ROLL_DTE,
            profit_target_pct: DEFAULT_PROFIT_TARGET_PCT,
            stop_loss_pct: DEFAULT_STOP_LOSS_PCT,
            contracts: 1,
        }
    }

    fn entry(side: OptionSide, strike: f64, delta: f64, exp: NaiveDate) -> ChainEntry {
        ChainEntry {
            occ_symbol: crate::play::occ::format("SPY", exp, side, strike),
            side,
            strike,
            expiration: exp,
            bid: 2.40,
            ask: 2.60,
            last: 2.50,
            delta: Some(delta),
            implied_volatility: Some(0.2),
            open_interest: Some(500),
            volume: Some(50),
        }
    }

    #[test]
    fn built_play_is_valid_short() {
        let exp = NaiveDate::from_ymd_opt(2025, 7, 18).unwrap();
        let candidate = entry(OptionSide::Put, 480.0, -0.31, exp);
        let play = ShortPutsStrategy::build_play("SPY", &candidate, &params());
        play.validate_record().unwrap();
        assert_eq!(play.position_side, PositionSide::Short);
        assert_eq!(
            play.order_action,
            crate::play::OrderAction::SellToOpen
        );
        assert_eq!(play.take_profit.premium_pct, Some(0.50));
        assert_eq!(play.stop_loss.premium_pct, Some(2.0));
    }

    #[test]
    fn built_play_targets_resolve_correct_sides() {
        // After a 2.50 credit fill, TP=1.25 (< credit) and SL=7.50 (> credit).
        let exp = NaiveDate::from_ymd_opt(2025, 7, 18).unwrap();
        let candidate = entry(OptionSide::Put, 480.0, -0.31, exp);
        let mut play = ShortPutsStrategy::build_play("SPY", &candidate, &params());
        play.fills.entry_premium = Some(2.50);
        // Mirror of the executor's fill-time resolution.
        play.take_profit.premium = Some(2.50 * (1.0 - 0.50));
        play.stop_loss.premium = Some(2.50 * (1.0 + 2.0));
        play.state = PlayState::Open;
        play.validate_record().unwrap();
    }
}
