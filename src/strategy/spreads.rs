//! Vertical credit spreads.
//!
//! Two-leg put verticals that honor the same lifecycle as every other play:
//! the record carries the short leg as its instrument, the long (hedge) leg
//! is preserved on the play, and the order is a compound net-credit limit.
//! Leg-level bookkeeping beyond the shared lifecycle stays out of scope.

use async_trait::async_trait;

use super::{helpers, CycleCtx, Strategy};
use crate::error::Result;
use crate::market::{ChainEntry, OptionSide};
use crate::play::{
    EntrySpec, OrderPolicy, Play, PositionSide, PriceReference, StopLossSpec, TakeProfitSpec,
};

const DEFAULT_WIDTH: f64 = 5.0;
const DEFAULT_DELTA_TARGET: f64 = 0.30;
const DEFAULT_DTE_MIN: i64 = 35;
const DEFAULT_DTE_MAX: i64 = 49;
const DEFAULT_PROFIT_TARGET_PCT: f64 = 0.50;

pub struct SpreadsStrategy;

impl SpreadsStrategy {
    /// Pair a short put near the delta target with a long put `width` lower.
    fn select_legs<'a>(
        ctx: &CycleCtx,
        entries: &'a [ChainEntry],
        delta_target: f64,
        width: f64,
        dte_min: i64,
        dte_max: i64,
    ) -> Option<(&'a ChainEntry, &'a ChainEntry)> {
        let short = entries
            .iter()
            .filter(|e| e.side == OptionSide::Put)
            .filter(|e| {
                let dte = ctx.clock.days_to_expiration(e.expiration);
                dte >= dte_min && dte <= dte_max
            })
            .filter(|e| e.bid > 0.0 && e.delta.is_some())
            .min_by(|a, b| {
                let da = (a.delta.unwrap_or(0.0).abs() - delta_target).abs();
                let db = (b.delta.unwrap_or(0.0).abs() - delta_target).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })?;

        let hedge_strike = short.strike - width;
        let long = entries
            .iter()
            .filter(|e| e.side == OptionSide::Put)
            .filter(|e| e.expiration == short.expiration)
            .min_by(|a, b| {
                let da = (a.strike - hedge_strike).abs();
                let db = (b.strike - hedge_strike).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })?;
        if (long.strike - short.strike).abs() < f64::EPSILON {
            return None;
        }
        Some((short, long))
    }

    fn build_play(
        symbol: &str,
        short: &ChainEntry,
        long: &ChainEntry,
        contracts: u32,
        profit_target_pct: f64,
    ) -> Play {
        let mut play = Play::new(
            &format!(
                "put-vertical-{symbol}-{}",
                short.expiration.format("%y%m%d")
            ),
            "spreads",
            symbol,
            OptionSide::Put,
            short.strike,
            short.expiration,
            PositionSide::Short,
            contracts,
            EntrySpec {
                target_stock_price: short.strike,
                reference: PriceReference::Last,
                buffer: short.strike,
                order_policy: OrderPolicy::LimitAtBid,
            },
        );
        play.creator = "spreads-scanner".to_string();
        play.take_profit = TakeProfitSpec {
            premium_pct: Some(profit_target_pct),
            ..TakeProfitSpec::default()
        };
        play.stop_loss = StopLossSpec::default();
        // The hedge leg rides on the record; the executor prices the
        // compound order net of it.
        play.extra.insert(
            "hedge_leg".into(),
            serde_json::json!({
                "occ_symbol": long.occ_symbol,
                "strike": long.strike,
                "ask": long.ask,
            }),
        );
        play
    }
}

#[async_trait]
impl Strategy for SpreadsStrategy {
    fn tag(&self) -> &'static str {
        "spreads"
    }

    async fn on_cycle_start(&self, ctx: &CycleCtx) -> Result<()> {
        if !ctx.clock.is_primary_session() {
            return Ok(());
        }
        let cfg = ctx.config.strategy(self.tag());
        let symbol = cfg.default_symbol.clone().unwrap_or_else(|| "SPY".into());
        if helpers::has_active_play(ctx, self.tag(), &symbol)? {
            return Ok(());
        }

        let chain = ctx.market.get_option_chain(&symbol, None).await?;
        let Some((short, long)) = Self::select_legs(
            ctx,
            &chain.entries,
            cfg.delta_target.unwrap_or(DEFAULT_DELTA_TARGET),
            cfg.spread_width.unwrap_or(DEFAULT_WIDTH),
            cfg.dte_min.unwrap_or(DEFAULT_DTE_MIN),
            cfg.dte_max.unwrap_or(DEFAULT_DTE_MAX),
        ) else {
            tracing::debug!(%symbol, "no spread legs in window");
            return Ok(());
        };

        let net_credit = short.bid - long.ask;
        if net_credit <= 0.0 {
            tracing::debug!(%symbol, "spread would not collect a credit; skipping");
            return Ok(());
        }

        let play = Self::build_play(
            &symbol,
            short,
            long,
            cfg.contracts.unwrap_or(1),
            cfg.profit_target_pct.unwrap_or(DEFAULT_PROFIT_TARGET_PCT),
        );
        play.validate_record()?;
        ctx.store.save(&play)?;
        tracing::info!(
            play_id = %play.id,
            short_leg = %short.occ_symbol,
            long_leg = %long.occ_symbol,
            net_credit,
            "put vertical created"
        );
        Ok(())
    }
}
