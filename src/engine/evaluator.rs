//! Condition evaluation.
//!
//! Pure decision function: given a play, the current quotes, and the clock,
//! return `Wait`, `EnterNow`, or `ExitNow`. Exceptions never drive control
//! flow here — errors stay on the out-of-band channel and the decision is a
//! plain value the executor acts on.
//!
//! Exit triggers are evaluated in fixed order: OptionExpired, then
//! contingency stop, then stop-loss, then take-profit. The first hit wins;
//! one cycle never fires more than one decision per play.

use crate::broker::{OrderRequest, OrderType};
use crate::clock::MarketClock;
use crate::market::{OptionQuote, StockQuote};
use crate::play::{
    OrderPolicy, Play, PlayState, PositionSide, PriceReference, StopLossMode, TakeProfitMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    ContingencyStopLoss,
    OptionExpired,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::ContingencyStopLoss => "contingency_stop_loss",
            ExitReason::OptionExpired => "option_expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Wait,
    EnterNow(OrderRequest),
    ExitNow {
        reason: ExitReason,
        request: OrderRequest,
    },
}

/// Snapshot handed to the evaluator. The option quote may be missing when
/// every provider came up empty; entry decisions then wait, and exits fall
/// back to stock-price and expiration triggers only.
pub struct EvalSnapshot<'a> {
    pub play: &'a Play,
    pub stock: &'a StockQuote,
    pub option: Option<&'a OptionQuote>,
    pub clock: &'a MarketClock,
}

pub fn evaluate(snap: &EvalSnapshot<'_>) -> Decision {
    match snap.play.state {
        PlayState::New => evaluate_entry(snap),
        PlayState::Open => evaluate_exit(snap),
        _ => Decision::Wait,
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

fn reference_price(stock: &StockQuote, reference: PriceReference) -> f64 {
    match reference {
        PriceReference::Last => stock.last,
        PriceReference::Bid => stock.bid,
        PriceReference::Ask => stock.ask,
        PriceReference::Mid => stock.mid(),
    }
}

fn evaluate_entry(snap: &EvalSnapshot<'_>) -> Decision {
    let play = snap.play;

    // Expired contracts are dead paper; never enter.
    if snap.clock.days_to_expiration(play.instrument.expiration) < 0 {
        return Decision::Wait;
    }
    if !snap.clock.is_primary_session() {
        return Decision::Wait;
    }

    let price = reference_price(snap.stock, play.entry.reference);
    // The buffer bound is inclusive on both sides.
    let lo = play.entry.target_stock_price - play.entry.buffer;
    let hi = play.entry.target_stock_price + play.entry.buffer;
    if price < lo || price > hi {
        return Decision::Wait;
    }

    // Entry pricing needs an option quote; without one this cycle waits.
    let Some(option) = snap.option else {
        return Decision::Wait;
    };

    let (order_type, limit_price) = Play::resolve_order_price(play.entry.order_policy, option);
    Decision::EnterNow(OrderRequest {
        occ_symbol: play.instrument.occ_symbol.clone(),
        side: play.opening_order_side(),
        qty: play.contracts,
        order_type,
        limit_price,
        tif: play.tif(),
    })
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

fn evaluate_exit(snap: &EvalSnapshot<'_>) -> Decision {
    let play = snap.play;

    // 1. Expiration outranks every other trigger.
    if snap.clock.days_to_expiration(play.instrument.expiration) <= 0 {
        return exit_market(snap, ExitReason::OptionExpired);
    }

    // Outside the session only time-based decisions apply.
    if !snap.clock.is_primary_session() {
        return Decision::Wait;
    }

    // 2. Contingency stop: looser stock level, market order, fires even when
    // the option quote is stale or missing.
    if let Some(contingency) = &play.stop_loss.contingency {
        let price = reference_price(snap.stock, contingency.reference);
        if stock_breached(play, price, contingency.stock_price, true) {
            return exit_market(snap, ExitReason::ContingencyStopLoss);
        }
    }

    // 3. Ordinary stop-loss.
    if stop_loss_hit(snap) {
        let request = match play.stop_loss.mode {
            // STOP and CONTINGENCY both force liquidity-taking exits.
            StopLossMode::Stop | StopLossMode::Contingency => market_exit_request(play),
            StopLossMode::Limit | StopLossMode::Trailing => limit_exit_request(snap),
        };
        return Decision::ExitNow {
            reason: ExitReason::StopLoss,
            request,
        };
    }

    // 4. Take-profit.
    if take_profit_hit(snap) {
        return Decision::ExitNow {
            reason: ExitReason::TakeProfit,
            request: limit_exit_request(snap),
        };
    }

    Decision::Wait
}

/// Stock-price trigger test. `adverse` is true for stop-style triggers
/// (level breached in the unfavorable direction), false for profit targets.
fn stock_breached(play: &Play, price: f64, level: f64, adverse: bool) -> bool {
    let favorable_up = play.stock_up_is_favorable();
    match (favorable_up, adverse) {
        // Favorable is up, watching for a drop through the level.
        (true, true) | (false, false) => price <= level,
        // Favorable is down, watching for a rise through the level.
        (false, true) | (true, false) => price >= level,
    }
}

/// Trailing levels tracked on premium retrace through the ratcheted level:
/// a LONG play sells into the bid, a SHORT play buys back at the ask.
fn premium_trail_hit(snap: &EvalSnapshot<'_>, level: f64) -> bool {
    let Some(option) = snap.option else {
        return false;
    };
    match snap.play.position_side {
        PositionSide::Long => option.bid <= level,
        PositionSide::Short => option.ask >= level,
    }
}

fn trailing_on_premium(spec: Option<&crate::play::TrailingSpec>) -> bool {
    spec.is_some_and(|t| t.on_premium)
}

fn stop_loss_hit(snap: &EvalSnapshot<'_>) -> bool {
    let play = snap.play;
    let sl = &play.stop_loss;

    // Trailing level, when armed, replaces the static stock trigger.
    if sl.mode == StopLossMode::Trailing {
        if let Some(level) = play.trail.sl_level {
            if trailing_on_premium(sl.trailing.as_ref()) {
                if premium_trail_hit(snap, level) {
                    return true;
                }
            } else {
                let price = reference_price(snap.stock, play.entry.reference);
                if stock_breached(play, price, level, true) {
                    return true;
                }
            }
        }
    } else if let Some(level) = sl.stock_price {
        let price = reference_price(snap.stock, play.entry.reference);
        if stock_breached(play, price, level, true) {
            return true;
        }
    }

    if let Some(target) = premium_target(play, sl.premium, sl.premium_pct, false) {
        if let Some(option) = snap.option {
            let hit = match play.position_side {
                // We lose when the market is offered down: compare the ask.
                PositionSide::Long => option.ask <= target,
                // Short premium hurts when buying back got expensive: the bid.
                PositionSide::Short => option.bid >= target,
            };
            if hit {
                return true;
            }
        }
    }
    false
}

fn take_profit_hit(snap: &EvalSnapshot<'_>) -> bool {
    let play = snap.play;
    let tp = &play.take_profit;

    if tp.mode == TakeProfitMode::Trailing {
        if let Some(level) = play.trail.tp_level {
            if trailing_on_premium(tp.trailing.as_ref()) {
                if premium_trail_hit(snap, level) {
                    return true;
                }
            } else {
                // A trailing target fires on the pull-back through the
                // ratcheted level, which is an adverse-direction cross.
                let price = reference_price(snap.stock, play.entry.reference);
                if stock_breached(play, price, level, true) {
                    return true;
                }
            }
        }
    } else if let Some(level) = tp.stock_price {
        let price = reference_price(snap.stock, play.entry.reference);
        if stock_breached(play, price, level, false) {
            return true;
        }
    }

    if let Some(target) = premium_target(play, tp.premium, tp.premium_pct, true) {
        if let Some(option) = snap.option {
            let hit = match play.position_side {
                // We must be able to sell at the target: compare the bid.
                PositionSide::Long => option.bid >= target,
                // Short premium wins when it is cheap to buy back: the ask.
                PositionSide::Short => option.ask <= target,
            };
            if hit {
                return true;
            }
        }
    }
    false
}

/// Absolute premium target, converting percent-of-entry configs against the
/// recorded entry premium/credit at evaluation time.
fn premium_target(
    play: &Play,
    absolute: Option<f64>,
    percent: Option<f64>,
    is_take_profit: bool,
) -> Option<f64> {
    if absolute.is_some() {
        return absolute;
    }
    let pct = percent?;
    let entry = play.entry_premium()?;
    let target = match (play.position_side, is_take_profit) {
        (PositionSide::Long, true) | (PositionSide::Short, false) => entry * (1.0 + pct),
        (PositionSide::Long, false) | (PositionSide::Short, true) => entry * (1.0 - pct),
    };
    Some(target.max(0.0))
}

fn market_exit_request(play: &Play) -> OrderRequest {
    OrderRequest {
        occ_symbol: play.instrument.occ_symbol.clone(),
        side: play.closing_order_side(),
        qty: play.held_contracts(),
        order_type: OrderType::Market,
        limit_price: None,
        tif: play.tif(),
    }
}

/// Limit exit priced at the conservative side: sells at the bid, buys at the
/// ask. Without an option quote the exit degrades to a market order.
fn limit_exit_request(snap: &EvalSnapshot<'_>) -> OrderRequest {
    let play = snap.play;
    let Some(option) = snap.option else {
        return market_exit_request(play);
    };
    let policy = match play.position_side {
        PositionSide::Long => OrderPolicy::LimitAtBid,
        PositionSide::Short => OrderPolicy::LimitAtAsk,
    };
    let (order_type, limit_price) = Play::resolve_order_price(policy, option);
    OrderRequest {
        occ_symbol: play.instrument.occ_symbol.clone(),
        side: play.closing_order_side(),
        qty: play.held_contracts(),
        order_type,
        limit_price,
        tif: play.tif(),
    }
}

fn exit_market(snap: &EvalSnapshot<'_>, reason: ExitReason) -> Decision {
    Decision::ExitNow {
        reason,
        request: market_exit_request(snap.play),
    }
}
