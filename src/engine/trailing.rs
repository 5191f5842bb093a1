//! Trailing level maintenance.
//!
//! Runs ahead of the condition evaluator for every trailing-enabled OPEN
//! play. Updates the peak-favorable watermark, derives the proposed trail
//! level (percent, fixed, or ATR distance off the peak), and ratchets: the
//! stored level only ever moves in the favorable direction. Trail updates
//! never fire exits themselves; they set the level the evaluator reads on
//! the same cycle.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::market::MarketDataGateway;
use crate::play::{Play, PositionSide, TrailPoint, TrailType, TrailingSpec};

const ATR_LOOKBACK_PAD: u32 = 10;

pub struct TrailingManager {
    market: Arc<MarketDataGateway>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrailSlot {
    TakeProfit,
    StopLoss,
}

impl TrailingManager {
    pub fn new(market: Arc<MarketDataGateway>) -> Self {
        Self { market }
    }

    /// Update watermark and trail levels for one play. Returns true when a
    /// stored level changed (the caller persists the play).
    pub async fn update(&self, play: &mut Play) -> Result<bool> {
        let tp_spec = play.take_profit.trailing.clone();
        let sl_spec = play.stop_loss.trailing.clone();
        if tp_spec.is_none() && sl_spec.is_none() {
            return Ok(false);
        }

        // Both slots share one watermark; premium tracking applies when any
        // configured slot asks for it (SHORT plays typically do).
        let on_premium = tp_spec.as_ref().is_some_and(|t| t.on_premium)
            || sl_spec.as_ref().is_some_and(|t| t.on_premium);

        let current = if on_premium {
            let quote = self
                .market
                .get_option_quote(&play.instrument.occ_symbol)
                .await?;
            match play.position_side {
                PositionSide::Long => quote.bid,
                PositionSide::Short => quote.ask,
            }
        } else {
            self.market
                .get_stock_quote(&play.instrument.symbol)
                .await?
                .last
        };

        let favorable_up = if on_premium {
            // Premium peaks: LONG wants premium up, SHORT wants it down.
            play.position_side == PositionSide::Long
        } else {
            play.stock_up_is_favorable()
        };

        let peak_moved = update_peak(play, current, favorable_up);

        let mut changed = peak_moved;
        if let Some(spec) = tp_spec {
            changed |= self
                .update_slot(play, &spec, TrailSlot::TakeProfit, favorable_up, on_premium)
                .await?;
        }
        if let Some(spec) = sl_spec {
            changed |= self
                .update_slot(play, &spec, TrailSlot::StopLoss, favorable_up, on_premium)
                .await?;
        }
        Ok(changed)
    }

    async fn update_slot(
        &self,
        play: &mut Play,
        spec: &TrailingSpec,
        slot: TrailSlot,
        favorable_up: bool,
        on_premium: bool,
    ) -> Result<bool> {
        let Some(peak) = play.trail.peak else {
            return Ok(false);
        };

        if !activation_reached(play, spec, peak, favorable_up, on_premium) {
            return Ok(false);
        }

        let distance = match spec.trail_type {
            TrailType::Percent => spec.percent.map(|pct| peak * pct),
            TrailType::Fixed => spec.amount,
            TrailType::Atr => self.atr_distance(play, spec).await?,
        };
        let Some(distance) = distance else {
            return Ok(false);
        };

        // The trail sits `distance` behind the peak, on the giving-back side.
        let mut proposed = if favorable_up {
            peak - distance
        } else {
            peak + distance
        };

        // Optional floor: never surrender more than min_lock of the move
        // from the entry-time base.
        if let (Some(min_lock), Some(base)) = (spec.min_lock_pct, trail_base(play, on_premium)) {
            let locked = base + (peak - base) * min_lock;
            proposed = if favorable_up {
                proposed.max(locked)
            } else {
                proposed.min(locked)
            };
        }

        let stored = match slot {
            TrailSlot::TakeProfit => play.trail.tp_level,
            TrailSlot::StopLoss => play.trail.sl_level,
        };

        // Ratchet: the level never moves away from the peak.
        let improved = match stored {
            None => true,
            Some(level) => {
                if favorable_up {
                    proposed > level
                } else {
                    proposed < level
                }
            }
        };
        if !improved {
            return Ok(false);
        }
        // Skip sub-tick noise.
        if let Some(level) = stored {
            if (proposed - level).abs() < spec.min_tick {
                return Ok(false);
            }
        }

        match slot {
            TrailSlot::TakeProfit => play.trail.tp_level = Some(proposed),
            TrailSlot::StopLoss => play.trail.sl_level = Some(proposed),
        }
        play.trail.history.push(TrailPoint {
            at: Utc::now(),
            peak,
            level: proposed,
        });
        tracing::debug!(
            play_id = %play.id,
            ?slot,
            peak,
            level = proposed,
            "trail level ratcheted"
        );
        Ok(true)
    }

    async fn atr_distance(&self, play: &Play, spec: &TrailingSpec) -> Result<Option<f64>> {
        let (Some(period), Some(multiplier)) = (spec.atr_period, spec.atr_multiplier) else {
            return Ok(None);
        };
        let lookback = period as u32 + ATR_LOOKBACK_PAD;
        let candles = self
            .market
            .get_daily_candles(&play.instrument.symbol, lookback)
            .await?;
        if candles.len() < period {
            return Ok(None);
        }
        let window = &candles[candles.len() - period..];
        let close: Vec<f64> = window.iter().map(|c| c.close).collect();
        let high: Vec<f64> = window.iter().map(|c| c.high).collect();
        let low: Vec<f64> = window.iter().map(|c| c.low).collect();
        let atr = rust_ti::other_indicators::single::average_true_range(
            &close,
            &high,
            &low,
            rust_ti::ConstantModelType::SimpleMovingAverage,
        );
        Ok(Some(atr * multiplier))
    }
}

/// Advance the peak watermark when `current` is more favorable. Seeds the
/// watermark on first sight.
fn update_peak(play: &mut Play, current: f64, favorable_up: bool) -> bool {
    let better = match play.trail.peak {
        None => true,
        Some(peak) => {
            if favorable_up {
                current > peak
            } else {
                current < peak
            }
        }
    };
    if better {
        play.trail.peak = Some(current);
    }
    better
}

/// Profit since entry, measured against the trailing base, must reach the
/// activation threshold before any level is written.
fn activation_reached(
    play: &Play,
    spec: &TrailingSpec,
    peak: f64,
    favorable_up: bool,
    on_premium: bool,
) -> bool {
    if spec.activation_pct <= 0.0 {
        return true;
    }
    let Some(base) = trail_base(play, on_premium) else {
        return false;
    };
    if base <= 0.0 {
        return false;
    }
    let gain = if favorable_up {
        (peak - base) / base
    } else {
        (base - peak) / base
    };
    gain >= spec.activation_pct
}

/// The entry-time reference the activation and min-lock math anchors on:
/// premium at fill for premium trails, stock price at open otherwise.
fn trail_base(play: &Play, on_premium: bool) -> Option<f64> {
    if on_premium {
        play.fills.entry_premium
    } else {
        play.audit.open_stock_price
    }
}
