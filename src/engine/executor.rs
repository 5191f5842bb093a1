//! Order execution.
//!
//! Translates evaluator decisions into broker orders and drives plays
//! through the state machine. The ordering discipline is what makes crash
//! recovery safe:
//!
//! 1. the broker order id is written durably onto the play BEFORE the state
//!    transition, and
//! 2. a play holding an order id in a PENDING_* state is only ever polled,
//!    never resubmitted.
//!
//! A crash between submit and transition therefore leaves the play in its
//! prior state with the orphan id recorded; the reconciler picks it up on
//! the next tick and transitions according to the order's actual status.

use std::sync::Arc;

use chrono::Utc;

use super::evaluator::ExitReason;
use super::risk::RiskGate;
use crate::broker::{Brokerage, OrderRequest, OrderState, OrderStatus, OrderType, TimeInForce};
use crate::clock::MarketClock;
use crate::error::{EngineError, Result};
use crate::market::{ChainEntry, MarketDataGateway};
use crate::play::{Play, PlayState, PositionSide};
use crate::play::store::PlayStore;

const ROLL_POLL_ATTEMPTS: u32 = 10;
const ROLL_POLL_DELAY_MS: u64 = 500;

pub struct OrderExecutor {
    broker: Arc<dyn Brokerage>,
    market: Arc<MarketDataGateway>,
    store: Arc<PlayStore>,
    risk: RiskGate,
    clock: MarketClock,
    dry_run: bool,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        market: Arc<MarketDataGateway>,
        store: Arc<PlayStore>,
        risk: RiskGate,
        clock: MarketClock,
        dry_run: bool,
    ) -> Self {
        Self {
            broker,
            market,
            store,
            risk,
            clock,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    // -- open ---------------------------------------------------------------

    /// Execute an `EnterNow` decision: risk gate, submit, record the id
    /// durably, then NEW → PENDING_OPENING.
    pub async fn open_position(&self, play: &mut Play, request: &OrderRequest) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::New);

        if play.position_side == PositionSide::Short {
            let account = self.broker.get_account().await.map_err(EngineError::from)?;
            let open_book = self.store.snapshot(PlayState::Open)?;
            if let Err(refused) = self.risk.check_open(play, &account, &open_book) {
                play.audit.last_error = Some(refused.reason.clone());
                self.store.save(play)?;
                tracing::warn!(play_id = %play.id, reason = %refused.reason, "risk gate denied open");
                return Err(EngineError::RiskDenied {
                    reason: refused.reason,
                });
            }
        }

        if self.dry_run {
            tracing::info!(
                play_id = %play.id,
                symbol = %request.occ_symbol,
                qty = request.qty,
                order = ?request.order_type,
                limit = ?request.limit_price,
                "dry-run: would submit entry order"
            );
            return Ok(());
        }

        let order_id = self
            .broker
            .submit_order(request)
            .await
            .map_err(EngineError::from)?;

        // Durable record before the transition; see module docs.
        play.order_ids.entry = Some(order_id.clone());
        self.store.save(play)?;
        self.store.transition(play, PlayState::PendingOpening)?;
        tracing::info!(play_id = %play.id, order_id = %order_id, "entry order pending");
        Ok(())
    }

    /// Poll the outstanding entry order of a PENDING_OPENING play and
    /// transition on its terminal status.
    pub async fn poll_pending_open(&self, play: &mut Play) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::PendingOpening);
        let Some(order_id) = play.order_ids.entry.clone() else {
            return Err(EngineError::Integrity(format!(
                "play {} pending-opening without an entry order id",
                play.id
            )));
        };

        let order = self
            .broker
            .get_order(&order_id)
            .await
            .map_err(EngineError::from)?;

        match order.status {
            OrderStatus::Filled => self.complete_open(play, &order).await,
            OrderStatus::PartiallyFilled => {
                // Cancel-remainder policy applies at the end of the session:
                // keep what filled, drop the rest, and run with reduced size.
                if self.clock.is_past_session_close() {
                    let _ = self.broker.cancel_order(&order_id).await;
                    let order = self
                        .broker
                        .get_order(&order_id)
                        .await
                        .map_err(EngineError::from)?;
                    if order.filled_qty > 0 {
                        tracing::warn!(
                            play_id = %play.id,
                            filled = order.filled_qty,
                            wanted = play.contracts,
                            "partial fill at close; cancelled remainder"
                        );
                        self.complete_open(play, &order).await
                    } else {
                        self.expire_unfilled(play)
                    }
                } else {
                    Ok(())
                }
            }
            OrderStatus::Rejected => {
                let reason = order.reason.unwrap_or_else(|| "broker rejection".into());
                play.order_ids.entry = None;
                play.audit.last_error = Some(reason.clone());
                self.store.transition(play, PlayState::New)?;
                tracing::warn!(play_id = %play.id, reason = %reason, "entry rejected; play restored to new");
                Ok(())
            }
            OrderStatus::Expired | OrderStatus::Canceled => {
                // A cancel can race a partial fill; whatever filled is kept.
                if order.filled_qty > 0 {
                    self.complete_open(play, &order).await
                } else {
                    self.expire_unfilled(play)
                }
            }
            OrderStatus::New => Ok(()),
        }
    }

    async fn complete_open(&self, play: &mut Play, order: &OrderState) -> Result<()> {
        let fill_price = order.avg_fill_price.ok_or_else(|| {
            EngineError::BrokerUnavailable(format!(
                "order {} reported filled without a price",
                order.id
            ))
        })?;

        play.fills.entry_premium = Some(fill_price);
        if order.filled_qty > 0 && order.filled_qty < play.contracts {
            play.fills.entry_filled_qty = Some(order.filled_qty);
        }
        play.audit.opened_at = Some(Utc::now());

        // Best-effort context for the logging record; a missing quote or
        // greeks never blocks the fill.
        if let Ok(stock) = self.market.get_stock_quote(&play.instrument.symbol).await {
            play.audit.open_stock_price = Some(stock.last);
        }
        if let Ok(greeks) = self.market.get_greeks(&play.instrument.occ_symbol).await {
            play.audit.greeks_at_open = Some(greeks);
        }

        resolve_relative_targets(play);

        self.store.transition(play, PlayState::Open)?;
        tracing::info!(
            play_id = %play.id,
            premium = fill_price,
            qty = play.held_contracts(),
            "position open"
        );
        Ok(())
    }

    fn expire_unfilled(&self, play: &mut Play) -> Result<()> {
        play.audit.close_reason = Some("entry unfilled at session close".into());
        self.store.transition(play, PlayState::Expired)?;
        tracing::info!(play_id = %play.id, "entry day order expired unfilled");
        Ok(())
    }

    // -- close --------------------------------------------------------------

    /// Execute an `ExitNow` decision: submit the exit, record the id, then
    /// OPEN → PENDING_CLOSING.
    pub async fn close_position(
        &self,
        play: &mut Play,
        reason: ExitReason,
        request: &OrderRequest,
    ) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::Open);

        if self.dry_run {
            tracing::info!(
                play_id = %play.id,
                %reason,
                order = ?request.order_type,
                limit = ?request.limit_price,
                "dry-run: would submit exit order"
            );
            return Ok(());
        }

        let order_id = self
            .broker
            .submit_order(request)
            .await
            .map_err(EngineError::from)?;

        play.order_ids.exit = Some(order_id.clone());
        play.audit.close_reason = Some(reason.to_string());
        self.store.save(play)?;
        self.store.transition(play, PlayState::PendingClosing)?;
        tracing::info!(play_id = %play.id, order_id = %order_id, %reason, "exit order pending");
        Ok(())
    }

    /// Poll the outstanding exit order of a PENDING_CLOSING play.
    pub async fn poll_pending_close(&self, play: &mut Play) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::PendingClosing);
        let Some(order_id) = play.order_ids.exit.clone() else {
            return Err(EngineError::Integrity(format!(
                "play {} pending-closing without an exit order id",
                play.id
            )));
        };

        let order = self
            .broker
            .get_order(&order_id)
            .await
            .map_err(EngineError::from)?;

        match order.status {
            OrderStatus::Filled => {
                let fill_price = order.avg_fill_price.ok_or_else(|| {
                    EngineError::BrokerUnavailable(format!(
                        "order {order_id} reported filled without a price"
                    ))
                })?;
                play.fills.exit_premium = Some(fill_price);
                play.audit.closed_at = Some(Utc::now());
                if let Ok(stock) = self.market.get_stock_quote(&play.instrument.symbol).await {
                    play.audit.close_stock_price = Some(stock.last);
                }
                play.audit.realized_pnl = Some(realized_pnl(play, fill_price));
                self.store.transition(play, PlayState::Closed)?;
                tracing::info!(
                    play_id = %play.id,
                    premium = fill_price,
                    pnl = ?play.audit.realized_pnl,
                    "position closed"
                );
                Ok(())
            }
            OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired => {
                let reason = order
                    .reason
                    .unwrap_or_else(|| format!("exit order {:?}", order.status));
                play.order_ids.exit = None;
                play.audit.last_error = Some(reason.clone());
                self.store.transition(play, PlayState::Open)?;
                tracing::warn!(play_id = %play.id, reason = %reason, "exit failed; play restored to open");
                Ok(())
            }
            OrderStatus::New | OrderStatus::PartiallyFilled => Ok(()),
        }
    }

    // -- reconciliation -----------------------------------------------------

    /// A play found in NEW with a recorded entry order id crashed between
    /// submit and transition. Poll the orphan and transition according to
    /// what actually happened at the broker, instead of resubmitting.
    pub async fn reconcile_orphan(&self, play: &mut Play) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::New);
        let Some(order_id) = play.order_ids.entry.clone() else {
            return Ok(());
        };
        tracing::warn!(play_id = %play.id, order_id = %order_id, "reconciling orphan entry order");

        let order = self
            .broker
            .get_order(&order_id)
            .await
            .map_err(EngineError::from)?;

        match order.status {
            OrderStatus::Filled => {
                self.store.transition(play, PlayState::PendingOpening)?;
                self.complete_open(play, &order).await
            }
            OrderStatus::New | OrderStatus::PartiallyFilled => {
                // Order is live after all: resume the normal pending path.
                self.store.transition(play, PlayState::PendingOpening)?;
                Ok(())
            }
            OrderStatus::Rejected | OrderStatus::Canceled => {
                play.order_ids.entry = None;
                play.audit.last_error = Some(format!("orphan order {:?}", order.status));
                self.store.save(play)?;
                Ok(())
            }
            OrderStatus::Expired => {
                self.store.transition(play, PlayState::PendingOpening)?;
                self.expire_unfilled(play)
            }
        }
    }

    // -- rolling (SHORT only) -----------------------------------------------

    /// Roll a short position: buy back the current contract, then sell the
    /// roll target. OPEN → OPEN with the new contract and credit; the roll
    /// counter increments and the original expiration is preserved. If the
    /// buy-back fills but the new sale fails, the play closes with a
    /// diagnostic — there is no silent retry.
    pub async fn roll_short(&self, play: &mut Play, target: &ChainEntry) -> Result<()> {
        debug_assert_eq!(play.state, PlayState::Open);
        if play.position_side != PositionSide::Short {
            return Err(EngineError::Integrity(format!(
                "play {} is not short; cannot roll",
                play.id
            )));
        }

        if self.dry_run {
            tracing::info!(
                play_id = %play.id,
                from = %play.instrument.occ_symbol,
                to = %target.occ_symbol,
                "dry-run: would roll short position"
            );
            return Ok(());
        }

        let qty = play.held_contracts();
        let btc = OrderRequest {
            occ_symbol: play.instrument.occ_symbol.clone(),
            side: crate::broker::OrderSide::Buy,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            tif: TimeInForce::Day,
        };
        let btc_id = self
            .broker
            .submit_order(&btc)
            .await
            .map_err(EngineError::from)?;
        play.order_ids.exit = Some(btc_id.clone());
        self.store.save(play)?;

        // Market buy-backs fill in seconds; poll briefly within the tick.
        let Some(btc_fill) = self.await_fill(&btc_id).await? else {
            // Unfilled: cancel and keep the position as it was.
            let _ = self.broker.cancel_order(&btc_id).await;
            play.order_ids.exit = None;
            self.store.save(play)?;
            tracing::warn!(play_id = %play.id, "roll buy-back did not fill; roll abandoned");
            return Ok(());
        };

        let sto = OrderRequest {
            occ_symbol: target.occ_symbol.clone(),
            side: crate::broker::OrderSide::Sell,
            qty,
            order_type: OrderType::Limit,
            limit_price: Some(target.bid),
            tif: TimeInForce::Day,
        };
        let sto_result = self.broker.submit_order(&sto).await;

        let sto_id = match sto_result {
            Ok(id) => id,
            Err(e) => {
                return self.abort_roll(play, btc_fill, &e.to_string());
            }
        };
        let Some(sto_fill) = self.await_fill(&sto_id).await? else {
            let _ = self.broker.cancel_order(&sto_id).await;
            return self.abort_roll(play, btc_fill, "roll sell leg unfilled");
        };

        // Both legs filled: same play, new contract.
        if play.original_expiration.is_none() {
            play.original_expiration = Some(play.instrument.expiration);
        }
        play.instrument.occ_symbol = target.occ_symbol.clone();
        play.instrument.strike = target.strike;
        play.instrument.expiration = target.expiration;
        play.fills.entry_premium = Some(sto_fill);
        play.order_ids.exit = None;
        play.roll_count += 1;
        play.trail = Default::default();
        self.store.transition(play, PlayState::Open)?;
        tracing::info!(
            play_id = %play.id,
            roll_count = play.roll_count,
            new_credit = sto_fill,
            new_expiration = %target.expiration,
            "short position rolled"
        );
        Ok(())
    }

    /// BTC filled but the STO leg failed: the play is flat, so it closes
    /// with a diagnostic.
    fn abort_roll(&self, play: &mut Play, btc_fill: f64, diagnostic: &str) -> Result<()> {
        play.fills.exit_premium = Some(btc_fill);
        play.audit.closed_at = Some(Utc::now());
        play.audit.close_reason = Some(format!("roll aborted: {diagnostic}"));
        play.audit.realized_pnl = Some(realized_pnl(play, btc_fill));
        // The buy-back id stays recorded for the audit trail.
        self.store.transition(play, PlayState::PendingClosing)?;
        self.store.transition(play, PlayState::Closed)?;
        tracing::error!(play_id = %play.id, diagnostic, "roll aborted after buy-back fill");
        Ok(())
    }

    async fn await_fill(&self, order_id: &str) -> Result<Option<f64>> {
        for _ in 0..ROLL_POLL_ATTEMPTS {
            let order = self
                .broker
                .get_order(order_id)
                .await
                .map_err(EngineError::from)?;
            match order.status {
                OrderStatus::Filled => return Ok(order.avg_fill_price),
                OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired => {
                    return Ok(None)
                }
                OrderStatus::New | OrderStatus::PartiallyFilled => {
                    tokio::time::sleep(std::time::Duration::from_millis(ROLL_POLL_DELAY_MS)).await;
                }
            }
        }
        Ok(None)
    }
}

/// Convert percent-of-entry TP/SL configs into absolute premium targets once
/// the entry premium is known.
fn resolve_relative_targets(play: &mut Play) {
    let Some(entry) = play.fills.entry_premium else {
        return;
    };
    if play.take_profit.premium.is_none() {
        if let Some(pct) = play.take_profit.premium_pct {
            let target = match play.position_side {
                PositionSide::Long => entry * (1.0 + pct),
                PositionSide::Short => entry * (1.0 - pct),
            };
            play.take_profit.premium = Some((target.max(0.0) * 100.0).round() / 100.0);
        }
    }
    if play.stop_loss.premium.is_none() {
        if let Some(pct) = play.stop_loss.premium_pct {
            let target = match play.position_side {
                PositionSide::Long => entry * (1.0 - pct),
                PositionSide::Short => entry * (1.0 + pct),
            };
            play.stop_loss.premium = Some((target.max(0.0) * 100.0).round() / 100.0);
        }
    }
}

/// Realized profit in dollars: premium delta × 100 × contracts, signed by
/// position side.
fn realized_pnl(play: &Play, exit_premium: f64) -> f64 {
    let Some(entry) = play.fills.entry_premium else {
        return 0.0;
    };
    let per_contract = match play.position_side {
        PositionSide::Long => exit_premium - entry,
        PositionSide::Short => entry - exit_premium,
    };
    per_contract * 100.0 * f64::from(play.held_contracts())
}

/// Pick a roll target from chain entries: nearest |delta| to `delta_target`
/// among contracts of the same side expiring within the DTE window.
pub fn select_roll_target<'a>(
    entries: &'a [ChainEntry],
    play: &Play,
    clock: &MarketClock,
    dte_min: i64,
    dte_max: i64,
    delta_target: f64,
) -> Option<&'a ChainEntry> {
    entries
        .iter()
        .filter(|e| e.side == play.instrument.side)
        .filter(|e| {
            let dte = clock.days_to_expiration(e.expiration);
            dte >= dte_min && dte <= dte_max
        })
        .filter(|e| e.bid > 0.0)
        .min_by(|a, b| {
            let da = (a.delta.unwrap_or(0.0).abs() - delta_target).abs();
            let db = (b.delta.unwrap_or(0.0).abs() - delta_target).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
}
