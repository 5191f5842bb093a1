//! End-to-end lifecycle scenarios driven through the orchestrator with the
//! simulated brokerage and a static market-data provider.

mod common;

use common::{
    harness_with, spy_500_call_play, session_clock, set_option, set_stock, spy_call_occ,
    swings_harness,
};
use optioneer::broker::Brokerage;
use optioneer::orchestrator::{enabled_strategies, Orchestrator};
use optioneer::play::PlayState;

fn orchestrator_for(harness: &common::Harness) -> Orchestrator {
    let strategies = enabled_strategies(&harness.ctx.config);
    Orchestrator::new(harness.ctx.clone(), strategies)
}

#[tokio::test]
async fn long_call_take_profit_full_lifecycle() {
    let harness = swings_harness();
    let occ = spy_call_occ();
    let play = spy_500_call_play();
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    let mut orchestrator = orchestrator_for(&harness);

    // Tick 1: last=500.10 inside the buffer, option 1.95/2.00 → entry fires
    // limit @ ask 2.00 and the play moves to pending-opening.
    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::PendingOpening);
    let entry_order = play.order_ids.entry.clone().expect("entry order recorded");
    let submitted = harness.broker.order(&entry_order).unwrap();
    assert_eq!(submitted.request.limit_price, Some(2.00));
    assert_eq!(harness.broker.submitted_count(), 1);

    // Tick 2: the order fills at 2.00 → OPEN with entry premium recorded.
    harness.broker.fill_order(&entry_order, 2.00);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Open);
    assert_eq!(play.fills.entry_premium, Some(2.00));
    assert!(play.audit.greeks_at_open.is_some(), "greeks snapshot at fill");
    assert_eq!(harness.broker.submitted_count(), 1);

    // Tick 3: bid 3.05 ≥ TP 3.00 → exit fires, limit @ bid, pending-closing.
    set_option(&harness.provider, &occ, 3.05, 3.15);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::PendingClosing);
    let exit_order = play.order_ids.exit.clone().expect("exit order recorded");
    let submitted = harness.broker.order(&exit_order).unwrap();
    assert_eq!(submitted.request.limit_price, Some(3.05));
    assert_eq!(harness.broker.submitted_count(), 2);

    // Tick 4: exit fills at 3.05 → CLOSED, pnl = +1.05 × 100 × 1.
    harness.broker.fill_order(&exit_order, 3.05);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Closed);
    assert_eq!(play.fills.exit_premium, Some(3.05));
    let pnl = play.audit.realized_pnl.unwrap();
    assert!((pnl - 105.0).abs() < 1e-6, "pnl was {pnl}");
    assert_eq!(play.audit.close_reason.as_deref(), Some("take_profit"));
}

#[tokio::test]
async fn no_op_ticks_submit_nothing() {
    // With no market change and no triggers met, repeated ticks must not
    // produce additional broker submissions.
    let harness = swings_harness();
    let occ = spy_call_occ();
    let play = spy_500_call_play();
    harness.ctx.store.save(&play).unwrap();

    // Price far outside the entry buffer.
    set_stock(&harness.provider, "SPY", 520.0);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();
    orchestrator.tick().await.unwrap();
    orchestrator.tick().await.unwrap();
    assert_eq!(harness.broker.submitted_count(), 0);

    let reloaded = harness.ctx.store.load(&play.id).unwrap();
    assert_eq!(reloaded.state, PlayState::New);
}

#[tokio::test]
async fn idempotent_over_pending_states() {
    // A pending play with an outstanding order id is only polled, never
    // resubmitted, no matter how many ticks pass unfilled.
    let harness = swings_harness();
    let occ = spy_call_occ();
    let play = spy_500_call_play();
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();
    assert_eq!(harness.broker.submitted_count(), 1);

    // Unfilled across several ticks: still exactly one submission.
    orchestrator.tick().await.unwrap();
    orchestrator.tick().await.unwrap();
    assert_eq!(harness.broker.submitted_count(), 1);
    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::PendingOpening);
}

#[tokio::test]
async fn rejected_entry_restores_play_to_new() {
    let harness = swings_harness();
    let occ = spy_call_occ();
    let play = spy_500_call_play();
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();
    let play = harness.ctx.store.load(&play_id).unwrap();
    let entry_order = play.order_ids.entry.clone().unwrap();

    harness.broker.reject_order(&entry_order, "insufficient buying power");
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::New);
    assert!(play.order_ids.entry.is_none(), "broker id cleared");
    assert_eq!(
        play.audit.last_error.as_deref(),
        Some("insufficient buying power")
    );
}

#[tokio::test]
async fn crash_between_submit_and_transition_reconciles() {
    // Submit returned an id but the process died before the
    // directory move. On restart the play is NEW with an orphan id; the
    // reconciler polls it and transitions according to the actual status.
    let harness = swings_harness();
    let occ = spy_call_occ();
    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    // Simulate the crash: the order exists at the broker, the play still
    // sits in new/ with the orphan id recorded.
    let order_id = harness
        .broker
        .submit_order(&optioneer::broker::OrderRequest {
            occ_symbol: occ.clone(),
            side: optioneer::broker::OrderSide::Buy,
            qty: 1,
            order_type: optioneer::broker::OrderType::Limit,
            limit_price: Some(2.00),
            tif: optioneer::broker::TimeInForce::Day,
        })
        .await
        .unwrap();
    let mut play = spy_500_call_play();
    play.order_ids.entry = Some(order_id.clone());
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    // The order filled while we were down.
    harness.broker.fill_order(&order_id, 2.00);

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Open);
    assert_eq!(play.fills.entry_premium, Some(2.00));
    // Reconciliation never resubmits.
    assert_eq!(harness.broker.submitted_count(), 1);
}

#[tokio::test]
async fn orphan_rejected_order_clears_id_and_stays_new() {
    let harness = swings_harness();
    let occ = spy_call_occ();
    set_stock(&harness.provider, "SPY", 520.0); // no entry trigger
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let order_id = harness
        .broker
        .submit_order(&optioneer::broker::OrderRequest {
            occ_symbol: occ.clone(),
            side: optioneer::broker::OrderSide::Buy,
            qty: 1,
            order_type: optioneer::broker::OrderType::Limit,
            limit_price: Some(2.00),
            tif: optioneer::broker::TimeInForce::Day,
        })
        .await
        .unwrap();
    harness.broker.reject_order(&order_id, "nope");

    let mut play = spy_500_call_play();
    play.order_ids.entry = Some(order_id);
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::New);
    assert!(play.order_ids.entry.is_none());
    assert_eq!(harness.broker.submitted_count(), 1);
}

#[tokio::test]
async fn partial_fill_at_close_opens_with_reduced_qty() {
    let harness = harness_with(
        "[strategies.swings]\nenabled = true\n",
        common::after_close_clock(2025, 6, 10),
    );
    let occ = spy_call_occ();
    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    // A five-lot that went pending during the session...
    let mut play = spy_500_call_play();
    play.contracts = 5;
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();
    {
        let mut play = harness.ctx.store.load(&play_id).unwrap();
        let id = harness
            .broker
            .submit_order(&optioneer::broker::OrderRequest {
                occ_symbol: occ.clone(),
                side: optioneer::broker::OrderSide::Buy,
                qty: 5,
                order_type: optioneer::broker::OrderType::Limit,
                limit_price: Some(2.00),
                tif: optioneer::broker::TimeInForce::Day,
            })
            .await
            .unwrap();
        play.order_ids.entry = Some(id.clone());
        harness.ctx.store.save(&play).unwrap();
        harness
            .ctx
            .store
            .transition(&mut play, PlayState::PendingOpening)
            .unwrap();
        harness.broker.partial_fill_order(&id, 3, 2.00);
    }

    // ...and is now polled after the close: cancel remainder, open reduced.
    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Open);
    assert_eq!(play.fills.entry_filled_qty, Some(3));
    assert_eq!(play.held_contracts(), 3);
}

#[tokio::test]
async fn unfilled_day_order_expires_after_close() {
    let harness = harness_with(
        "[strategies.swings]\nenabled = true\n",
        common::after_close_clock(2025, 6, 10),
    );
    let occ = spy_call_occ();
    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let play = spy_500_call_play();
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();
    {
        let mut play = harness.ctx.store.load(&play_id).unwrap();
        let id = harness
            .broker
            .submit_order(&optioneer::broker::OrderRequest {
                occ_symbol: occ.clone(),
                side: optioneer::broker::OrderSide::Buy,
                qty: 1,
                order_type: optioneer::broker::OrderType::Limit,
                limit_price: Some(2.00),
                tif: optioneer::broker::TimeInForce::Day,
            })
            .await
            .unwrap();
        play.order_ids.entry = Some(id.clone());
        harness.ctx.store.save(&play).unwrap();
        harness
            .ctx
            .store
            .transition(&mut play, PlayState::PendingOpening)
            .unwrap();
        harness.broker.expire_order(&id);
    }

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Expired);
}

#[tokio::test]
async fn broker_outage_preserves_pending_state() {
    let harness = swings_harness();
    let occ = spy_call_occ();
    let play = spy_500_call_play();
    let play_id = play.id.clone();
    harness.ctx.store.save(&play).unwrap();

    set_stock(&harness.provider, "SPY", 500.10);
    set_option(&harness.provider, &occ, 1.95, 2.00);

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();
    assert_eq!(harness.broker.submitted_count(), 1);

    // Broker goes dark: the poll fails, the play stays pending, nothing is
    // resubmitted.
    harness.broker.set_unavailable(true);
    orchestrator.tick().await.unwrap();
    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::PendingOpening);
    assert_eq!(harness.broker.submitted_count(), 1);

    // Broker recovers, the order filled meanwhile; next poll completes it.
    harness.broker.set_unavailable(false);
    let entry_order = play.order_ids.entry.clone().unwrap();
    harness.broker.fill_order(&entry_order, 2.00);
    orchestrator.tick().await.unwrap();
    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::Open);
}

#[tokio::test]
async fn expiration_day_exit_goes_market() {
    let harness = harness_with(
        "[strategies.swings]\nenabled = true\n",
        session_clock(2025, 6, 20), // expiration day of the scenario play
    );
    let occ = spy_call_occ();
    set_stock(&harness.provider, "SPY", 500.0);
    set_option(&harness.provider, &occ, 0.50, 0.60);

    let mut play = spy_500_call_play();
    play.order_ids.entry = Some("sim-prior".into());
    harness.ctx.store.save(&play).unwrap();
    let play_id = play.id.clone();
    {
        let mut play = harness.ctx.store.load(&play_id).unwrap();
        harness
            .ctx
            .store
            .transition(&mut play, PlayState::PendingOpening)
            .unwrap();
        play.fills.entry_premium = Some(2.00);
        harness.ctx.store.transition(&mut play, PlayState::Open).unwrap();
    }

    let mut orchestrator = orchestrator_for(&harness);
    orchestrator.tick().await.unwrap();

    let play = harness.ctx.store.load(&play_id).unwrap();
    assert_eq!(play.state, PlayState::PendingClosing);
    let exit = harness.broker.order(&play.order_ids.exit.clone().unwrap()).unwrap();
    assert_eq!(exit.request.order_type, optioneer::broker::OrderType::Market);
    assert_eq!(play.audit.close_reason.as_deref(), Some("option_expired"));
}
