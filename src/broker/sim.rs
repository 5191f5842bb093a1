//! Simulated brokerage.
//!
//! In-memory implementation of the `Brokerage` trait with scriptable fill
//! behavior. Orders rest as `New` until the harness fills, rejects, or
//! expires them, which lets tests drive every branch of the executor's
//! polling logic deterministically. Also backs dry runs when no real broker
//! account is configured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Account, BrokerError, Brokerage, OrderRequest, OrderState, OrderStatus};

#[derive(Debug, Clone)]
pub struct SimOrder {
    pub request: OrderRequest,
    pub state: OrderState,
}

pub struct SimBrokerage {
    orders: DashMap<String, SimOrder>,
    positions: DashMap<String, i64>,
    account: Mutex<Account>,
    submitted: AtomicU64,
    next_id: AtomicU64,
    /// When set, the next submit is rejected with this reason.
    reject_next: Mutex<Option<String>>,
    /// When set, submitted orders fill immediately at this price.
    auto_fill_price: Mutex<Option<f64>>,
    fail_transport: std::sync::atomic::AtomicBool,
}

impl Default for SimBrokerage {
    fn default() -> Self {
        Self::new(Account {
            cash: 100_000.0,
            buying_power: 200_000.0,
            options_buying_power: 100_000.0,
            equity: 100_000.0,
        })
    }
}

impl SimBrokerage {
    pub fn new(account: Account) -> Self {
        Self {
            orders: DashMap::new(),
            positions: DashMap::new(),
            account: Mutex::new(account),
            submitted: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            reject_next: Mutex::new(None),
            auto_fill_price: Mutex::new(None),
            fail_transport: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Total submits accepted since construction. Lets tests assert
    /// no-op ticks submit nothing.
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn set_account(&self, account: Account) {
        *self.account.lock().expect("account lock") = account;
    }

    pub fn set_position(&self, occ_symbol: &str, qty: i64) {
        self.positions.insert(occ_symbol.to_string(), qty);
    }

    /// Script the next submit to be rejected by the broker.
    pub fn reject_next_submit(&self, reason: &str) {
        *self.reject_next.lock().expect("reject lock") = Some(reason.to_string());
    }

    /// Fill new submits immediately at `price` (market-order behavior).
    pub fn auto_fill_at(&self, price: f64) {
        *self.auto_fill_price.lock().expect("fill lock") = Some(price);
    }

    pub fn clear_auto_fill(&self) {
        *self.auto_fill_price.lock().expect("fill lock") = None;
    }

    /// Make every call fail with a transport error, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_transport.store(unavailable, Ordering::SeqCst);
    }

    /// Mark a resting order filled at `price`.
    pub fn fill_order(&self, order_id: &str, price: f64) {
        if let Some(mut entry) = self.orders.get_mut(order_id) {
            let qty = entry.request.qty;
            entry.state.status = OrderStatus::Filled;
            entry.state.filled_qty = qty;
            entry.state.avg_fill_price = Some(price);
        }
    }

    /// Mark a resting order partially filled.
    pub fn partial_fill_order(&self, order_id: &str, qty: u32, price: f64) {
        if let Some(mut entry) = self.orders.get_mut(order_id) {
            entry.state.status = OrderStatus::PartiallyFilled;
            entry.state.filled_qty = qty;
            entry.state.avg_fill_price = Some(price);
        }
    }

    /// Mark a resting order rejected after the fact.
    pub fn reject_order(&self, order_id: &str, reason: &str) {
        if let Some(mut entry) = self.orders.get_mut(order_id) {
            entry.state.status = OrderStatus::Rejected;
            entry.state.reason = Some(reason.to_string());
        }
    }

    /// Expire a resting day order (end-of-session behavior).
    pub fn expire_order(&self, order_id: &str) {
        if let Some(mut entry) = self.orders.get_mut(order_id) {
            entry.state.status = OrderStatus::Expired;
        }
    }

    pub fn order(&self, order_id: &str) -> Option<SimOrder> {
        self.orders.get(order_id).map(|o| o.value().clone())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(BrokerError::Api {
                status: 503,
                body: "scripted outage".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Brokerage for SimBrokerage {
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        self.check_available()?;

        if let Some(reason) = self.reject_next.lock().expect("reject lock").take() {
            return Err(BrokerError::Rejected { reason });
        }

        let id = format!("sim-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = OrderState {
            id: id.clone(),
            status: OrderStatus::New,
            filled_qty: 0,
            avg_fill_price: None,
            reason: None,
        };
        if let Some(price) = *self.auto_fill_price.lock().expect("fill lock") {
            state.status = OrderStatus::Filled;
            state.filled_qty = request.qty;
            state.avg_fill_price = Some(price);
        }

        self.orders.insert(
            id.clone(),
            SimOrder {
                request: request.clone(),
                state,
            },
        );
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        let Some(mut entry) = self.orders.get_mut(order_id) else {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        };
        // Cancel races with fills: a terminal order stays terminal.
        if !entry.state.status.is_terminal() {
            entry.state.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState, BrokerError> {
        self.check_available()?;
        self.orders
            .get(order_id)
            .map(|o| o.value().state.clone())
            .ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        self.check_available()?;
        Ok(*self.account.lock().expect("account lock"))
    }

    async fn get_position(&self, occ_symbol: &str) -> Result<Option<i64>, BrokerError> {
        self.check_available()?;
        Ok(self.positions.get(occ_symbol).map(|p| *p.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{OrderSide, OrderType, TimeInForce};

    fn request() -> OrderRequest {
        OrderRequest {
            occ_symbol: "SPY250620C00500000".into(),
            side: OrderSide::Buy,
            qty: 1,
            order_type: OrderType::Limit,
            limit_price: Some(2.00),
            tif: TimeInForce::Day,
        }
    }

    #[tokio::test]
    async fn submit_then_fill_then_poll() {
        let broker = SimBrokerage::default();
        let id = broker.submit_order(&request()).await.unwrap();
        assert_eq!(
            broker.get_order(&id).await.unwrap().status,
            OrderStatus::New
        );

        broker.fill_order(&id, 2.00);
        let state = broker.get_order(&id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.filled_qty, 1);
        assert_eq!(state.avg_fill_price, Some(2.00));
    }

    #[tokio::test]
    async fn scripted_rejection_applies_once() {
        let broker = SimBrokerage::default();
        broker.reject_next_submit("no bueno");
        assert!(matches!(
            broker.submit_order(&request()).await,
            Err(BrokerError::Rejected { .. })
        ));
        assert!(broker.submit_order(&request()).await.is_ok());
    }

    #[tokio::test]
    async fn auto_fill_fills_on_submit() {
        let broker = SimBrokerage::default();
        broker.auto_fill_at(2.05);
        let id = broker.submit_order(&request()).await.unwrap();
        let state = broker.get_order(&id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.avg_fill_price, Some(2.05));
    }

    #[tokio::test]
    async fn cancel_does_not_undo_fill() {
        let broker = SimBrokerage::default();
        let id = broker.submit_order(&request()).await.unwrap();
        broker.fill_order(&id, 2.00);
        broker.cancel_order(&id).await.unwrap();
        assert_eq!(
            broker.get_order(&id).await.unwrap().status,
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let broker = SimBrokerage::default();
        let id = broker.submit_order(&request()).await.unwrap();
        broker.set_unavailable(true);
        assert!(broker.get_order(&id).await.is_err());
        assert!(broker.submit_order(&request()).await.is_err());
        broker.set_unavailable(false);
        assert!(broker.get_order(&id).await.is_ok());
    }

    #[tokio::test]
    async fn submitted_count_tracks_accepted_submits() {
        let broker = SimBrokerage::default();
        assert_eq!(broker.submitted_count(), 0);
        broker.submit_order(&request()).await.unwrap();
        broker.submit_order(&request()).await.unwrap();
        assert_eq!(broker.submitted_count(), 2);
    }
}
