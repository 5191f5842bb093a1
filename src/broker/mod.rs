//! Brokerage façade.
//!
//! The engine needs exactly five operations from a brokerage: submit, cancel,
//! poll an order, read the account, read a position. `submit_order` is NOT
//! idempotent at the broker; callers must durably record the returned id
//! before trusting the side-effect. Polling `get_order` is the only
//! authoritative source of fill state.

pub mod rest;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub occ_symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub id: String,
    pub status: OrderStatus,
    pub filled_qty: u32,
    pub avg_fill_price: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub cash: f64,
    pub buying_power: f64,
    pub options_buying_power: f64,
    pub equity: f64,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("order rejected: {reason}")]
    Rejected { reason: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unknown order id: {0}")]
    UnknownOrder(String),
}

impl From<BrokerError> for EngineError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Auth(msg) => EngineError::BrokerAuth(msg),
            BrokerError::Rejected { reason } => EngineError::BrokerRejected { reason },
            other => EngineError::BrokerUnavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Submit an order; returns the broker-assigned order id. Network errors
    /// surface to the caller, which must NOT retry the submit automatically.
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, BrokerError>;

    /// Best-effort cancel. A race with a fill is expected; callers check
    /// `get_order` afterwards.
    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderState, BrokerError>;

    async fn get_account(&self) -> Result<Account, BrokerError>;

    /// Signed contract quantity for an option position, `None` when flat.
    async fn get_position(&self, occ_symbol: &str) -> Result<Option<i64>, BrokerError>;
}
