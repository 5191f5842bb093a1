//! REST brokerage client.
//!
//! Thin bearer-token client over the order/account surface. Paper trading is
//! the default; pointing `base_url` at a live endpoint requires the explicit
//! `OPTIONEER_LIVE_TRADING=yes` opt-in checked at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    Account, BrokerError, Brokerage, OrderRequest, OrderSide, OrderState, OrderStatus, OrderType,
    TimeInForce,
};
use crate::config::BrokerAccountConfig;

const BROKER_TIMEOUT_SECS: u64 = 30;

pub struct RestBrokerage {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RestBrokerage {
    pub fn new(config: &BrokerAccountConfig) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(BROKER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_key.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Heuristic shared with the live-trading gate: paper endpoints carry
    /// "paper" or "sandbox" in the host.
    pub fn is_paper(&self) -> bool {
        self.base_url.contains("paper") || self.base_url.contains("sandbox")
    }

    async fn request<T: serde::de::DeserializeOwned, B: Serialize + Sync>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token));
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        if status == 401 || status == 403 {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Auth(format!("{status}: {body}")));
        }
        if status == 422 {
            // Unprocessable order: the broker looked at it and said no.
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected { reason: body });
        }
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Api { status, body });
        }

        resp.json::<T>().await.map_err(BrokerError::from)
    }
}

// -- wire types -------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireOrderRequest<'a> {
    symbol: &'a str,
    side: &'a str,
    qty: u32,
    #[serde(rename = "type")]
    order_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
    time_in_force: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: String,
    status: String,
    filled_qty: Option<u32>,
    filled_avg_price: Option<f64>,
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    cash: f64,
    buying_power: f64,
    options_buying_power: f64,
    equity: f64,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    qty: i64,
}

fn parse_status(raw: &str) -> Result<OrderStatus, BrokerError> {
    match raw {
        "new" | "accepted" | "pending_new" => Ok(OrderStatus::New),
        "partially_filled" => Ok(OrderStatus::PartiallyFilled),
        "filled" => Ok(OrderStatus::Filled),
        "canceled" | "pending_cancel" => Ok(OrderStatus::Canceled),
        "rejected" => Ok(OrderStatus::Rejected),
        "expired" => Ok(OrderStatus::Expired),
        other => Err(BrokerError::Api {
            status: 200,
            body: format!("unknown order status: {other}"),
        }),
    }
}

impl WireOrder {
    fn into_state(self) -> Result<OrderState, BrokerError> {
        let status = parse_status(&self.status)?;
        Ok(OrderState {
            id: self.id,
            status,
            filled_qty: self.filled_qty.unwrap_or(0),
            avg_fill_price: self.filled_avg_price,
            reason: self.reject_reason,
        })
    }
}

#[async_trait]
impl Brokerage for RestBrokerage {
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, BrokerError> {
        let wire = WireOrderRequest {
            symbol: &request.occ_symbol,
            side: match request.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            qty: request.qty,
            order_type: match request.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            limit_price: request.limit_price,
            time_in_force: match request.tif {
                TimeInForce::Day => "day",
                TimeInForce::Gtc => "gtc",
            },
        };
        let order: WireOrder = self
            .request(reqwest::Method::POST, "/v2/orders", Some(&wire))
            .await?;
        tracing::info!(
            order_id = %order.id,
            symbol = %request.occ_symbol,
            qty = request.qty,
            "order submitted"
        );
        Ok(order.id)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let _: serde_json::Value = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v2/orders/{order_id}"),
                None::<&()>,
            )
            .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState, BrokerError> {
        let order: WireOrder = self
            .request(
                reqwest::Method::GET,
                &format!("/v2/orders/{order_id}"),
                None::<&()>,
            )
            .await?;
        order.into_state()
    }

    async fn get_account(&self) -> Result<Account, BrokerError> {
        let account: WireAccount = self
            .request(reqwest::Method::GET, "/v2/account", None::<&()>)
            .await?;
        Ok(Account {
            cash: account.cash,
            buying_power: account.buying_power,
            options_buying_power: account.options_buying_power,
            equity: account.equity,
        })
    }

    async fn get_position(&self, occ_symbol: &str) -> Result<Option<i64>, BrokerError> {
        let result: Result<WirePosition, BrokerError> = self
            .request(
                reqwest::Method::GET,
                &format!("/v2/positions/{occ_symbol}"),
                None::<&()>,
            )
            .await;
        match result {
            Ok(pos) => Ok(Some(pos.qty)),
            Err(BrokerError::Api { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
