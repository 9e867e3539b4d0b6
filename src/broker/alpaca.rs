// =============================================================================
// Alpaca REST broker client — key/secret header auth, typed error mapping
// =============================================================================
//
// SECURITY: the secret key is sent only as a header and never logged. Every
// call runs under the caller-configured timeout; a timeout or non-2xx
// response surfaces as a BrokerError and the engine does not advance state.
// =============================================================================

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{
    AccountInfo, BrokerClient, BrokerError, BrokerPosition, ExecutionReport, Order,
};
use crate::types::OrderSide;

/// Alpaca REST broker client.
#[derive(Clone)]
pub struct AlpacaBroker {
    base_url: String,
    client: reqwest::Client,
}

impl AlpacaBroker {
    /// Create a client against `base_url` (paper or live endpoint).
    ///
    /// # Arguments
    /// * `key_id`     — API key id, sent as `APCA-API-KEY-ID`.
    /// * `secret_key` — API secret, sent as `APCA-API-SECRET-KEY`.
    /// * `timeout`    — applied to every HTTP call.
    pub fn new(
        base_url: impl Into<String>,
        key_id: &str,
        secret_key: &str,
        timeout: Duration,
    ) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(mut val) = HeaderValue::from_str(secret_key) {
            val.set_sensitive(true);
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");

        debug!(timeout_secs = timeout.as_secs(), "AlpacaBroker initialised");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    fn map_request_error(what: &str, err: reqwest::Error) -> BrokerError {
        if err.is_timeout() {
            BrokerError::Timeout(what.to_string())
        } else {
            BrokerError::Transport(format!("{what}: {err}"))
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, BrokerError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_request_error(path, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BrokerError::Parse(format!("{path}: {e}")))?;

        if !status.is_success() {
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| BrokerError::Parse(format!("{path}: {e}")))
    }

    async fn delete(&self, path: &str) -> Result<(), BrokerError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| Self::map_request_error(path, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Parse an Alpaca numeric field that may arrive as a string or a number.
fn field_f64(value: &serde_json::Value, key: &str) -> f64 {
    match value.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn field_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn parse_order(value: &serde_json::Value) -> Order {
    let side = if field_str(value, "side") == "sell" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    let qty = field_f64(value, "qty");

    Order {
        order_id: field_str(value, "id"),
        symbol: field_str(value, "symbol"),
        quantity: side.sign() * qty,
        side,
        order_type: field_str(value, "type"),
        time_in_force: field_str(value, "time_in_force"),
        status: field_str(value, "status"),
        filled_qty: field_f64(value, "filled_qty"),
        filled_avg_price: field_f64(value, "filled_avg_price"),
    }
}

#[async_trait]
impl BrokerClient for AlpacaBroker {
    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<AccountInfo, BrokerError> {
        let body = self.get_json("/v2/account").await?;
        Ok(AccountInfo {
            account_number: field_str(&body, "account_number"),
            cash: field_f64(&body, "cash"),
            equity: field_f64(&body, "equity"),
            buying_power: field_f64(&body, "buying_power"),
            portfolio_value: field_f64(&body, "portfolio_value"),
            pattern_day_trader: body
                .get("pattern_day_trader")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            trading_blocked: body
                .get("trading_blocked")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            account_blocked: body
                .get("account_blocked")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }

    #[instrument(skip(self), name = "alpaca::get_positions")]
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let body = self.get_json("/v2/positions").await?;
        let items = body
            .as_array()
            .ok_or_else(|| BrokerError::Parse("positions response not an array".to_string()))?;

        Ok(items
            .iter()
            .map(|p| {
                let qty = field_f64(p, "qty");
                let side_sign = if field_str(p, "side") == "short" { -1.0 } else { 1.0 };
                BrokerPosition {
                    symbol: field_str(p, "symbol"),
                    quantity: side_sign * qty.abs(),
                    avg_entry_price: field_f64(p, "avg_entry_price"),
                    current_price: field_f64(p, "current_price"),
                    unrealized_pl: field_f64(p, "unrealized_pl"),
                }
            })
            .collect())
    }

    #[instrument(skip(self), name = "alpaca::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        signed_qty: f64,
        time_in_force: &str,
    ) -> Result<Order, BrokerError> {
        if signed_qty == 0.0 {
            return Err(BrokerError::Rejected("zero quantity order".to_string()));
        }

        let side = if signed_qty > 0.0 { "buy" } else { "sell" };
        let payload = serde_json::json!({
            "symbol": symbol,
            "qty": format!("{}", signed_qty.abs()),
            "side": side,
            "type": "market",
            "time_in_force": time_in_force,
        });

        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::map_request_error("/v2/orders", e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BrokerError::Parse(format!("/v2/orders: {e}")))?;

        if !status.is_success() {
            warn!(symbol, side, status = status.as_u16(), "order rejected");
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| BrokerError::Parse(format!("/v2/orders: {e}")))?;
        Ok(parse_order(&value))
    }

    async fn close_position(&self, symbol: &str) -> Result<(), BrokerError> {
        self.delete(&format!("/v2/positions/{symbol}")).await
    }

    async fn close_all_positions(&self) -> Result<(), BrokerError> {
        self.delete("/v2/positions").await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        self.delete(&format!("/v2/orders/{order_id}")).await
    }

    async fn cancel_all_orders(&self) -> Result<(), BrokerError> {
        self.delete("/v2/orders").await
    }

    async fn get_open_orders(&self) -> Result<Vec<Order>, BrokerError> {
        let body = self.get_json("/v2/orders?status=open").await?;
        let items = body
            .as_array()
            .ok_or_else(|| BrokerError::Parse("orders response not an array".to_string()))?;
        Ok(items.iter().map(parse_order).collect())
    }

    async fn is_market_open(&self) -> Result<bool, BrokerError> {
        let body = self.get_json("/v2/clock").await?;
        Ok(body.get("is_open").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn take_execution_receiver(&self) -> Option<mpsc::UnboundedReceiver<ExecutionReport>> {
        // Fills are reconciled by polling; no push channel for the REST client.
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_fields_parse_from_strings_and_numbers() {
        let value = serde_json::json!({"cash": "1234.5", "equity": 987.25});
        assert!((field_f64(&value, "cash") - 1234.5).abs() < 1e-9);
        assert!((field_f64(&value, "equity") - 987.25).abs() < 1e-9);
        assert_eq!(field_f64(&value, "missing"), 0.0);
    }

    #[test]
    fn order_parsing_signs_quantity_by_side() {
        let value = serde_json::json!({
            "id": "abc", "symbol": "QQQ", "qty": "100", "side": "sell",
            "type": "market", "time_in_force": "day", "status": "accepted",
            "filled_qty": "0", "filled_avg_price": "0"
        });
        let order = parse_order(&value);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, -100.0);
        assert_eq!(order.symbol, "QQQ");
    }
}
