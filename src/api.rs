//! POS API client.
//!
//! Implements the order, shift and table resources over authenticated
//! HTTP + JSON. Every request carries the terminal's API key and id.
//! Non-success responses are mapped onto the engine's error taxonomy so
//! callers know whether an optimistic update must be rolled back.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{normalize_api_url, EngineConfig};
use crate::error::{PosError, PosResult};
use crate::models::{Order, OrderDraft, OrderStatus, PaymentMethod, TableStatus};
use crate::resources::{OrderFilter, OrderResource, ShiftResource, TableResource};
use crate::shifts::{ShiftBalance, ShiftCloseSummary};

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach the POS server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid POS server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Default message for an HTTP status when the body carries none.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Resource not found".to_string(),
        409 => "The order was changed by another terminal".to_string(),
        s if s >= 500 => format!("POS server error (HTTP {s})"),
        s => format!("Unexpected response from POS server (HTTP {s})"),
    }
}

/// Map a non-success status onto the error taxonomy.
fn classify_status(status: StatusCode, message: String) -> PosError {
    match status.as_u16() {
        400 | 409 | 410 | 422 => PosError::Conflict(message),
        401 | 403 => PosError::Policy(message),
        404 => PosError::NotFound(message),
        _ => PosError::Transport(message),
    }
}

/// Pull a message out of an error body (`{"error": ...}` or
/// `{"message": ...}`), falling back to the raw text.
fn error_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        if let Some(msg) = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
        {
            return msg.to_string();
        }
    }
    if trimmed.is_empty() {
        status_error(status)
    } else {
        format!("{}: {}", status_error(status), trimmed)
    }
}

/// Responses are either the bare payload or wrapped as `{"data": ...}`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn list_query(filter: &OrderFilter) -> String {
    let mut params = Vec::new();
    if let Some(status) = filter.status {
        params.push(format!("status={}", status.as_str()));
    }
    if let Some(date) = filter.date {
        params.push(format!("date={}", date.format("%Y-%m-%d")));
    }
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ApiClient {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
}

impl ApiClient {
    pub fn new(config: &EngineConfig) -> PosResult<Self> {
        let base_url = normalize_api_url(&config.api_url);
        if base_url.is_empty() {
            return Err(PosError::validation("POS server URL is not configured"));
        }
        if config.api_key.trim().is_empty() {
            return Err(PosError::validation("Terminal API key is not configured"));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PosError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.trim().to_string(),
            terminal_id: config.terminal_id.trim().to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> PosResult<T> {
        let full_url = self.url(path);
        debug!(method = %method, path, "POS API request");

        let mut req = self
            .client
            .request(method, &full_url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .header("Content-Type", "application/json");
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PosError::Transport(friendly_error(&self.base_url, &e)))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = error_detail(status, &body_text);
            warn!(path, status = status.as_u16(), "POS API request rejected: {detail}");
            return Err(classify_status(status, detail));
        }

        let value = if body_text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body_text).map_err(|e| {
                PosError::Transport(format!("Invalid JSON from POS server: {e}"))
            })?
        };
        serde_json::from_value(unwrap_envelope(value))
            .map_err(|e| PosError::Transport(format!("Unexpected response shape for {path}: {e}")))
    }
}

#[async_trait]
impl OrderResource for ApiClient {
    async fn create(&self, draft: &OrderDraft) -> PosResult<Order> {
        let body = serde_json::to_value(draft)?;
        self.request(Method::POST, "/api/pos/orders", Some(body))
            .await
    }

    async fn list(&self, filter: &OrderFilter) -> PosResult<Vec<Order>> {
        let path = format!("/api/pos/orders{}", list_query(filter));
        self.request(Method::GET, &path, None).await
    }

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: Option<&str>,
    ) -> PosResult<Order> {
        let body = json!({ "status": status, "cancelReason": reason });
        self.request(
            Method::PATCH,
            &format!("/api/pos/orders/{order_id}/status"),
            Some(body),
        )
        .await
    }

    async fn confirm_payment(&self, order_id: &str, method: PaymentMethod) -> PosResult<Order> {
        let body = json!({ "paymentMethod": method });
        self.request(
            Method::POST,
            &format!("/api/pos/orders/{order_id}/payment"),
            Some(body),
        )
        .await
    }

    async fn merge(&self, order_ids: &[String]) -> PosResult<Order> {
        let body = json!({ "orderIds": order_ids });
        self.request(Method::POST, "/api/pos/orders/merge", Some(body))
            .await
    }
}

#[async_trait]
impl ShiftResource for ApiClient {
    async fn current_balance(&self) -> PosResult<ShiftBalance> {
        self.request(Method::GET, "/api/pos/shift/balance", None)
            .await
    }

    async fn start_shift(&self, opening_float: Decimal) -> PosResult<ShiftBalance> {
        let body = json!({ "openingFloat": opening_float });
        self.request(Method::POST, "/api/pos/shift/start", Some(body))
            .await
    }

    async fn close_shift(&self, ending_cash_count: Decimal) -> PosResult<ShiftCloseSummary> {
        let body = json!({ "endingCash": ending_cash_count });
        self.request(Method::POST, "/api/pos/shift/close", Some(body))
            .await
    }

    async fn record_expense(&self, amount: Decimal, description: &str) -> PosResult<ShiftBalance> {
        let body = json!({ "amount": amount, "description": description });
        self.request(Method::POST, "/api/pos/shift/expenses", Some(body))
            .await
    }
}

#[async_trait]
impl TableResource for ApiClient {
    async fn update_status(&self, table_id: &str, status: TableStatus) -> PosResult<()> {
        let body = json!({ "status": status });
        let _: Value = self
            .request(
                Method::PATCH,
                &format!("/api/pos/tables/{table_id}/status"),
                Some(body),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::error::ErrorKind;

    #[test]
    fn test_status_classification() {
        let kind = |code: u16| {
            classify_status(StatusCode::from_u16(code).unwrap(), "x".into()).kind()
        };
        assert_eq!(kind(409), ErrorKind::Conflict);
        assert_eq!(kind(422), ErrorKind::Conflict);
        assert_eq!(kind(404), ErrorKind::Conflict);
        assert_eq!(kind(401), ErrorKind::Policy);
        assert_eq!(kind(403), ErrorKind::Policy);
        assert_eq!(kind(502), ErrorKind::Transport);
    }

    #[test]
    fn test_error_detail_prefers_server_message() {
        assert_eq!(
            error_detail(StatusCode::CONFLICT, r#"{"error":"Order already paid"}"#),
            "Order already paid"
        );
        assert_eq!(
            error_detail(StatusCode::UNAUTHORIZED, ""),
            "API key is invalid or expired"
        );
        assert_eq!(
            error_detail(StatusCode::BAD_GATEWAY, "upstream down"),
            "POS server error (HTTP 502): upstream down"
        );
    }

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(unwrap_envelope(json!({"data": [1, 2]})), json!([1, 2]));
        assert_eq!(unwrap_envelope(json!({"open": true})), json!({"open": true}));
    }

    #[test]
    fn test_list_query() {
        assert_eq!(list_query(&OrderFilter::default()), "");
        let filter = OrderFilter {
            status: Some(OrderStatus::PendingPayment),
            date: NaiveDate::from_ymd_opt(2024, 3, 9),
        };
        assert_eq!(list_query(&filter), "?status=pending_payment&date=2024-03-09");
    }

    #[test]
    fn test_client_requires_url_and_key() {
        let mut cfg = EngineConfig::default();
        assert!(ApiClient::new(&cfg).is_err());
        cfg.api_url = "kasir.example.com/api/".into();
        assert!(ApiClient::new(&cfg).is_err());
        cfg.api_key = "k-123".into();
        let client = ApiClient::new(&cfg).unwrap();
        assert_eq!(client.url("/api/pos/orders"), "https://kasir.example.com/api/pos/orders");
    }
}
