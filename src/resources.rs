//! Server-side collaborators the engine talks to.
//!
//! `api::ApiClient` implements these over HTTP; tests use
//! `testing::FakeBackend`.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::PosResult;
use crate::models::{Order, OrderDraft, OrderStatus, PaymentMethod, TableStatus};
use crate::shifts::{ShiftBalance, ShiftCloseSummary};

/// Filter for `OrderResource::list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl OrderFilter {
    pub fn business_day(date: NaiveDate) -> Self {
        Self {
            status: None,
            date: Some(date),
        }
    }
}

#[async_trait]
pub trait OrderResource: Send + Sync {
    async fn create(&self, draft: &OrderDraft) -> PosResult<Order>;

    async fn list(&self, filter: &OrderFilter) -> PosResult<Vec<Order>>;

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: Option<&str>,
    ) -> PosResult<Order>;

    async fn confirm_payment(&self, order_id: &str, method: PaymentMethod) -> PosResult<Order>;

    /// Merge the given orders; returns the surviving order.
    async fn merge(&self, order_ids: &[String]) -> PosResult<Order>;
}

#[async_trait]
pub trait ShiftResource: Send + Sync {
    async fn current_balance(&self) -> PosResult<ShiftBalance>;

    async fn start_shift(&self, opening_float: Decimal) -> PosResult<ShiftBalance>;

    async fn close_shift(&self, ending_cash_count: Decimal) -> PosResult<ShiftCloseSummary>;

    async fn record_expense(&self, amount: Decimal, description: &str) -> PosResult<ShiftBalance>;
}

#[async_trait]
pub trait TableResource: Send + Sync {
    async fn update_status(&self, table_id: &str, status: TableStatus) -> PosResult<()>;
}
