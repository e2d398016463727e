//! Order, line item and table types shared by every engine component.
//!
//! `Order` keeps its line items and total private: the only way to change
//! the items is through methods that recompute the total in the same call,
//! and orders decoded from the server are normalised the same way.

use chrono::{DateTime, Local, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PosError, PosResult};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PendingPayment,
    Process,
    Done,
    Cancel,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Done | OrderStatus::Cancel)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Process => "process",
            OrderStatus::Done => "done",
            OrderStatus::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Qris,
    Bank,
    Ewallet,
}

impl PaymentMethod {
    /// Cash goes into the drawer; everything else is a non-cash total.
    pub fn is_cash(self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    DineIn,
    TakeAway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Available,
    Occupied,
    Reserved,
    Dirty,
}

// ---------------------------------------------------------------------------
// Line items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub menu_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl LineItem {
    pub fn new(menu_id: impl Into<String>, name: impl Into<String>, quantity: u32, unit_price: Decimal) -> Self {
        Self {
            menu_id: menu_id.into(),
            name: name.into(),
            quantity,
            unit_price,
            note: None,
        }
    }

    pub fn subtotal(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Wire form of a line item; `subtotal` is informational and recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItemRecord {
    #[serde(flatten)]
    item: LineItem,
    #[serde(default)]
    subtotal: Decimal,
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OrderRecord", into = "OrderRecord")]
pub struct Order {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub business_date: NaiveDate,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub order_type: OrderType,
    pub table_id: Option<String>,
    items: Vec<LineItem>,
    total: Decimal,
    pub payment_method: Option<PaymentMethod>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub notes: Option<String>,
    pub archived: bool,
    pub cancel_reason: Option<String>,
}

impl Order {
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    /// Replace the line items and recompute the total.
    pub fn set_items(&mut self, items: Vec<LineItem>) {
        self.items = items;
        self.total = sum_subtotals(&self.items);
    }

    pub fn push_item(&mut self, item: LineItem) {
        self.items.push(item);
        self.total = sum_subtotals(&self.items);
    }

    /// Append another order's items verbatim (no de-duplication).
    pub fn absorb_items(&mut self, other: &Order) {
        self.items.extend(other.items.iter().cloned());
        self.total = sum_subtotals(&self.items);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Listed in active views: not finished, not cancelled, not merged away.
    pub fn is_active(&self) -> bool {
        !self.archived && !self.status.is_terminal()
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }
}

fn sum_subtotals(items: &[LineItem]) -> Decimal {
    items.iter().map(LineItem::subtotal).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRecord {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    business_date: Option<NaiveDate>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    customer_phone: Option<String>,
    order_type: OrderType,
    #[serde(default)]
    table_id: Option<String>,
    #[serde(default)]
    items: Vec<LineItemRecord>,
    #[serde(default)]
    total: Decimal,
    #[serde(default)]
    payment_method: Option<PaymentMethod>,
    status: OrderStatus,
    #[serde(default)]
    payment_status: PaymentStatus,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    cancel_reason: Option<String>,
}

impl From<OrderRecord> for Order {
    fn from(rec: OrderRecord) -> Self {
        let items: Vec<LineItem> = rec.items.into_iter().map(|r| r.item).collect();
        let total = sum_subtotals(&items);
        if total != rec.total {
            warn!(
                order_id = %rec.id,
                reported = %rec.total,
                computed = %total,
                "Order total disagrees with line items, using computed total"
            );
        }
        Order {
            business_date: rec
                .business_date
                .unwrap_or_else(|| rec.created_at.with_timezone(&Local).date_naive()),
            id: rec.id,
            created_at: rec.created_at,
            customer_name: rec.customer_name,
            customer_phone: rec.customer_phone,
            order_type: rec.order_type,
            table_id: rec.table_id,
            items,
            total,
            payment_method: rec.payment_method,
            status: rec.status,
            payment_status: rec.payment_status,
            notes: rec.notes,
            archived: rec.archived,
            cancel_reason: rec.cancel_reason,
        }
    }
}

impl From<Order> for OrderRecord {
    fn from(order: Order) -> Self {
        OrderRecord {
            id: order.id,
            created_at: order.created_at,
            business_date: Some(order.business_date),
            customer_name: order.customer_name,
            customer_phone: order.customer_phone,
            order_type: order.order_type,
            table_id: order.table_id,
            items: order
                .items
                .into_iter()
                .map(|item| LineItemRecord {
                    subtotal: item.subtotal(),
                    item,
                })
                .collect(),
            total: order.total,
            payment_method: order.payment_method,
            status: order.status,
            payment_status: order.payment_status,
            notes: order.notes,
            archived: order.archived,
            cancel_reason: order.cancel_reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Order draft (create payload)
// ---------------------------------------------------------------------------

/// What staff fill in on the order screen before the order exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_phone: Option<String>,
    pub order_type: OrderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    pub items: Vec<LineItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OrderDraft {
    pub fn dine_in(table_id: impl Into<String>, items: Vec<LineItem>) -> Self {
        Self {
            customer_name: None,
            customer_phone: None,
            order_type: OrderType::DineIn,
            table_id: Some(table_id.into()),
            items,
            payment_method: None,
            notes: None,
        }
    }

    pub fn take_away(items: Vec<LineItem>) -> Self {
        Self {
            customer_name: None,
            customer_phone: None,
            order_type: OrderType::TakeAway,
            table_id: None,
            items,
            payment_method: None,
            notes: None,
        }
    }

    pub fn validate(&self) -> PosResult<()> {
        if self.items.is_empty() {
            return Err(PosError::validation("Order must contain at least one item"));
        }
        if let Some(item) = self.items.iter().find(|i| i.quantity == 0) {
            return Err(PosError::validation(format!(
                "Quantity for {} must be at least 1",
                item.name
            )));
        }
        if let Some(item) = self.items.iter().find(|i| i.unit_price.is_sign_negative()) {
            return Err(PosError::validation(format!(
                "Price for {} cannot be negative",
                item.name
            )));
        }
        let has_table = self
            .table_id
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        match (self.order_type, has_table) {
            (OrderType::DineIn, false) => {
                Err(PosError::validation("Dine-in orders need a table"))
            }
            (OrderType::TakeAway, true) => {
                Err(PosError::validation("Take-away orders cannot reference a table"))
            }
            _ => Ok(()),
        }
    }

    /// Build the order as it will look once created, under a local id.
    pub fn to_order(&self, id: impl Into<String>, now: DateTime<Utc>) -> Order {
        let items = self.items.clone();
        let total = sum_subtotals(&items);
        Order {
            id: id.into(),
            created_at: now,
            business_date: now.with_timezone(&Local).date_naive(),
            customer_name: self.customer_name.clone(),
            customer_phone: self.customer_phone.clone(),
            order_type: self.order_type,
            table_id: self.table_id.clone(),
            items,
            total,
            payment_method: self.payment_method,
            status: OrderStatus::New,
            payment_status: PaymentStatus::Unpaid,
            notes: self.notes.clone(),
            archived: false,
            cancel_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub number: u32,
    pub capacity: u32,
    pub status: TableStatus,
}

// ===========================================================================
// Tests
// ===========================================================================
