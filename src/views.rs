//! Derived view models for the order screen and the shift panel.
//!
//! Everything here is a pure function of the displayed state, so the UI
//! can recompute on every watch notification.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::models::{Order, OrderStatus, OrderType, PaymentStatus};
use crate::shifts::ShiftBalance;

/// Format an amount as Rupiah with `.` thousands separators, no decimals.
pub fn format_rupiah(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let digits = rounded.abs().trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("-Rp {grouped}")
    } else {
        format!("Rp {grouped}")
    }
}

// ---------------------------------------------------------------------------
// Order list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderTab {
    /// Everything still being worked on.
    #[default]
    Active,
    Status(OrderStatus),
}

impl OrderTab {
    pub fn matches(self, order: &Order) -> bool {
        if order.archived {
            return false;
        }
        match self {
            OrderTab::Active => !order.is_terminal(),
            OrderTab::Status(status) => order.status == status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderSort {
    #[default]
    Oldest,
    Newest,
    HighestTotal,
}

#[derive(Debug, Clone, Default)]
pub struct OrderQuery {
    pub tab: OrderTab,
    pub search: Option<String>,
    pub sort: OrderSort,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRow {
    pub id: String,
    pub title: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub total: String,
    pub item_count: u32,
    /// An action on this order is on the wire; its controls are disabled.
    pub busy: bool,
}

fn title(order: &Order) -> String {
    let place = match (order.order_type, order.table_id.as_deref()) {
        (OrderType::DineIn, Some(table)) => format!("Table {table}"),
        _ => "Take away".to_string(),
    };
    match order.customer_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("{name} · {place}"),
        _ => place,
    }
}

fn matches_search(order: &Order, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    let hit = |s: &str| s.to_lowercase().contains(&needle);
    hit(&order.id)
        || order.customer_name.as_deref().is_some_and(hit)
        || order.table_id.as_deref().is_some_and(hit)
        || order.items().iter().any(|i| hit(&i.name))
}

pub fn order_rows(
    orders: &[Order],
    query: &OrderQuery,
    is_busy: impl Fn(&str) -> bool,
) -> Vec<OrderRow> {
    let search = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let mut visible: Vec<&Order> = orders
        .iter()
        .filter(|o| query.tab.matches(o))
        .filter(|o| search.map_or(true, |s| matches_search(o, s)))
        .collect();

    match query.sort {
        OrderSort::Oldest => visible.sort_by_key(|o| o.created_at),
        OrderSort::Newest => visible.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        OrderSort::HighestTotal => visible.sort_by(|a, b| b.total().cmp(&a.total())),
    }

    visible
        .into_iter()
        .map(|o| OrderRow {
            id: o.id.clone(),
            title: title(o),
            status: o.status,
            payment_status: o.payment_status,
            total: format_rupiah(o.total()),
            item_count: o.items().iter().map(|i| i.quantity).sum(),
            busy: is_busy(&o.id),
        })
        .collect()
}

/// Badge counts for the status tabs.
pub fn tab_counts(orders: &[Order]) -> Vec<(OrderTab, usize)> {
    let tabs = [
        OrderTab::Active,
        OrderTab::Status(OrderStatus::New),
        OrderTab::Status(OrderStatus::PendingPayment),
        OrderTab::Status(OrderStatus::Process),
        OrderTab::Status(OrderStatus::Done),
        OrderTab::Status(OrderStatus::Cancel),
    ];
    tabs.into_iter()
        .map(|tab| (tab, orders.iter().filter(|o| tab.matches(o)).count()))
        .collect()
}

// ---------------------------------------------------------------------------
// Shift panel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceView {
    pub open: bool,
    pub cashier_name: Option<String>,
    pub opening_float: String,
    pub cash_total: String,
    pub non_cash_total: String,
    pub total_takings: String,
}

impl From<&ShiftBalance> for BalanceView {
    fn from(b: &ShiftBalance) -> Self {
        Self {
            open: b.open,
            cashier_name: b.cashier_name.clone(),
            opening_float: format_rupiah(b.opening_float),
            cash_total: format_rupiah(b.cash_total),
            non_cash_total: format_rupiah(b.non_cash_total),
            total_takings: format_rupiah(b.total_takings()),
        }
    }
}
