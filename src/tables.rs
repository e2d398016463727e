//! Table state synchronizer.
//!
//! Table status is derived by rescanning the order list, never by counting.
//! A table turns `dirty` once the last active order on it is finished or
//! cancelled, and goes back to `available` when staff mark it cleaned.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PosError, PosResult};
use crate::models::{Order, OrderStatus, Table, TableStatus};
use crate::resources::TableResource;

pub fn has_active_orders(orders: &[Order], table_id: &str) -> bool {
    orders
        .iter()
        .any(|o| o.is_active() && o.table_id.as_deref() == Some(table_id))
}

/// Table that `finished` sat at, if it is now free of active orders.
pub fn table_needs_cleaning<'a>(finished: &'a Order, orders: &[Order]) -> Option<&'a str> {
    if !matches!(finished.status, OrderStatus::Done | OrderStatus::Cancel) {
        return None;
    }
    let table_id = finished.table_id.as_deref()?;
    (!has_active_orders(orders, table_id)).then_some(table_id)
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOverview {
    pub table: Table,
    pub active_orders: Vec<String>,
    pub outstanding: Decimal,
}

/// Per-table summary for the floor plan: active orders and unpaid amount.
pub fn table_overview(tables: &[Table], orders: &[Order]) -> Vec<TableOverview> {
    tables
        .iter()
        .map(|table| {
            let active: Vec<&Order> = orders
                .iter()
                .filter(|o| o.is_active() && o.table_id.as_deref() == Some(table.id.as_str()))
                .collect();
            TableOverview {
                table: table.clone(),
                active_orders: active.iter().map(|o| o.id.clone()).collect(),
                outstanding: active
                    .iter()
                    .filter(|o| !o.is_paid())
                    .map(|o| o.total())
                    .sum(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct TableSynchronizer {
    resource: Arc<dyn TableResource>,
}

impl TableSynchronizer {
    pub fn new(resource: Arc<dyn TableResource>) -> Self {
        Self { resource }
    }

    /// React to `finished` reaching `done` or `cancel`. Returns the status
    /// that was requested, if any.
    pub async fn on_order_finished(
        &self,
        finished: &Order,
        orders: &[Order],
    ) -> PosResult<Option<TableStatus>> {
        let Some(table_id) = table_needs_cleaning(finished, orders) else {
            debug!(order_id = %finished.id, "table still in use or not a dine-in order");
            return Ok(None);
        };
        self.resource
            .update_status(table_id, TableStatus::Dirty)
            .await
            .inspect_err(|e| warn!(table_id, "Failed to mark table dirty: {e}"))?;
        info!(table_id, order_id = %finished.id, "Table marked dirty");
        Ok(Some(TableStatus::Dirty))
    }

    /// A dine-in order was created for `table_id`.
    pub async fn occupy(&self, table_id: &str) -> PosResult<()> {
        self.resource
            .update_status(table_id, TableStatus::Occupied)
            .await?;
        info!(table_id, "Table occupied");
        Ok(())
    }

    /// Staff cleaned the table. Refused while orders are still open on it.
    pub async fn mark_cleaned(&self, table_id: &str, orders: &[Order]) -> PosResult<()> {
        if has_active_orders(orders, table_id) {
            return Err(PosError::validation(format!(
                "Table {table_id} still has open orders"
            )));
        }
        self.resource
            .update_status(table_id, TableStatus::Available)
            .await?;
        info!(table_id, "Table cleaned");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
