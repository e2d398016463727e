//! Bill merge.
//!
//! Merging folds several open orders into the earliest-created one. The
//! survivor's items become the concatenation of every selected order's
//! items (in creation order, no de-duplication), its total the sum of all
//! totals. The others are archived. Validation runs against the displayed
//! list first and again against a fresh fetch, so a merge that another
//! terminal invalidated is rejected as a whole.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PosError, PosResult};
use crate::models::{LineItem, Order, OrderType};
use crate::orders::{OrderStore, LOCAL_ID_PREFIX};

/// What the merge dialog shows before the cashier confirms.
///
/// A preview only exists for open, unarchived orders. This terminal also
/// keeps paid orders out of merges, so every order in a preview is unpaid.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub survivor_id: String,
    pub absorbed_ids: Vec<String>,
    pub items: Vec<LineItem>,
    pub total: Decimal,
    pub table_id: Option<String>,
    pub order_type: OrderType,
    /// Non-blocking notes, e.g. orders sitting at different tables.
    pub warnings: Vec<String>,
}

/// Validate a merge of `ids` against `orders` and describe its result.
pub fn plan_merge(orders: &[Order], ids: &[String]) -> PosResult<MergePreview> {
    if ids.len() < 2 {
        return Err(PosError::validation("Select at least two orders to merge"));
    }

    let mut selected: Vec<&Order> = Vec::with_capacity(ids.len());
    for id in ids {
        if selected.iter().any(|o| &o.id == id) {
            return Err(PosError::validation(format!("Order {id} was selected twice")));
        }
        let order = orders
            .iter()
            .find(|o| &o.id == id)
            .ok_or_else(|| PosError::validation(format!("Order {id} is no longer on the list")))?;
        if order.archived {
            return Err(PosError::validation(format!(
                "Order {id} was already merged into another order"
            )));
        }
        if order.is_terminal() {
            return Err(PosError::validation(format!(
                "Order {id} is already {}",
                order.status.as_str()
            )));
        }
        // Local restriction on top of the open-order rule: a paid bill is
        // already counted in the shift, so it is never folded into another.
        if order.is_paid() {
            return Err(PosError::validation(format!(
                "Order {id} is already paid; this terminal does not merge paid bills"
            )));
        }
        if order.id.starts_with(LOCAL_ID_PREFIX) {
            return Err(PosError::validation("An order is still being created"));
        }
        selected.push(order);
    }
    selected.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let survivor = selected[0];
    let items: Vec<LineItem> = selected.iter().flat_map(|o| o.items().iter().cloned()).collect();
    let total = selected.iter().map(|o| o.total()).sum();

    let mut warnings = Vec::new();
    let other_tables: Vec<&str> = selected[1..]
        .iter()
        .filter_map(|o| o.table_id.as_deref())
        .filter(|t| survivor.table_id.as_deref() != Some(*t))
        .collect();
    if !other_tables.is_empty() {
        warnings.push(format!(
            "Merged bill stays with order {}; tables {} are not released automatically",
            survivor.id,
            other_tables.join(", ")
        ));
    }
    if selected.iter().any(|o| o.order_type != survivor.order_type) {
        warnings.push("Selected orders mix dine-in and take-away".to_string());
    }

    Ok(MergePreview {
        survivor_id: survivor.id.clone(),
        absorbed_ids: selected[1..].iter().map(|o| o.id.clone()).collect(),
        items,
        total,
        table_id: survivor.table_id.clone(),
        order_type: survivor.order_type,
        warnings,
    })
}

/// Apply `preview` to a list: the survivor takes all items, the absorbed
/// orders are archived. Orders not named in the preview are untouched.
pub fn apply_merge(orders: &[Order], preview: &MergePreview) -> Vec<Order> {
    orders
        .iter()
        .map(|o| {
            let mut o = o.clone();
            if o.id == preview.survivor_id {
                o.set_items(preview.items.clone());
            } else if preview.absorbed_ids.contains(&o.id) {
                o.archived = true;
            }
            o
        })
        .collect()
}

/// Merge the given orders. Returns the surviving order as the server
/// reports it.
pub async fn merge_orders(store: &OrderStore, ids: &[String]) -> PosResult<Order> {
    let _guard = store.claim(ids)?;
    plan_merge(&store.orders(), ids)?;

    let fresh = store.fetch_authoritative().await?;
    let preview = plan_merge(&fresh, ids).map_err(|e| PosError::Conflict(e.to_string()))?;
    for warning in &preview.warnings {
        warn!(survivor = %preview.survivor_id, "{warning}");
    }

    let planned = preview.clone();
    let ticket = store.apply(format!("merge into {}", preview.survivor_id), move |list| {
        apply_merge(list, &planned)
    });

    match store.resource().merge(ids).await {
        Ok(survivor) => {
            info!(
                survivor = %survivor.id,
                absorbed = ?preview.absorbed_ids,
                total = %survivor.total(),
                "Orders merged"
            );
            store.commit(ticket).await;
            Ok(survivor)
        }
        Err(e) => {
            warn!(survivor = %preview.survivor_id, "Merge failed: {e}");
            store.rollback(ticket, &e).await;
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
