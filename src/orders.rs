//! Order store: the locally displayed list of today's orders.
//!
//! The server owns the orders; this store mirrors them through an
//! `OptimisticCell` and serialises mutations per order id. A second action
//! on an order whose previous action is still on the wire is rejected,
//! while actions on other orders proceed independently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OrderPolicy;
use crate::error::{ErrorKind, PosError, PosResult};
use crate::models::{Order, OrderDraft, OrderStatus, PaymentStatus};
use crate::optimistic::{MutationTicket, OptimisticCell, Revalidation};
use crate::order_machine;
use crate::resources::{OrderFilter, OrderResource};

/// Prefix of ids given to orders that exist only locally so far.
pub const LOCAL_ID_PREFIX: &str = "local-";

// ---------------------------------------------------------------------------
// In-flight markers
// ---------------------------------------------------------------------------

/// Marks order ids as being mutated; released on drop.
pub(crate) struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    ids: Vec<String>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        for id in &self.ids {
            set.remove(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct OrderStore {
    cell: OptimisticCell<Vec<Order>>,
    resource: Arc<dyn OrderResource>,
    in_flight: Mutex<HashSet<String>>,
    filter: Mutex<OrderFilter>,
}

impl OrderStore {
    pub fn new(resource: Arc<dyn OrderResource>) -> Self {
        Self {
            cell: OptimisticCell::new("orders", Vec::new()),
            resource,
            in_flight: Mutex::new(HashSet::new()),
            filter: Mutex::new(OrderFilter::default()),
        }
    }

    pub(crate) fn resource(&self) -> &Arc<dyn OrderResource> {
        &self.resource
    }

    /// Restrict revalidation to one business day.
    pub fn set_filter(&self, filter: OrderFilter) {
        *self.filter.lock().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    fn current_filter(&self) -> OrderFilter {
        self.filter.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All orders as displayed, including archived and finished ones.
    pub fn orders(&self) -> Vec<Order> {
        self.cell.current()
    }

    pub fn confirmed_orders(&self) -> Vec<Order> {
        self.cell.confirmed()
    }

    pub fn get(&self, order_id: &str) -> Option<Order> {
        self.cell.current().into_iter().find(|o| o.id == order_id)
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Vec<Order>> {
        self.cell.subscribe()
    }

    pub fn hydrate(&self, orders: Vec<Order>) -> bool {
        self.cell.hydrate(orders)
    }

    /// Whether a control for this order should be disabled.
    pub fn is_busy(&self, order_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(order_id)
    }

    /// Claim all `ids` for one action, or none of them.
    pub(crate) fn claim(&self, ids: &[String]) -> PosResult<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(busy) = ids.iter().find(|id| set.contains(*id)) {
            return Err(PosError::InFlight(busy.clone()));
        }
        for id in ids {
            set.insert(id.clone());
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            ids: ids.to_vec(),
        })
    }

    pub async fn revalidate(&self) -> PosResult<Revalidation> {
        let filter = self.current_filter();
        let resource = self.resource.clone();
        self.cell
            .revalidate(|| async move {
                let mut orders = resource.list(&filter).await?;
                orders.sort_by_key(|o| o.created_at);
                Ok(orders)
            })
            .await
    }

    /// Fetch the authoritative list without touching the displayed one.
    pub(crate) async fn fetch_authoritative(&self) -> PosResult<Vec<Order>> {
        self.resource.list(&self.current_filter()).await
    }

    async fn settle_revalidate(&self, ready: bool) {
        if !ready {
            return;
        }
        if let Err(e) = self.revalidate().await {
            warn!("order revalidation after mutation failed: {e}");
        }
    }

    pub(crate) fn apply(
        &self,
        label: impl Into<String>,
        mutation: impl Fn(&Vec<Order>) -> Vec<Order> + Send + Sync + 'static,
    ) -> MutationTicket<Vec<Order>> {
        self.cell.apply(label, mutation)
    }

    pub(crate) async fn commit(&self, ticket: MutationTicket<Vec<Order>>) {
        let ready = self.cell.commit(ticket);
        self.settle_revalidate(ready).await;
    }

    /// Undo `ticket` after its request failed with `cause`. A conflict
    /// means the displayed list is out of date, so it is refreshed too.
    pub(crate) async fn rollback(&self, ticket: MutationTicket<Vec<Order>>, cause: &PosError) {
        let ready = self.cell.rollback(ticket);
        self.settle_revalidate(ready || cause.kind() == ErrorKind::Conflict)
            .await;
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Create an order. It shows up immediately under a local id and is
    /// replaced by the server's copy on revalidation.
    pub async fn create(&self, draft: &OrderDraft) -> PosResult<Order> {
        draft.validate()?;

        let local = draft.to_order(format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()), Utc::now());
        let local_id = local.id.clone();
        let _guard = self.claim(std::slice::from_ref(&local_id))?;
        let ticket = self.apply(format!("create {local_id}"), move |orders| {
            let mut next = orders.clone();
            next.push(local.clone());
            next
        });

        match self.resource.create(draft).await {
            Ok(order) => {
                info!(order_id = %order.id, total = %order.total(), order_type = ?order.order_type, "Order created");
                self.commit(ticket).await;
                Ok(order)
            }
            Err(e) => {
                warn!(local_id = %local_id, "Order create failed: {e}");
                self.rollback(ticket, &e).await;
                Err(e)
            }
        }
    }

    /// Move an order to `target`. Guards run before any request.
    pub async fn transition(
        &self,
        order_id: &str,
        target: OrderStatus,
        reason: Option<&str>,
        policy: &OrderPolicy,
    ) -> PosResult<Order> {
        let id = order_id.to_string();
        let _guard = self.claim(std::slice::from_ref(&id))?;

        let order = self
            .get(order_id)
            .ok_or_else(|| PosError::NotFound(order_id.to_string()))?;
        if order.id.starts_with(LOCAL_ID_PREFIX) {
            return Err(PosError::validation("Order is still being created"));
        }
        order_machine::check_transition(&order, target, policy)?;
        let reason = match target {
            OrderStatus::Cancel => Some(order_machine::validate_cancel_reason(
                reason.unwrap_or_default(),
            )?),
            _ => None,
        };

        let local_reason = reason.clone();
        let ticket = self.apply(format!("{id} -> {}", target.as_str()), move |orders| {
            orders
                .iter()
                .map(|o| {
                    if o.id != id {
                        return o.clone();
                    }
                    let mut o = o.clone();
                    o.status = target;
                    if target == OrderStatus::Cancel {
                        o.cancel_reason = local_reason.clone();
                        if o.payment_status == PaymentStatus::Paid {
                            o.payment_status = PaymentStatus::Refunded;
                        }
                    }
                    o
                })
                .collect()
        });

        match self
            .resource
            .update_status(order_id, target, reason.as_deref())
            .await
        {
            Ok(updated) => {
                info!(
                    order_id = %order_id,
                    from = order.status.as_str(),
                    to = target.as_str(),
                    "Order status updated"
                );
                self.commit(ticket).await;
                Ok(updated)
            }
            Err(e) => {
                warn!(order_id = %order_id, to = target.as_str(), "Order status update failed: {e}");
                self.rollback(ticket, &e).await;
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
