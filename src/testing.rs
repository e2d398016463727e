//! In-memory stand-in for the POS server used by the unit tests.
//!
//! Mirrors the server rules the engine relies on (conflicts on double
//! payment, archived or terminal orders, closed shift) and lets a test
//! inject failures or hold a request open to interleave actors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::error::{PosError, PosResult};
use crate::models::{Order, OrderDraft, OrderStatus, PaymentMethod, PaymentStatus, TableStatus};
use crate::resources::{OrderFilter, OrderResource, ShiftResource, TableResource};
use crate::shifts::{ShiftBalance, ShiftCloseSummary};

/// A request held open until the test releases it.
#[derive(Clone, Default)]
pub struct Gate {
    arrived: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    /// Wait until the held request reached the server.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
struct FakeState {
    orders: Vec<Order>,
    shift: ShiftBalance,
    tables: HashMap<String, TableStatus>,
    table_updates: Vec<(String, TableStatus)>,
    prepayment_required: bool,
    next_id: u64,
    requests: Vec<&'static str>,
    failures: VecDeque<(Option<&'static str>, PosError)>,
    gates: HashMap<&'static str, Gate>,
}

pub struct FakeBackend {
    state: Mutex<FakeState>,
    epoch: DateTime<Utc>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            epoch: Utc::now() - Duration::hours(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- test controls ------------------------------------------------------

    /// The next request of any kind fails with `err`.
    pub fn fail_next(&self, err: PosError) {
        self.lock().failures.push_back((None, err));
    }

    /// The next `op` request fails with `err`.
    pub fn fail_next_on(&self, op: &'static str, err: PosError) {
        self.lock().failures.push_back((Some(op), err));
    }

    /// Hold the next `op` request until the returned gate is released.
    pub fn hold_next(&self, op: &'static str) -> Gate {
        let gate = Gate::default();
        self.lock().gates.insert(op, gate.clone());
        gate
    }

    pub fn set_prepayment_required(&self, on: bool) {
        self.lock().prepayment_required = on;
    }

    pub fn open_shift(&self, cashier: &str, opening_float: Decimal) {
        self.lock().shift = ShiftBalance::opened(cashier, opening_float, Utc::now());
    }

    /// Insert an order directly, as if another terminal created it.
    pub fn seed_order(&self, draft: OrderDraft) -> Order {
        let mut state = self.lock();
        let order = self.new_order(&mut state, &draft);
        state.orders.push(order.clone());
        order
    }

    /// Change an order behind the engine's back.
    pub fn edit_order(&self, id: &str, f: impl FnOnce(&mut Order)) {
        let mut state = self.lock();
        if let Some(order) = state.orders.iter_mut().find(|o| o.id == id) {
            f(order);
        }
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.lock().orders.iter().find(|o| o.id == id).cloned()
    }

    pub fn shift_balance(&self) -> ShiftBalance {
        self.lock().shift.clone()
    }

    pub fn table_status(&self, table_id: &str) -> Option<TableStatus> {
        self.lock().tables.get(table_id).copied()
    }

    pub fn table_updates(&self) -> Vec<(String, TableStatus)> {
        self.lock().table_updates.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<&'static str> {
        self.lock().requests.clone()
    }

    // -- plumbing -----------------------------------------------------------

    fn new_order(&self, state: &mut FakeState, draft: &OrderDraft) -> Order {
        state.next_id += 1;
        let created_at = self.epoch + Duration::seconds(state.next_id as i64);
        draft.to_order(format!("ord-{}", state.next_id), created_at)
    }

    /// Record the request, wait on its gate if any, then pop a failure.
    async fn enter(&self, op: &'static str) -> PosResult<()> {
        let gate = {
            let mut state = self.lock();
            state.requests.push(op);
            state.gates.remove(op)
        };
        if let Some(gate) = gate {
            gate.arrived.notify_one();
            gate.release.notified().await;
        }
        let mut state = self.lock();
        let pos = state
            .failures
            .iter()
            .position(|(target, _)| target.map_or(true, |t| t == op));
        match pos.and_then(|p| state.failures.remove(p)) {
            Some((_, err)) => Err(err),
            None => Ok(()),
        }
    }
}

fn find_open<'a>(state: &'a mut FakeState, id: &str) -> PosResult<&'a mut Order> {
    let order = state
        .orders
        .iter_mut()
        .find(|o| o.id == id)
        .ok_or_else(|| PosError::NotFound(id.to_string()))?;
    if order.archived {
        return Err(PosError::Conflict(format!("Order {id} was merged")));
    }
    if order.is_terminal() {
        return Err(PosError::Conflict(format!(
            "Order {id} is already {}",
            order.status.as_str()
        )));
    }
    Ok(order)
}

#[async_trait]
impl OrderResource for FakeBackend {
    async fn create(&self, draft: &OrderDraft) -> PosResult<Order> {
        self.enter("create").await?;
        let mut state = self.lock();
        let order = self.new_order(&mut state, draft);
        state.orders.push(order.clone());
        Ok(order)
    }

    async fn list(&self, filter: &OrderFilter) -> PosResult<Vec<Order>> {
        self.enter("list").await?;
        let state = self.lock();
        Ok(state
            .orders
            .iter()
            .filter(|o| filter.status.map_or(true, |s| o.status == s))
            .filter(|o| filter.date.map_or(true, |d| o.business_date == d))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: Option<&str>,
    ) -> PosResult<Order> {
        self.enter("update_status").await?;
        let mut state = self.lock();
        let order = find_open(&mut state, order_id)?;
        if status == OrderStatus::Done && !order.is_paid() {
            return Err(PosError::Conflict("Order is not paid".into()));
        }
        if status == OrderStatus::Cancel {
            let reason = reason.filter(|r| !r.trim().is_empty()).ok_or_else(|| {
                PosError::Conflict("Cancellation reason required".into())
            })?;
            order.cancel_reason = Some(reason.to_string());
            if order.is_paid() {
                order.payment_status = PaymentStatus::Refunded;
            }
        }
        order.status = status;
        Ok(order.clone())
    }

    async fn confirm_payment(&self, order_id: &str, method: PaymentMethod) -> PosResult<Order> {
        self.enter("confirm_payment").await?;
        let mut state = self.lock();
        if !state.shift.open {
            return Err(PosError::Conflict("Shift is closed".into()));
        }
        let prepayment = state.prepayment_required;
        let order = find_open(&mut state, order_id)?;
        if order.payment_status != PaymentStatus::Unpaid {
            return Err(PosError::Conflict(format!("Order {order_id} is already paid")));
        }
        order.payment_status = PaymentStatus::Paid;
        order.payment_method = Some(method);
        if prepayment && matches!(order.status, OrderStatus::New | OrderStatus::PendingPayment) {
            order.status = OrderStatus::Process;
        }
        let order = order.clone();
        state.shift = state.shift.with_payment(method, order.total());
        Ok(order)
    }

    async fn merge(&self, order_ids: &[String]) -> PosResult<Order> {
        self.enter("merge").await?;
        let mut state = self.lock();
        if order_ids.len() < 2 {
            return Err(PosError::Conflict("Select at least two orders".into()));
        }
        let mut selected = Vec::new();
        for id in order_ids {
            let order = find_open(&mut state, id)?;
            selected.push(order.clone());
        }
        selected.sort_by_key(|o| o.created_at);
        let mut survivor = selected[0].clone();
        for other in &selected[1..] {
            survivor.absorb_items(other);
        }
        for order in state.orders.iter_mut() {
            if order.id == survivor.id {
                *order = survivor.clone();
            } else if order_ids.contains(&order.id) {
                order.archived = true;
            }
        }
        Ok(survivor)
    }
}

#[async_trait]
impl ShiftResource for FakeBackend {
    async fn current_balance(&self) -> PosResult<ShiftBalance> {
        self.enter("current_balance").await?;
        Ok(self.lock().shift.clone())
    }

    async fn start_shift(&self, opening_float: Decimal) -> PosResult<ShiftBalance> {
        self.enter("start_shift").await?;
        let mut state = self.lock();
        if state.shift.open {
            return Err(PosError::Conflict("A shift is already open".into()));
        }
        state.shift = ShiftBalance::opened("Sari", opening_float, Utc::now());
        Ok(state.shift.clone())
    }

    async fn close_shift(&self, ending_cash_count: Decimal) -> PosResult<ShiftCloseSummary> {
        self.enter("close_shift").await?;
        let mut state = self.lock();
        if !state.shift.open {
            return Err(PosError::Conflict("No shift is open".into()));
        }
        let summary = ShiftCloseSummary::compute(&state.shift, ending_cash_count, Utc::now());
        state.shift = ShiftBalance::closed();
        Ok(summary)
    }

    async fn record_expense(&self, amount: Decimal, _description: &str) -> PosResult<ShiftBalance> {
        self.enter("record_expense").await?;
        let mut state = self.lock();
        if !state.shift.open {
            return Err(PosError::Conflict("No shift is open".into()));
        }
        state.shift = state.shift.with_expense(amount);
        Ok(state.shift.clone())
    }
}

#[async_trait]
impl TableResource for FakeBackend {
    async fn update_status(&self, table_id: &str, status: TableStatus) -> PosResult<()> {
        self.enter("table_status").await?;
        let mut state = self.lock();
        state.tables.insert(table_id.to_string(), status);
        state.table_updates.push((table_id.to_string(), status));
        Ok(())
    }
}
