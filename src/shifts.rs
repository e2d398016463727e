//! Shift ledger for Kasir Core.
//!
//! Tracks whether the cash register session is open, its opening float and
//! running cash / non-cash totals. All balance arithmetic is done by pure
//! functions on `ShiftBalance` so the optimistic layer can replay it.
//!
//! Invariants:
//! - cash total = opening float + paid cash orders - cash expenditures
//! - non-cash total = paid qris/bank/e-wallet orders
//! - every paid order contributes exactly once; a rolled back attempt
//!   contributes nothing

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ErrorKind, PosError, PosResult};
use crate::models::PaymentMethod;
use crate::optimistic::{MutationTicket, OptimisticCell, Revalidation};
use crate::resources::ShiftResource;
use crate::session::Session;

// ---------------------------------------------------------------------------
// Balance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftBalance {
    pub open: bool,
    #[serde(default)]
    pub cashier_name: Option<String>,
    #[serde(default)]
    pub opening_float: Decimal,
    #[serde(default)]
    pub cash_total: Decimal,
    #[serde(default)]
    pub non_cash_total: Decimal,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl ShiftBalance {
    pub fn closed() -> Self {
        Self {
            open: false,
            cashier_name: None,
            opening_float: Decimal::ZERO,
            cash_total: Decimal::ZERO,
            non_cash_total: Decimal::ZERO,
            started_at: None,
        }
    }

    pub fn opened(cashier_name: impl Into<String>, opening_float: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            open: true,
            cashier_name: Some(cashier_name.into()),
            opening_float,
            cash_total: opening_float,
            non_cash_total: Decimal::ZERO,
            started_at: Some(at),
        }
    }

    /// Balance after an order of `amount` was paid with `method`.
    pub fn with_payment(&self, method: PaymentMethod, amount: Decimal) -> Self {
        let mut next = self.clone();
        if method.is_cash() {
            next.cash_total += amount;
        } else {
            next.non_cash_total += amount;
        }
        next
    }

    /// Balance after cash was taken out of the drawer for an expense.
    pub fn with_expense(&self, amount: Decimal) -> Self {
        let mut next = self.clone();
        next.cash_total -= amount;
        next
    }

    pub fn expected_cash(&self) -> Decimal {
        self.cash_total
    }

    pub fn total_takings(&self) -> Decimal {
        self.cash_total - self.opening_float + self.non_cash_total
    }
}

impl Default for ShiftBalance {
    fn default() -> Self {
        Self::closed()
    }
}

/// Result of closing a shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftCloseSummary {
    pub cashier_name: Option<String>,
    pub opening_float: Decimal,
    pub expected_cash: Decimal,
    pub counted_cash: Decimal,
    /// counted - expected; negative means the drawer is short.
    pub variance: Decimal,
    pub non_cash_total: Decimal,
    pub closed_at: DateTime<Utc>,
}

impl ShiftCloseSummary {
    pub fn compute(balance: &ShiftBalance, counted_cash: Decimal, closed_at: DateTime<Utc>) -> Self {
        let expected_cash = balance.expected_cash();
        Self {
            cashier_name: balance.cashier_name.clone(),
            opening_float: balance.opening_float,
            expected_cash,
            counted_cash,
            variance: counted_cash - expected_cash,
            non_cash_total: balance.non_cash_total,
            closed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Access gate
// ---------------------------------------------------------------------------

/// Check that `session` may advance orders given the displayed balance.
///
/// Privileged roles are not bound to a shift but only observe the order
/// screen; cashiers need an open shift.
pub fn authorize_order_action(session: &Session, balance: &ShiftBalance) -> PosResult<()> {
    if session.role.is_privileged() {
        return Err(PosError::policy(
            "Admin and owner accounts can view orders but not change them",
        ));
    }
    if !balance.open {
        return Err(PosError::policy("Open a shift before handling orders"));
    }
    Ok(())
}

fn authorize_drawer_action(session: &Session) -> PosResult<()> {
    if session.role.is_privileged() {
        return Err(PosError::policy("Only cashiers operate the cash drawer"));
    }
    Ok(())
}

fn validate_amount(amount: Decimal, what: &str) -> PosResult<()> {
    if amount.is_sign_negative() {
        return Err(PosError::validation(format!("{what} cannot be negative")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Locally displayed shift balance, kept in step with the server.
pub struct ShiftLedger {
    cell: OptimisticCell<ShiftBalance>,
    resource: Arc<dyn ShiftResource>,
}

impl ShiftLedger {
    pub fn new(resource: Arc<dyn ShiftResource>) -> Self {
        Self {
            cell: OptimisticCell::new("shift", ShiftBalance::closed()),
            resource,
        }
    }

    pub fn balance(&self) -> ShiftBalance {
        self.cell.current()
    }

    /// Balance as last reported by the server.
    pub fn confirmed(&self) -> ShiftBalance {
        self.cell.confirmed()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ShiftBalance> {
        self.cell.subscribe()
    }

    pub fn hydrate(&self, balance: ShiftBalance) -> bool {
        self.cell.hydrate(balance)
    }

    pub async fn revalidate(&self) -> PosResult<Revalidation> {
        let resource = self.resource.clone();
        self.cell
            .revalidate(|| async move { resource.current_balance().await })
            .await
    }

    /// Revalidate after a settle, logging rather than failing: the mutation
    /// itself already succeeded or was rolled back.
    async fn settle_revalidate(&self, ready: bool) {
        if !ready {
            return;
        }
        if let Err(e) = self.revalidate().await {
            warn!("shift revalidation after mutation failed: {e}");
        }
    }

    /// Optimistically count a payment. Used by the payment flow, which owns
    /// the request and settles the ticket.
    pub(crate) fn apply_payment(&self, method: PaymentMethod, amount: Decimal) -> MutationTicket<ShiftBalance> {
        self.cell.apply(format!("payment {method:?} {amount}"), move |b| {
            b.with_payment(method, amount)
        })
    }

    pub(crate) async fn commit(&self, ticket: MutationTicket<ShiftBalance>) {
        let ready = self.cell.commit(ticket);
        self.settle_revalidate(ready).await;
    }

    /// Undo `ticket` after its request failed with `cause`. A conflict
    /// (e.g. the shift was closed elsewhere) refreshes the balance too.
    pub(crate) async fn rollback(&self, ticket: MutationTicket<ShiftBalance>, cause: &PosError) {
        let ready = self.cell.rollback(ticket);
        self.settle_revalidate(ready || cause.kind() == ErrorKind::Conflict)
            .await;
    }

    pub async fn start_shift(&self, session: &Session, opening_float: Decimal) -> PosResult<ShiftBalance> {
        authorize_drawer_action(session)?;
        validate_amount(opening_float, "Opening float")?;
        if self.balance().open {
            return Err(PosError::validation("A shift is already open"));
        }

        let cashier = session.operator_name.clone();
        let now = Utc::now();
        let ticket = self.cell.apply("start shift", move |_| {
            ShiftBalance::opened(cashier.clone(), opening_float, now)
        });

        match self.resource.start_shift(opening_float).await {
            Ok(balance) => {
                info!(cashier = %session.operator_name, opening_float = %opening_float, "Shift opened");
                self.commit(ticket).await;
                Ok(balance)
            }
            Err(e) => {
                self.rollback(ticket, &e).await;
                Err(e)
            }
        }
    }

    /// Summary the close dialog shows before the count is submitted.
    pub fn close_preview(&self, counted_cash: Decimal) -> ShiftCloseSummary {
        ShiftCloseSummary::compute(&self.balance(), counted_cash, Utc::now())
    }

    pub async fn close_shift(&self, session: &Session, counted_cash: Decimal) -> PosResult<ShiftCloseSummary> {
        authorize_drawer_action(session)?;
        validate_amount(counted_cash, "Counted cash")?;
        if !self.balance().open {
            return Err(PosError::validation("No shift is open"));
        }
        if self.cell.in_flight() > 0 {
            return Err(PosError::validation(
                "Wait for pending payments to finish before closing the shift",
            ));
        }

        let ticket = self.cell.apply("close shift", |_| ShiftBalance::closed());
        match self.resource.close_shift(counted_cash).await {
            Ok(summary) => {
                info!(
                    cashier = %session.operator_name,
                    expected = %summary.expected_cash,
                    counted = %summary.counted_cash,
                    variance = %summary.variance,
                    "Shift closed"
                );
                self.commit(ticket).await;
                Ok(summary)
            }
            Err(e) => {
                self.rollback(ticket, &e).await;
                Err(e)
            }
        }
    }

    pub async fn record_expense(
        &self,
        session: &Session,
        amount: Decimal,
        description: &str,
    ) -> PosResult<ShiftBalance> {
        authorize_order_action(session, &self.balance())?;
        if amount <= Decimal::ZERO {
            return Err(PosError::validation("Expense amount must be positive"));
        }
        if description.trim().is_empty() {
            return Err(PosError::validation("Expense needs a description"));
        }
        if amount > self.balance().cash_total {
            return Err(PosError::validation("Expense exceeds the cash in the drawer"));
        }

        let ticket = self
            .cell
            .apply(format!("expense {amount}"), move |b| b.with_expense(amount));
        match self.resource.record_expense(amount, description.trim()).await {
            Ok(balance) => {
                info!(amount = %amount, description = description.trim(), "Cash expense recorded");
                self.commit(ticket).await;
                Ok(balance)
            }
            Err(e) => {
                self.rollback(ticket, &e).await;
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
