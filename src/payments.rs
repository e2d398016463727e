//! Payment confirmation.
//!
//! Confirming a payment touches two resources at once: the order (payment
//! status, and under prepayment its status) and the shift balance (cash or
//! non-cash running total). Both are updated optimistically, settled
//! together on success and rolled back together on failure, so a failed
//! attempt contributes nothing to the drawer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OrderPolicy;
use crate::error::{PosError, PosResult};
use crate::models::{Order, PaymentMethod, PaymentStatus};
use crate::order_machine::status_after_payment;
use crate::orders::{OrderStore, LOCAL_ID_PREFIX};
use crate::shifts::ShiftLedger;

// ---------------------------------------------------------------------------
// Request / receipt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub order_id: String,
    pub method: PaymentMethod,
    /// Cash handed over by the customer. Only used for the change figure.
    #[serde(default)]
    pub cash_received: Option<Decimal>,
}

impl PaymentRequest {
    pub fn new(order_id: impl Into<String>, method: PaymentMethod) -> Self {
        Self {
            order_id: order_id.into(),
            method,
            cash_received: None,
        }
    }

    pub fn cash(order_id: impl Into<String>, received: Decimal) -> Self {
        Self {
            order_id: order_id.into(),
            method: PaymentMethod::Cash,
            cash_received: Some(received),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub order: Order,
    /// `None` for non-cash payments or when no received amount was given.
    pub change_due: Option<Decimal>,
}

/// Change to hand back. Negative when the customer handed over too little;
/// the cashier decides what to do, the payment is not blocked.
pub fn change_due(total: Decimal, received: Decimal) -> Decimal {
    received - total
}

/// Local precondition for confirming payment on `order`.
pub fn check_payable(order: &Order) -> PosResult<()> {
    if order.archived {
        return Err(PosError::validation(format!(
            "Order {} was merged into another order",
            order.id
        )));
    }
    if order.is_terminal() {
        return Err(PosError::validation(format!(
            "Order {} is already {}",
            order.id,
            order.status.as_str()
        )));
    }
    if order.payment_status != PaymentStatus::Unpaid {
        return Err(PosError::validation(format!(
            "Order {} is already paid",
            order.id
        )));
    }
    if order.id.starts_with(LOCAL_ID_PREFIX) {
        return Err(PosError::validation("Order is still being created"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Confirm payment for one order.
///
/// The caller is responsible for the session/shift gate.
pub async fn confirm_payment(
    orders: &OrderStore,
    ledger: &ShiftLedger,
    req: &PaymentRequest,
    policy: &OrderPolicy,
) -> PosResult<PaymentReceipt> {
    let _guard = orders.claim(std::slice::from_ref(&req.order_id))?;
    let order = orders
        .get(&req.order_id)
        .ok_or_else(|| PosError::NotFound(req.order_id.clone()))?;
    check_payable(&order)?;

    let method = req.method;
    let total = order.total();
    let next_status = status_after_payment(&order, policy);
    let change = match (method.is_cash(), req.cash_received) {
        (true, Some(received)) => Some(change_due(total, received)),
        _ => None,
    };

    let id = order.id.clone();
    let order_ticket = orders.apply(format!("pay {id}"), move |list| {
        list.iter()
            .map(|o| {
                if o.id != id {
                    return o.clone();
                }
                let mut o = o.clone();
                o.payment_status = PaymentStatus::Paid;
                o.payment_method = Some(method);
                o.status = next_status;
                o
            })
            .collect()
    });
    let balance_ticket = ledger.apply_payment(method, total);

    match orders
        .resource()
        .confirm_payment(&req.order_id, method)
        .await
    {
        Ok(paid) => {
            info!(
                order_id = %paid.id,
                method = ?method,
                amount = %total,
                status = paid.status.as_str(),
                "Payment confirmed"
            );
            ledger.commit(balance_ticket).await;
            orders.commit(order_ticket).await;
            Ok(PaymentReceipt {
                order: paid,
                change_due: change,
            })
        }
        Err(e) => {
            warn!(order_id = %req.order_id, method = ?method, "Payment confirmation failed: {e}");
            ledger.rollback(balance_ticket, &e).await;
            orders.rollback(order_ticket, &e).await;
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
