//! Order status state machine.
//!
//! ```text
//!   new ──────────────► process ──► done
//!    │                     ▲
//!    └─► pending_payment ──┘        (pending_payment only with prepayment)
//!
//!   new / pending_payment / process ──► cancel (reason required)
//! ```
//!
//! Guards are pure functions of the order and the policy so they can run
//! before any request is made.

use serde::{Deserialize, Serialize};

use crate::config::OrderPolicy;
use crate::error::{PosError, PosResult};
use crate::models::{Order, OrderStatus};

/// Preset cancellation reasons offered by the cancel dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    CustomerRequest,
    OutOfStock,
    WrongOrder,
    PaymentFailed,
    LongWait,
}

impl CancelReason {
    pub const ALL: [CancelReason; 5] = [
        CancelReason::CustomerRequest,
        CancelReason::OutOfStock,
        CancelReason::WrongOrder,
        CancelReason::PaymentFailed,
        CancelReason::LongWait,
    ];

    pub fn label(self) -> &'static str {
        match self {
            CancelReason::CustomerRequest => "Customer cancelled",
            CancelReason::OutOfStock => "Item out of stock",
            CancelReason::WrongOrder => "Wrong order entered",
            CancelReason::PaymentFailed => "Payment failed",
            CancelReason::LongWait => "Waiting time too long",
        }
    }
}

impl AsRef<str> for CancelReason {
    fn as_ref(&self) -> &str {
        self.label()
    }
}

/// Trimmed, non-empty cancellation reason.
pub fn validate_cancel_reason(reason: &str) -> PosResult<String> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(PosError::validation("A cancellation reason is required"));
    }
    Ok(trimmed.to_string())
}

fn ensure_mutable(order: &Order) -> PosResult<()> {
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
    Ok(())
}

/// Check whether `order` may move to `target` under `policy`.
pub fn check_transition(order: &Order, target: OrderStatus, policy: &OrderPolicy) -> PosResult<()> {
    ensure_mutable(order)?;

    use OrderStatus::*;
    match (order.status, target) {
        (_, Cancel) => Ok(()),
        (New, Process) => {
            if policy.prepayment_required && !order.is_paid() {
                Err(PosError::PaymentRequired(
                    "Payment must be confirmed before the order is processed".into(),
                ))
            } else {
                Ok(())
            }
        }
        (New, PendingPayment) => {
            if !policy.prepayment_required {
                Err(PosError::validation(
                    "Awaiting payment is only used when prepayment is required",
                ))
            } else if order.is_paid() {
                Err(PosError::validation("Order is already paid"))
            } else {
                Ok(())
            }
        }
        (PendingPayment, Process) => {
            if order.is_paid() {
                Ok(())
            } else {
                Err(PosError::PaymentRequired(
                    "Confirm payment to start processing this order".into(),
                ))
            }
        }
        (Process, Done) => {
            if order.is_paid() {
                Ok(())
            } else {
                Err(PosError::PaymentRequired(
                    "Order must be paid before it is completed".into(),
                ))
            }
        }
        (from, to) => Err(PosError::validation(format!(
            "Cannot move order from {} to {}",
            from.as_str(),
            to.as_str()
        ))),
    }
}

/// Status the "advance" button moves the order to.
pub fn advance_target(order: &Order, policy: &OrderPolicy) -> PosResult<OrderStatus> {
    ensure_mutable(order)?;
    let target = match order.status {
        OrderStatus::New if policy.prepayment_required && !order.is_paid() => {
            OrderStatus::PendingPayment
        }
        OrderStatus::New | OrderStatus::PendingPayment => OrderStatus::Process,
        OrderStatus::Process => OrderStatus::Done,
        terminal @ (OrderStatus::Done | OrderStatus::Cancel) => {
            return Err(PosError::validation(format!(
                "Order {} is already {}",
                order.id,
                terminal.as_str()
            )))
        }
    };
    check_transition(order, target, policy)?;
    Ok(target)
}

/// Status an order takes once its payment is confirmed.
pub fn status_after_payment(order: &Order, policy: &OrderPolicy) -> OrderStatus {
    match order.status {
        OrderStatus::New | OrderStatus::PendingPayment if policy.prepayment_required => {
            OrderStatus::Process
        }
        other => other,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
