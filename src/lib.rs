//! Kasir Core - order and shift lifecycle engine for a café POS terminal.
//!
//! The server owns orders, shifts and tables. This crate keeps the
//! terminal's view of them: it applies actions optimistically, submits
//! them over HTTP, reconciles with the server and rolls back on failure.
//!
//! Entry point for hosts is [`Engine`]; call [`diagnostics::init_logging`]
//! first and keep the returned guard alive.

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod merge;
pub mod models;
pub mod optimistic;
pub mod order_machine;
pub mod orders;
pub mod payments;
pub mod resources;
pub mod session;
pub mod shifts;
pub mod tables;
pub mod views;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, OrderPolicy};
pub use engine::Engine;
pub use error::{ErrorKind, PosError, PosResult};
pub use models::{
    LineItem, Order, OrderDraft, OrderStatus, OrderType, PaymentMethod, PaymentStatus, Table,
    TableStatus,
};
pub use payments::{PaymentReceipt, PaymentRequest};
pub use session::{Role, Session};
pub use shifts::{ShiftBalance, ShiftCloseSummary};
