//! Engine facade.
//!
//! Ties the order store, shift ledger and table synchronizer together and
//! exposes the actions the order screen calls. Every action takes the
//! operator's `Session` and is gated on role and shift before anything
//! else happens.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::config::{EngineConfig, OrderPolicy};
use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::merge::{self, MergePreview};
use crate::models::{Order, OrderDraft, OrderStatus, OrderType, Table};
use crate::optimistic::Revalidation;
use crate::order_machine;
use crate::orders::OrderStore;
use crate::payments::{self, PaymentReceipt, PaymentRequest};
use crate::resources::{OrderFilter, OrderResource, ShiftResource, TableResource};
use crate::session::Session;
use crate::shifts::{authorize_order_action, ShiftBalance, ShiftCloseSummary, ShiftLedger};
use crate::tables::{self, TableOverview, TableSynchronizer};
use crate::views::{self, BalanceView, OrderQuery, OrderRow};

pub struct Engine {
    config: EngineConfig,
    orders: OrderStore,
    ledger: ShiftLedger,
    tables: TableSynchronizer,
    mirror: Option<Arc<DbState>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        orders: Arc<dyn OrderResource>,
        shifts: Arc<dyn ShiftResource>,
        tables: Arc<dyn TableResource>,
    ) -> Self {
        Self {
            config,
            orders: OrderStore::new(orders),
            ledger: ShiftLedger::new(shifts),
            tables: TableSynchronizer::new(tables),
            mirror: None,
        }
    }

    /// Attach the local mirror and draw the last known state from it.
    pub fn with_mirror(mut self, db: Arc<DbState>) -> PosResult<Self> {
        let orders = db.with_conn(db::load_orders)?;
        let balance = db.with_conn(db::load_shift_balance)?;
        info!(orders = orders.len(), shift = balance.is_some(), "Hydrating from local mirror");
        self.orders.hydrate(orders);
        if let Some(balance) = balance {
            self.ledger.hydrate(balance);
        }
        self.mirror = Some(db);
        Ok(self)
    }

    /// Open the local database, read the configuration and connect to the
    /// POS server. Restricts the order list to today's business day.
    pub fn bootstrap(data_dir: &Path) -> anyhow::Result<Arc<Engine>> {
        let db = Arc::new(db::init(data_dir).context("opening local database")?);
        let config = db
            .with_conn(|conn| Ok(EngineConfig::load(conn)))
            .context("loading configuration")?;
        let client = Arc::new(ApiClient::new(&config).context("configuring POS API client")?);

        let engine = Engine::new(config, client.clone(), client.clone(), client)
            .with_mirror(db)
            .context("reading local mirror")?;
        engine
            .orders
            .set_filter(OrderFilter::business_day(Local::now().date_naive()));
        info!(terminal_id = %engine.config.terminal_id, "Engine ready");
        Ok(Arc::new(engine))
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy(&self) -> OrderPolicy {
        self.config.policy
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.orders()
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.orders.get(order_id)
    }

    pub fn balance(&self) -> ShiftBalance {
        self.ledger.balance()
    }

    pub fn subscribe_orders(&self) -> watch::Receiver<Vec<Order>> {
        self.orders.subscribe()
    }

    pub fn subscribe_balance(&self) -> watch::Receiver<ShiftBalance> {
        self.ledger.subscribe()
    }

    pub fn order_rows(&self, query: &OrderQuery) -> Vec<OrderRow> {
        views::order_rows(&self.orders.orders(), query, |id| self.orders.is_busy(id))
    }

    pub fn balance_view(&self) -> BalanceView {
        BalanceView::from(&self.ledger.balance())
    }

    pub fn merge_preview(&self, order_ids: &[String]) -> PosResult<MergePreview> {
        merge::plan_merge(&self.orders.orders(), order_ids)
    }

    /// Floor plan summary of `tables` against the displayed orders.
    pub fn table_overview(&self, tables: &[Table]) -> Vec<TableOverview> {
        tables::table_overview(tables, &self.orders.orders())
    }

    pub fn close_preview(&self, counted_cash: Decimal) -> ShiftCloseSummary {
        self.ledger.close_preview(counted_cash)
    }

    // -----------------------------------------------------------------------
    // Order actions
    // -----------------------------------------------------------------------

    fn gate(&self, session: &Session) -> PosResult<()> {
        authorize_order_action(session, &self.ledger.balance())
    }

    pub async fn create_order(&self, session: &Session, draft: &OrderDraft) -> PosResult<Order> {
        self.gate(session)?;
        let order = self.orders.create(draft).await?;
        if order.order_type == OrderType::DineIn {
            if let Some(table_id) = order.table_id.as_deref() {
                if let Err(e) = self.tables.occupy(table_id).await {
                    warn!(table_id, order_id = %order.id, "Failed to mark table occupied: {e}");
                }
            }
        }
        self.sync_mirror();
        Ok(order)
    }

    /// Move the order one step along its lifecycle.
    pub async fn advance_order(&self, session: &Session, order_id: &str) -> PosResult<Order> {
        self.gate(session)?;
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| PosError::NotFound(order_id.to_string()))?;
        let target = order_machine::advance_target(&order, &self.config.policy)?;
        let updated = self
            .orders
            .transition(order_id, target, None, &self.config.policy)
            .await?;
        self.after_transition(&updated).await;
        Ok(updated)
    }

    /// Cancel an order. `reason` is free text or a `CancelReason` preset.
    pub async fn cancel_order(
        &self,
        session: &Session,
        order_id: &str,
        reason: impl AsRef<str>,
    ) -> PosResult<Order> {
        self.gate(session)?;
        let updated = self
            .orders
            .transition(
                order_id,
                OrderStatus::Cancel,
                Some(reason.as_ref()),
                &self.config.policy,
            )
            .await?;
        self.after_transition(&updated).await;
        Ok(updated)
    }

    /// Orders as the table rescan should see them. An order whose request
    /// is still on the wire counts with its confirmed copy, since its
    /// optimistic status may yet be rolled back. `settled` replaces its
    /// displayed entry.
    fn table_scan(&self, settled: Option<&Order>) -> Vec<Order> {
        let confirmed = self.orders.confirmed_orders();
        self.orders
            .orders()
            .into_iter()
            .map(|shown| match settled {
                Some(s) if s.id == shown.id => s.clone(),
                _ if self.orders.is_busy(&shown.id) => confirmed
                    .iter()
                    .find(|o| o.id == shown.id)
                    .cloned()
                    .unwrap_or(shown),
                _ => shown,
            })
            .collect()
    }

    async fn after_transition(&self, updated: &Order) {
        if updated.is_terminal() {
            let scan = self.table_scan(Some(updated));
            if let Err(e) = self.tables.on_order_finished(updated, &scan).await {
                warn!(order_id = %updated.id, "Table sync failed: {e}");
            }
        }
        self.sync_mirror();
    }

    pub async fn confirm_payment(
        &self,
        session: &Session,
        req: &PaymentRequest,
    ) -> PosResult<PaymentReceipt> {
        self.gate(session)?;
        let receipt =
            payments::confirm_payment(&self.orders, &self.ledger, req, &self.config.policy).await;
        self.sync_mirror();
        receipt
    }

    pub async fn merge_orders(&self, session: &Session, order_ids: &[String]) -> PosResult<Order> {
        self.gate(session)?;
        let survivor = merge::merge_orders(&self.orders, order_ids).await;
        self.sync_mirror();
        survivor
    }

    pub async fn mark_table_cleaned(&self, session: &Session, table_id: &str) -> PosResult<()> {
        self.gate(session)?;
        self.tables
            .mark_cleaned(table_id, &self.table_scan(None))
            .await
    }

    // -----------------------------------------------------------------------
    // Shift actions
    // -----------------------------------------------------------------------

    pub async fn start_shift(&self, session: &Session, opening_float: Decimal) -> PosResult<ShiftBalance> {
        let balance = self.ledger.start_shift(session, opening_float).await;
        self.sync_mirror();
        balance
    }

    pub async fn close_shift(
        &self,
        session: &Session,
        counted_cash: Decimal,
    ) -> PosResult<ShiftCloseSummary> {
        let summary = self.ledger.close_shift(session, counted_cash).await;
        self.sync_mirror();
        summary
    }

    pub async fn record_expense(
        &self,
        session: &Session,
        amount: Decimal,
        description: &str,
    ) -> PosResult<ShiftBalance> {
        let balance = self.ledger.record_expense(session, amount, description).await;
        self.sync_mirror();
        balance
    }

    // -----------------------------------------------------------------------
    // Revalidation
    // -----------------------------------------------------------------------

    /// Revalidate orders and shift balance, then refresh the mirror.
    /// Both are attempted; the first error is returned.
    pub async fn revalidate_all(&self) -> PosResult<(Revalidation, Revalidation)> {
        let (orders, shift) = tokio::join!(self.orders.revalidate(), self.ledger.revalidate());
        self.sync_mirror();
        Ok((orders?, shift?))
    }

    /// Write the server-confirmed state to the local mirror.
    fn sync_mirror(&self) {
        let Some(db) = &self.mirror else {
            return;
        };
        let orders = self.orders.confirmed_orders();
        let balance = self.ledger.confirmed();
        let result = db.with_conn(|conn| {
            db::save_orders(conn, &orders)?;
            db::save_shift_balance(conn, &balance)
        });
        if let Err(e) = result {
            warn!("Failed to update local mirror: {e}");
        }
    }

    /// Revalidate periodically until `token` is cancelled. Returns `None`
    /// when polling is disabled in the configuration.
    pub fn spawn_poller(self: &Arc<Self>, token: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.config.poll_interval?;
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Revalidation poller started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.revalidate_all().await {
                            warn!("Periodic revalidation failed: {e}");
                        }
                    }
                }
            }
            info!("Revalidation poller stopped");
        }))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LineItem, PaymentMethod, PaymentStatus, TableStatus};
    use crate::order_machine::CancelReason;
    use crate::session::Role;
    use crate::testing::FakeBackend;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn cashier() -> Session {
        Session::cashier("u-1", "Sari")
    }

    fn item(price: Decimal) -> Vec<LineItem> {
        vec![LineItem::new("m1", "Kopi", 1, price)]
    }

    fn engine_with(backend: &Arc<FakeBackend>, prepayment: bool) -> Engine {
        let mut config = EngineConfig::default();
        config.policy.prepayment_required = prepayment;
        backend.set_prepayment_required(prepayment);
        Engine::new(config, backend.clone(), backend.clone(), backend.clone())
    }

    async fn open_engine(backend: &Arc<FakeBackend>, prepayment: bool) -> Engine {
        let engine = engine_with(backend, prepayment);
        engine.start_shift(&cashier(), dec!(100000)).await.unwrap();
        engine.revalidate_all().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_shift_scenario() {
        let backend = Arc::new(FakeBackend::new());
        let cash = backend.seed_order(OrderDraft::take_away(item(dec!(50000))));
        let qris = backend.seed_order(OrderDraft::take_away(item(dec!(30000))));
        let unpaid = backend.seed_order(OrderDraft::take_away(item(dec!(20000))));
        let engine = open_engine(&backend, false).await;
        let s = cashier();

        engine
            .confirm_payment(&s, &PaymentRequest::new(&cash.id, PaymentMethod::Cash))
            .await
            .unwrap();
        assert_eq!(engine.balance().cash_total, dec!(150000));

        engine
            .confirm_payment(&s, &PaymentRequest::new(&qris.id, PaymentMethod::Qris))
            .await
            .unwrap();
        assert_eq!(engine.balance().cash_total, dec!(150000));
        assert_eq!(engine.balance().non_cash_total, dec!(30000));

        engine.advance_order(&s, &unpaid.id).await.unwrap();
        assert_eq!(engine.order(&unpaid.id).unwrap().status, OrderStatus::Process);
        let before = engine.balance();
        engine
            .cancel_order(&s, &unpaid.id, "Customer left")
            .await
            .unwrap();
        assert_eq!(engine.balance(), before);
        assert_eq!(engine.balance_view().cash_total, "Rp 150.000");
    }

    #[tokio::test]
    async fn test_prepayment_blocks_processing_until_paid() {
        let backend = Arc::new(FakeBackend::new());
        let order = backend.seed_order(OrderDraft::take_away(item(dec!(25000))));
        let engine = open_engine(&backend, true).await;
        let s = cashier();

        let pending = engine.advance_order(&s, &order.id).await.unwrap();
        assert_eq!(pending.status, OrderStatus::PendingPayment);
        assert!(matches!(
            engine.advance_order(&s, &order.id).await,
            Err(PosError::PaymentRequired(_))
        ));

        engine
            .confirm_payment(&s, &PaymentRequest::cash(&order.id, dec!(30000)))
            .await
            .unwrap();
        assert_eq!(engine.order(&order.id).unwrap().status, OrderStatus::Process);
        let done = engine.advance_order(&s, &order.id).await.unwrap();
        assert_eq!(done.status, OrderStatus::Done);
    }

    #[tokio::test]
    async fn test_table_dirty_after_last_order_finishes() {
        let backend = Arc::new(FakeBackend::new());
        let engine = open_engine(&backend, false).await;
        let s = cashier();

        let first = engine
            .create_order(&s, &OrderDraft::dine_in("t-5", item(dec!(15000))))
            .await
            .unwrap();
        let second = engine
            .create_order(&s, &OrderDraft::dine_in("t-5", item(dec!(20000))))
            .await
            .unwrap();
        assert_eq!(backend.table_status("t-5"), Some(TableStatus::Occupied));

        engine.cancel_order(&s, &first.id, "Double entry").await.unwrap();
        assert_eq!(backend.table_status("t-5"), Some(TableStatus::Occupied));

        engine.advance_order(&s, &second.id).await.unwrap();
        engine
            .confirm_payment(&s, &PaymentRequest::new(&second.id, PaymentMethod::Bank))
            .await
            .unwrap();
        engine.advance_order(&s, &second.id).await.unwrap();
        assert_eq!(backend.table_status("t-5"), Some(TableStatus::Dirty));

        engine.mark_table_cleaned(&s, "t-5").await.unwrap();
        assert_eq!(backend.table_status("t-5"), Some(TableStatus::Available));
    }

    #[tokio::test]
    async fn test_preset_cancel_and_floor_overview() {
        let backend = Arc::new(FakeBackend::new());
        let engine = open_engine(&backend, false).await;
        let s = cashier();
        let kept = engine
            .create_order(&s, &OrderDraft::dine_in("t-2", item(dec!(30000))))
            .await
            .unwrap();
        let dropped = engine
            .create_order(&s, &OrderDraft::dine_in("t-2", item(dec!(12000))))
            .await
            .unwrap();

        let cancelled = engine
            .cancel_order(&s, &dropped.id, CancelReason::OutOfStock)
            .await
            .unwrap();
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("Item out of stock"));

        let table = Table {
            id: "t-2".into(),
            number: 2,
            capacity: 4,
            status: TableStatus::Occupied,
        };
        let overview = engine.table_overview(&[table]);
        assert_eq!(overview[0].active_orders, vec![kept.id]);
        assert_eq!(overview[0].outstanding, dec!(30000));
    }

    #[tokio::test]
    async fn test_table_stays_in_use_when_concurrent_completion_fails() {
        let backend = Arc::new(FakeBackend::new());
        let a = backend.seed_order(OrderDraft::dine_in("t-7", item(dec!(18000))));
        let b = backend.seed_order(OrderDraft::dine_in("t-7", item(dec!(22000))));
        for id in [&a.id, &b.id] {
            backend.edit_order(id, |o| {
                o.status = OrderStatus::Process;
                o.payment_status = PaymentStatus::Paid;
            });
        }
        let engine = open_engine(&backend, false).await;
        let s = cashier();
        let gate = backend.hold_next("update_status");

        let first = engine.advance_order(&s, &a.id);
        let second = async {
            gate.arrived().await;
            let done = engine.advance_order(&s, &b.id).await;
            backend.fail_next_on("update_status", PosError::Transport("timeout".into()));
            gate.release();
            done
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_err());
        assert_eq!(second.unwrap().status, OrderStatus::Done);
        assert_eq!(engine.order(&a.id).unwrap().status, OrderStatus::Process);
        assert_eq!(backend.table_status("t-7"), None);
        assert!(engine.mark_table_cleaned(&s, "t-7").await.is_err());

        engine.advance_order(&s, &a.id).await.unwrap();
        assert_eq!(backend.table_status("t-7"), Some(TableStatus::Dirty));
    }

    #[tokio::test]
    async fn test_gate_rejects_before_any_request() {
        let backend = Arc::new(FakeBackend::new());
        let engine = engine_with(&backend, false);
        let draft = OrderDraft::take_away(item(dec!(1000)));

        assert!(matches!(
            engine.create_order(&cashier(), &draft).await,
            Err(PosError::Policy(_))
        ));
        assert_eq!(backend.request_count(), 0);

        engine.start_shift(&cashier(), dec!(0)).await.unwrap();
        let owner = Session::new("o-1", "Pak Joko", Role::Owner);
        let before = backend.request_count();
        assert!(matches!(
            engine.create_order(&owner, &draft).await,
            Err(PosError::Policy(_))
        ));
        assert_eq!(backend.request_count(), before);
    }

    #[tokio::test]
    async fn test_merge_through_engine() {
        let backend = Arc::new(FakeBackend::new());
        let a = backend.seed_order(OrderDraft::dine_in("t-1", item(dec!(40000))));
        let b = backend.seed_order(OrderDraft::dine_in("t-1", item(dec!(25000))));
        let engine = open_engine(&backend, false).await;
        let ids = vec![a.id.clone(), b.id.clone()];

        let preview = engine.merge_preview(&ids).unwrap();
        assert_eq!(preview.total, dec!(65000));

        let survivor = engine.merge_orders(&cashier(), &ids).await.unwrap();
        assert_eq!(survivor.total(), dec!(65000));
        let rows = engine.order_rows(&OrderQuery::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total, "Rp 65.000");
    }

    #[tokio::test]
    async fn test_revalidation_during_payment_keeps_optimistic_balance() {
        let backend = Arc::new(FakeBackend::new());
        let order = backend.seed_order(OrderDraft::take_away(item(dec!(50000))));
        let engine = open_engine(&backend, false).await;
        let gate = backend.hold_next("confirm_payment");
        let s = cashier();
        let req = PaymentRequest::new(&order.id, PaymentMethod::Cash);

        let pay = engine.confirm_payment(&s, &req);
        let poll = async {
            gate.arrived().await;
            let outcome = engine.revalidate_all().await.unwrap();
            let shown = engine.balance().cash_total;
            gate.release();
            (outcome, shown)
        };
        let (paid, (outcome, shown)) = tokio::join!(pay, poll);
        paid.unwrap();
        assert_eq!(outcome, (Revalidation::Deferred, Revalidation::Deferred));
        assert_eq!(shown, dec!(150000));
        assert_eq!(engine.balance().cash_total, dec!(150000));
        assert_eq!(engine.order(&order.id).unwrap().payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_stale_list_does_not_clobber_transition() {
        let backend = Arc::new(FakeBackend::new());
        let order = backend.seed_order(OrderDraft::take_away(item(dec!(10000))));
        let engine = open_engine(&backend, false).await;
        let gate = backend.hold_next("list");
        let s = cashier();

        let poll = engine.revalidate_all();
        let act = async {
            gate.arrived().await;
            let updated = engine.advance_order(&s, &order.id).await;
            gate.release();
            updated
        };
        let (polled, updated) = tokio::join!(poll, act);
        assert_eq!(polled.unwrap().0, Revalidation::Stale);
        assert_eq!(updated.unwrap().status, OrderStatus::Process);
        assert_eq!(engine.order(&order.id).unwrap().status, OrderStatus::Process);
    }

    #[tokio::test]
    async fn test_mirror_survives_restart() {
        let backend = Arc::new(FakeBackend::new());
        backend.seed_order(OrderDraft::take_away(item(dec!(12000))));
        let db = Arc::new(DbState::in_memory().unwrap());

        let engine = engine_with(&backend, false).with_mirror(db.clone()).unwrap();
        engine.start_shift(&cashier(), dec!(50000)).await.unwrap();
        engine.revalidate_all().await.unwrap();

        let offline = Arc::new(FakeBackend::new());
        let restarted = engine_with(&offline, false).with_mirror(db).unwrap();
        assert_eq!(restarted.orders().len(), 1);
        assert_eq!(restarted.orders()[0].total(), dec!(12000));
        assert!(restarted.balance().open);
        assert_eq!(restarted.balance().cash_total, dec!(50000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_revalidates_until_cancelled() {
        let backend = Arc::new(FakeBackend::new());
        let mut config = EngineConfig::default();
        config.poll_interval = Some(Duration::from_secs(10));
        let engine = Arc::new(Engine::new(
            config,
            backend.clone(),
            backend.clone(),
            backend.clone(),
        ));
        let lists = || backend.requests().iter().filter(|r| **r == "list").count();

        let token = CancellationToken::new();
        let handle = engine.spawn_poller(token.clone()).unwrap();
        // ticks at 0s, 10s, 20s and 30s
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(lists(), 4);

        token.cancel();
        handle.await.unwrap();
        let after = backend.request_count();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.request_count(), after);
    }

    #[test]
    fn test_poller_disabled_without_interval() {
        let backend = Arc::new(FakeBackend::new());
        let mut config = EngineConfig::default();
        config.poll_interval = None;
        let engine = Arc::new(Engine::new(
            config,
            backend.clone(),
            backend.clone(),
            backend.clone(),
        ));
        assert!(engine.spawn_poller(CancellationToken::new()).is_none());
    }
}
