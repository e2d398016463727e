//! Optimistic cache cell.
//!
//! A cell holds the last value the server confirmed plus an ordered list of
//! local mutations that have not yet been folded into a confirmed value.
//! Readers see `confirmed` with every pending mutation applied in issue
//! order.
//!
//! Protocol for a mutation:
//! 1. `apply` captures the displayed value (snapshot), applies the pure
//!    mutation and publishes the result.
//! 2. The caller issues the authoritative request.
//! 3. On success `commit` marks the mutation settled. It keeps contributing
//!    to the displayed value until a revalidation replaces `confirmed`.
//! 4. On failure `rollback` drops the mutation and re-folds the remaining
//!    ones onto `confirmed`. With nothing else pending that equals the
//!    ticket's snapshot.
//!
//! Revalidation never overwrites an in-flight mutation: it is skipped while
//! any mutation is unsettled, and a fetch result is discarded when the cell
//! changed while the fetch was on the wire. Both cases mark the cell so the
//! settling call reports that a revalidation is still owed.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::PosResult;

type Mutation<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

struct PendingMutation<T> {
    id: u64,
    label: String,
    apply: Mutation<T>,
    settled: bool,
}

struct CellState<T> {
    confirmed: T,
    pending: Vec<PendingMutation<T>>,
    next_id: u64,
    /// Bumped on every apply, commit and rollback.
    version: u64,
    revalidation_owed: bool,
}

impl<T> CellState<T> {
    fn has_unsettled(&self) -> bool {
        self.pending.iter().any(|m| !m.settled)
    }

    fn fold(&self) -> T
    where
        T: Clone,
    {
        self.pending
            .iter()
            .fold(self.confirmed.clone(), |acc, m| (m.apply)(&acc))
    }
}

/// Handle for one applied mutation. Must be passed back to `commit` or
/// `rollback` exactly once.
#[must_use = "an optimistic mutation must be committed or rolled back"]
#[derive(Debug)]
pub struct MutationTicket<T> {
    id: u64,
    snapshot: T,
}

impl<T> MutationTicket<T> {
    /// Displayed value before this mutation was applied.
    pub fn snapshot(&self) -> &T {
        &self.snapshot
    }
}

/// Outcome of a revalidation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidation {
    /// Fresh value installed; `changed` is false when it equalled the
    /// displayed value, in which case subscribers were not notified.
    Applied { changed: bool },
    /// Mutations were in flight; nothing was fetched.
    Deferred,
    /// The cell changed while fetching; the response was dropped.
    Stale,
}

pub struct OptimisticCell<T> {
    name: &'static str,
    state: Mutex<CellState<T>>,
    display: watch::Sender<T>,
}

impl<T> OptimisticCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(name: &'static str, initial: T) -> Self {
        let (display, _) = watch::channel(initial.clone());
        Self {
            name,
            state: Mutex::new(CellState {
                confirmed: initial,
                pending: Vec::new(),
                next_id: 1,
                version: 0,
                revalidation_owed: false,
            }),
            display,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CellState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, value: T) -> bool {
        self.display.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Currently displayed value (confirmed plus pending mutations).
    pub fn current(&self) -> T {
        self.display.borrow().clone()
    }

    /// Last value the server confirmed, without local mutations.
    pub fn confirmed(&self) -> T {
        self.lock().confirmed.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.display.subscribe()
    }

    /// Number of mutations whose request has not returned yet.
    pub fn in_flight(&self) -> usize {
        self.lock().pending.iter().filter(|m| !m.settled).count()
    }

    /// Apply a local mutation ahead of the server round-trip.
    pub fn apply(
        &self,
        label: impl Into<String>,
        mutation: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> MutationTicket<T> {
        let label = label.into();
        let (ticket, next) = {
            let mut state = self.lock();
            let snapshot = state.fold();
            let next = mutation(&snapshot);
            let id = state.next_id;
            state.next_id += 1;
            state.version += 1;
            state.pending.push(PendingMutation {
                id,
                label: label.clone(),
                apply: Box::new(mutation),
                settled: false,
            });
            (MutationTicket { id, snapshot }, next)
        };
        debug!(cell = self.name, mutation = %label, id = ticket.id, "optimistic mutation applied");
        self.publish(next);
        ticket
    }

    /// The request behind `ticket` succeeded.
    ///
    /// Returns true when no mutation is in flight any more, meaning the
    /// caller should revalidate now.
    pub fn commit(&self, ticket: MutationTicket<T>) -> bool {
        let mut state = self.lock();
        if let Some(m) = state.pending.iter_mut().find(|m| m.id == ticket.id) {
            m.settled = true;
        }
        state.version += 1;
        state.revalidation_owed = true;
        let ready = !state.has_unsettled();
        debug!(cell = self.name, id = ticket.id, ready, "optimistic mutation committed");
        ready
    }

    /// The request behind `ticket` failed; undo its local effect.
    ///
    /// Returns true when a revalidation is owed and nothing is in flight.
    pub fn rollback(&self, ticket: MutationTicket<T>) -> bool {
        let (restored, ready) = {
            let mut state = self.lock();
            let Some(pos) = state.pending.iter().position(|m| m.id == ticket.id) else {
                return false;
            };
            let removed = state.pending.remove(pos);
            state.version += 1;
            warn!(cell = self.name, mutation = %removed.label, id = ticket.id, "optimistic mutation rolled back");

            // The snapshot may still contain mutations rolled back since it
            // was taken, so the remaining list is always re-folded.
            let restored = state.fold();
            let ready = !state.has_unsettled() && state.revalidation_owed;
            (restored, ready)
        };
        self.publish(restored);
        ready
    }

    /// Fetch the authoritative value and install it unless a newer local
    /// mutation would be clobbered.
    pub async fn revalidate<F, Fut>(&self, fetch: F) -> PosResult<Revalidation>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PosResult<T>>,
    {
        let started_at = {
            let mut state = self.lock();
            if state.has_unsettled() {
                state.revalidation_owed = true;
                debug!(cell = self.name, "revalidation deferred, mutations in flight");
                return Ok(Revalidation::Deferred);
            }
            state.version
        };

        let fresh = fetch().await?;

        let changed = {
            let mut state = self.lock();
            if state.version != started_at || state.has_unsettled() {
                state.revalidation_owed = true;
                debug!(cell = self.name, "stale revalidation dropped");
                return Ok(Revalidation::Stale);
            }
            // Every remaining mutation is settled and was settled before the
            // fetch started, so the server value already contains it.
            state.pending.clear();
            state.confirmed = fresh;
            state.revalidation_owed = false;
            let value = state.confirmed.clone();
            drop(state);
            self.publish(value)
        };
        Ok(Revalidation::Applied { changed })
    }

    /// Install a value from the local mirror when nothing is pending.
    pub fn hydrate(&self, value: T) -> bool {
        {
            let mut state = self.lock();
            if !state.pending.is_empty() {
                return false;
            }
            state.confirmed = value.clone();
            state.version += 1;
        }
        self.publish(value);
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
