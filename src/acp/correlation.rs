//! Request/response correlation.
//!
//! A single table maps request ids to single-use waiters:
//!
//! | Entry                         | Created by                          | Resolved by                                  |
//! |-------------------------------|-------------------------------------|----------------------------------------------|
//! | [`Pending::Response`]         | sending a request                   | the first response carrying the same id      |
//! | [`Pending::Permission`]       | receiving `session/request_permission` | a user selection or [`CorrelationTable::cancel_all`] |
//!
//! Resolution always removes the entry under the lock *before* anything is
//! invoked, so a racing selection and cancellation resolve a request exactly
//! once; the loser observes a missing entry and does nothing.
//!
//! Ids issued by this side and ids issued by the peer live in separate
//! namespaces inside the table, so a peer request `7` never collides with a
//! local request `7`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::acp::envelope::{RequestId, RpcError};
use crate::acp::types::{PermissionOutcome, RequestPermissionParams};
use crate::{AppError, Result};

/// Outcome delivered to a response waiter.
pub type ResponseOutcome = std::result::Result<Value, RpcError>;

/// Continuation invoked exactly once with the permission decision.
pub type PermissionResponder = Box<dyn FnOnce(PermissionOutcome) + Send>;

/// Which side issued the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Origin {
    Local,
    Remote,
}

/// One single-use waiter.
enum Pending {
    /// A local request awaiting the peer's response.
    Response(oneshot::Sender<ResponseOutcome>),
    /// A peer permission request awaiting the user's decision.
    Permission {
        params: RequestPermissionParams,
        respond: PermissionResponder,
    },
}

struct Entry {
    seq: u64,
    pending: Pending,
}

/// Receiving half of a registered outbound request.
#[derive(Debug)]
pub struct ResponseWaiter {
    id: RequestId,
    rx: oneshot::Receiver<ResponseOutcome>,
}

impl ResponseWaiter {
    /// The id the response must echo.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the peer answered with an error object.
    /// - [`AppError::TransportClosed`] when the waiter was dropped by
    ///   [`CorrelationTable::fail_all_waiters`] or [`CorrelationTable::forget`].
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(AppError::TransportClosed(format!(
                "no response for request {}",
                self.id
            ))),
        }
    }
}

/// Thread-safe id → waiter map shared by the client session and the
/// reference agent.
pub struct CorrelationTable {
    entries: Mutex<HashMap<(Origin, RequestId), Entry>>,
    next_id: AtomicI64,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    /// Create an empty table whose local ids start at `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Origin, RequestId), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, pending: Pending) -> Entry {
        Entry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            pending,
        }
    }

    /// Allocate the next local request id.
    #[must_use]
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a waiter for a local request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::UnknownCorrelation`] if `id` is already pending.
    pub fn register_request(&self, id: RequestId) -> Result<ResponseWaiter> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        let key = (Origin::Local, id.clone());
        if entries.contains_key(&key) {
            return Err(AppError::UnknownCorrelation(format!(
                "request {id} is already pending"
            )));
        }
        let entry = self.entry(Pending::Response(tx));
        entries.insert(key, entry);
        Ok(ResponseWaiter { id, rx })
    }

    /// Deliver a response to its waiter.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::UnknownCorrelation`] when no waiter is registered
    /// for `id` (never sent, already answered, or forgotten).
    pub fn resolve_response(&self, id: &RequestId, outcome: ResponseOutcome) -> Result<()> {
        let removed = {
            let mut entries = self.lock();
            let key = (Origin::Local, id.clone());
            match entries.get(&key).map(|e| &e.pending) {
                Some(Pending::Response(_)) => entries.remove(&key),
                _ => None,
            }
        };

        let Some(Entry {
            pending: Pending::Response(tx),
            ..
        }) = removed
        else {
            return Err(AppError::UnknownCorrelation(format!(
                "response for unknown request {id}"
            )));
        };

        if tx.send(outcome).is_err() {
            debug!(%id, "correlation: waiter dropped before response arrived");
        }
        Ok(())
    }

    /// Abandon a local request; a late response becomes an unknown correlation.
    pub fn forget(&self, id: &RequestId) {
        self.lock().remove(&(Origin::Local, id.clone()));
    }

    /// Register a continuation for a peer permission request.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::UnknownCorrelation`] when a permission request
    /// with the same id is still pending; the duplicate is not registered and
    /// `respond` is dropped unused.
    pub fn register_permission(
        &self,
        id: RequestId,
        params: RequestPermissionParams,
        respond: PermissionResponder,
    ) -> Result<()> {
        let mut entries = self.lock();
        let key = (Origin::Remote, id.clone());
        if entries.contains_key(&key) {
            return Err(AppError::UnknownCorrelation(format!(
                "duplicate permission request {id}"
            )));
        }
        let entry = self.entry(Pending::Permission { params, respond });
        entries.insert(key, entry);
        Ok(())
    }

    /// Resolve one permission request.
    ///
    /// Returns `true` if this call resolved it, `false` if it was already
    /// resolved (or never existed).
    pub fn resolve_permission(&self, id: &RequestId, outcome: PermissionOutcome) -> bool {
        let removed = self.lock().remove(&(Origin::Remote, id.clone()));
        match removed {
            Some(Entry {
                pending: Pending::Permission { respond, .. },
                ..
            }) => {
                respond(outcome);
                true
            }
            Some(Entry {
                pending: Pending::Response(_),
                ..
            }) => {
                warn!(%id, "correlation: remote id held a response waiter");
                false
            }
            None => {
                debug!(%id, "correlation: permission already resolved");
                false
            }
        }
    }

    /// Resolve every pending permission request with
    /// [`PermissionOutcome::Cancelled`], in the order they arrived.
    ///
    /// Returns the ids that this call resolved. Idempotent: a second call
    /// returns an empty list.
    pub fn cancel_all(&self) -> Vec<RequestId> {
        let mut drained: Vec<(u64, RequestId, PermissionResponder)> = {
            let mut entries = self.lock();
            let keys: Vec<_> = entries
                .iter()
                .filter(|(_, e)| matches!(e.pending, Pending::Permission { .. }))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let entry = entries.remove(&key)?;
                    match entry.pending {
                        Pending::Permission { respond, .. } => Some((entry.seq, key.1, respond)),
                        Pending::Response(_) => None,
                    }
                })
                .collect()
        };

        drained.sort_by_key(|(seq, _, _)| *seq);
        drained
            .into_iter()
            .map(|(_, id, respond)| {
                respond(PermissionOutcome::Cancelled);
                id
            })
            .collect()
    }

    /// Drop every outbound waiter so their callers observe
    /// [`AppError::TransportClosed`].
    pub fn fail_all_waiters(&self) {
        self.lock()
            .retain(|_, e| !matches!(e.pending, Pending::Response(_)));
    }

    /// Parameters of a pending permission request.
    #[must_use]
    pub fn permission_params(&self, id: &RequestId) -> Option<RequestPermissionParams> {
        match self.lock().get(&(Origin::Remote, id.clone())).map(|e| &e.pending) {
            Some(Pending::Permission { params, .. }) => Some(params.clone()),
            _ => None,
        }
    }

    /// Ids of pending permission requests in arrival order.
    #[must_use]
    pub fn pending_permissions(&self) -> Vec<RequestId> {
        let entries = self.lock();
        let mut ids: Vec<_> = entries
            .iter()
            .filter(|(_, e)| matches!(e.pending, Pending::Permission { .. }))
            .map(|((_, id), e)| (e.seq, id.clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of pending entries of either kind.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
