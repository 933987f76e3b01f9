use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::protocol::envelope::OperationId;
use crate::protocol::filter_hash::FilterHash;
use crate::protocol::op_code::OpCode;
use crate::session::request_error::RequestError;

/// Invoked with `(payload, config)` for every delivery matching a subscription
pub type DeliveryCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

/// Invoked exactly once with the reply to a request, or with the reason there is none
pub type ReplyCallback = Box<dyn FnOnce(Result<Value, RequestError>) + Send>;

pub enum OperationCallback {
    Delivery(DeliveryCallback),
    Reply(ReplyCallback),
    /// the reply is a batch of retransmitted frames, handled by the session itself
    Retransmission,
}

impl OperationCallback {
    /// Subscriptions wait for an open-ended stream of deliveries, everything else for a single
    ///  reply that is subject to the reply timeout
    pub fn awaits_single_reply(&self) -> bool {
        !matches!(self, OperationCallback::Delivery(_))
    }
}

impl Debug for OperationCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationCallback::Delivery(_) => write!(f, "Delivery"),
            OperationCallback::Reply(_) => write!(f, "Reply"),
            OperationCallback::Retransmission => write!(f, "Retransmission"),
        }
    }
}

/// A client-initiated operation that may need to be replayed after a reconnect, or correlated
///  with a later response.
#[derive(Debug)]
pub struct PendingOperation {
    pub id: OperationId,
    pub payload: Vec<Value>,
    pub callback: Option<OperationCallback>,
    /// set for subscriptions only
    pub filter_hash: Option<FilterHash>,
}

impl PendingOperation {
    pub fn op_code(&self) -> OpCode {
        self.id.op_code
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CallbackWaiter {
    pub id: OperationId,
    pub op_code: OpCode,
    pub created_at: Instant,
}

/// Owns all pending operations. Every [CallbackWaiter] has a corresponding [PendingOperation],
///  and both are always removed together.
#[derive(Default)]
pub struct OperationRegistry {
    /// counter part of the most recently assigned operation id, never reset
    sent_count: u64,
    operations: BTreeMap<OperationId, PendingOperation>,
    waiters: BTreeMap<OperationId, CallbackWaiter>,
}

impl OperationRegistry {
    pub fn new() -> OperationRegistry {
        Default::default()
    }

    pub fn next_id(&mut self, op_code: OpCode) -> OperationId {
        self.sent_count += 1;
        OperationId::new(op_code, self.sent_count)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    /// Registers an operation, replacing a previous one with the same id. Operations awaiting
    ///  a single reply get a waiter starting at `now`.
    pub fn insert(&mut self, operation: PendingOperation, now: Instant) {
        let id = operation.id;
        if operation.callback.as_ref().is_some_and(OperationCallback::awaits_single_reply) {
            self.waiters.insert(id, CallbackWaiter {
                id,
                op_code: id.op_code,
                created_at: now,
            });
        }
        else {
            self.waiters.remove(&id);
        }
        self.operations.insert(id, operation);
    }

    pub fn get(&self, id: &OperationId) -> Option<&PendingOperation> {
        self.operations.get(id)
    }

    pub fn get_mut(&mut self, id: &OperationId) -> Option<&mut PendingOperation> {
        self.operations.get_mut(id)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    pub fn remove(&mut self, id: &OperationId) -> Option<PendingOperation> {
        self.waiters.remove(id);
        self.operations.remove(id)
    }

    /// snapshot of all ids in creation order
    pub fn ids(&self) -> Vec<OperationId> {
        self.operations.keys().copied().collect()
    }

    pub fn waiter(&self, id: &OperationId) -> Option<&CallbackWaiter> {
        self.waiters.get(id)
    }

    /// Removes and returns all operations whose waiter is older than `timeout`
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<PendingOperation> {
        let expired = self.waiters.values()
            .filter(|w| now.saturating_duration_since(w.created_at) > timeout)
            .map(|w| w.id)
            .collect::<Vec<_>>();

        expired.into_iter()
            .filter_map(|id| {
                debug!("operation {:?} timed out waiting for a reply", id);
                self.remove(&id)
            })
            .collect()
    }

    /// Removes all operations, e.g. on shutdown
    pub fn drain(&mut self) -> Vec<PendingOperation> {
        self.waiters.clear();
        std::mem::take(&mut self.operations).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.len()
    }
}
