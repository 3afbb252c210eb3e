//! Table of in-flight requests awaiting a correlated response.
//!
//! The writer registers a slot under the request's correlator before the
//! frame reaches the wire, so a response can never observe an unregistered
//! caller. Slots are removed by the originating call once its wait
//! resolves, keeping the correlator reserved until then.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::oneshot;

use crate::errors::ConnectionError;

/// Delivery channels registered for one in-flight request.
#[derive(Debug)]
pub(crate) struct ReplySlot<M> {
    reply_tx: Option<oneshot::Sender<M>>,
    err_tx: Option<oneshot::Sender<ConnectionError>>,
}

impl<M> ReplySlot<M> {
    pub(crate) fn new(
        reply_tx: oneshot::Sender<M>,
        err_tx: oneshot::Sender<ConnectionError>,
    ) -> Self {
        Self { reply_tx: Some(reply_tx), err_tx: Some(err_tx) }
    }
}

/// Outcome of routing a response through the table.
#[derive(Debug)]
pub(crate) enum Delivery<M> {
    /// The response reached its waiting caller.
    Delivered,
    /// No caller is waiting; the message is handed back.
    NoPending(M),
}

/// Thread-safe map from correlator to reply slot.
#[derive(Debug)]
pub(crate) struct PendingRequests<M> {
    slots: Mutex<HashMap<String, ReplySlot<M>>>,
}

impl<M> PendingRequests<M> {
    pub(crate) fn new() -> Self { Self { slots: Mutex::new(HashMap::new()) } }

    /// Register a slot, replacing any stale entry under the same correlator.
    pub(crate) fn register(&self, correlator: String, slot: ReplySlot<M>) {
        self.lock().insert(correlator, slot);
    }

    /// Route a response to the caller registered under `correlator`.
    pub(crate) fn deliver(&self, correlator: &str, message: M) -> Delivery<M> {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(correlator) else {
            return Delivery::NoPending(message);
        };
        let Some(reply_tx) = slot.reply_tx.take() else {
            return Delivery::NoPending(message);
        };
        match reply_tx.send(message) {
            Ok(()) => Delivery::Delivered,
            Err(message) => Delivery::NoPending(message),
        }
    }

    /// Remove the slot registered under `correlator`, if any.
    pub(crate) fn remove(&self, correlator: &str) { self.lock().remove(correlator); }

    /// Deliver an error to every registered slot exactly once.
    pub(crate) fn fail_all(&self, make_err: impl Fn() -> ConnectionError) {
        for slot in self.lock().values_mut() {
            if let Some(err_tx) = slot.err_tx.take() {
                let _ = err_tx.send(make_err());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ReplySlot<M>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool { self.lock().is_empty() }
}
