// Multi-site transaction builder.
//
// A `TransactionBuilder` lets several independent pieces of code contribute
// mutations and events to one atomic transaction. The owner hands out
// `BuilderHandle`s; each `handle.set_store(m)` queues `m` right away and
// returns a future for the outcome of the *whole* transaction. Nothing is
// sent until the owner calls `commit()`. Dropping the builder without
// committing (or calling `abort()`) resolves every handle future `false`.

use std::future::Future;
use std::sync::Arc;

use lockstep_protocol::{Event, Mutation};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Result;
use crate::store::ReplicatedStore;

#[derive(Default)]
struct Draft {
    mutations: Vec<Mutation>,
    events: Vec<Event>,
    closed: bool,
}

/// Owner side of a pending transaction.
pub struct TransactionBuilder {
    store: ReplicatedStore,
    draft: Arc<Mutex<Draft>>,
    outcome: watch::Sender<Option<bool>>,
    finished: bool,
}

/// Contributor side of a pending transaction.
#[derive(Clone)]
pub struct BuilderHandle {
    draft: Arc<Mutex<Draft>>,
    outcome: watch::Receiver<Option<bool>>,
}

impl TransactionBuilder {
    pub(crate) fn new(store: ReplicatedStore) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            store,
            draft: Arc::new(Mutex::new(Draft::default())),
            outcome,
            finished: false,
        }
    }

    pub fn handle(&self) -> BuilderHandle {
        BuilderHandle {
            draft: Arc::clone(&self.draft),
            outcome: self.outcome.subscribe(),
        }
    }

    pub fn set_store(&self, mutation: Mutation) {
        self.draft.lock().mutations.push(mutation);
    }

    pub fn emit(&self, event: Event) {
        self.draft.lock().events.push(event);
    }

    /// Submit everything queued so far as one transaction. Later
    /// `set_store` calls on outstanding handles are refused.
    pub async fn commit(mut self) -> Result<bool> {
        self.finished = true;
        let (mutations, events) = {
            let mut draft = self.draft.lock();
            draft.closed = true;
            (
                std::mem::take(&mut draft.mutations),
                std::mem::take(&mut draft.events),
            )
        };
        let result = self.store.set_store_transaction(mutations, events).await;
        self.outcome
            .send_replace(Some(matches!(result, Ok(true))));
        result
    }

    /// Discard the transaction. Handle futures resolve `false`.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for TransactionBuilder {
    fn drop(&mut self) {
        if !self.finished {
            self.draft.lock().closed = true;
            self.outcome.send_replace(Some(false));
        }
    }
}

impl BuilderHandle {
    /// Queue `mutation` and return a future for the transaction's outcome.
    /// Resolves `false` immediately if the builder was already committed or
    /// aborted.
    pub fn set_store(&self, mutation: Mutation) -> impl Future<Output = bool> + use<> {
        let queued = self.push(|draft| draft.mutations.push(mutation));
        let outcome = self.outcome.clone();
        async move { queued && wait_outcome(outcome).await }
    }

    /// Queue an event. Returns `false` if the builder is already closed.
    pub fn emit(&self, event: Event) -> bool {
        self.push(|draft| draft.events.push(event))
    }

    /// Wait for the transaction's outcome without contributing to it.
    pub async fn outcome(&self) -> bool {
        wait_outcome(self.outcome.clone()).await
    }

    fn push(&self, f: impl FnOnce(&mut Draft)) -> bool {
        let mut draft = self.draft.lock();
        if draft.closed {
            return false;
        }
        f(&mut draft);
        true
    }
}

async fn wait_outcome(mut outcome: watch::Receiver<Option<bool>>) -> bool {
    match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.unwrap_or(false),
        Err(_) => false,
    }
}
