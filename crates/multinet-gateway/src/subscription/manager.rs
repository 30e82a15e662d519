//! Subscription registry and backend registration

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use futures::future::join_all;
use multinet_core::{Entry, EntryError, MultinetResponse, PushSink, ResponseEntry};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{AsyncRequest, Callback, Subscription, SubscriptionId, SubscriptionParams};
use crate::dispatch::DispatchQueue;
use crate::router::ProtocolRouter;

/// Owns every live subscription
pub struct SubscriptionManager {
    router: Arc<ProtocolRouter>,
    queue: DispatchQueue,
    /// Thread that runs callbacks; cancel() must not wait on itself there
    dispatch_thread: ThreadId,
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        router: Arc<ProtocolRouter>,
        queue: DispatchQueue,
        dispatch_thread: ThreadId,
    ) -> Self {
        Self {
            router,
            queue,
            dispatch_thread,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a subscription and register it with every backend involved.
    ///
    /// Entries whose backend could not be resolved or refused the
    /// registration are reported in [`AsyncRequest::errors`]; the rest stay
    /// subscribed.
    pub async fn create(
        &self,
        entries: Vec<Entry>,
        params: SubscriptionParams,
        callback: Callback,
    ) -> AsyncRequest {
        let id = SubscriptionId::new();
        let subscription = Arc::new(Subscription::new(
            id,
            entries,
            params,
            callback,
            self.queue.clone(),
        ));
        self.subscriptions.write().insert(id, subscription.clone());

        let entries = subscription.entries();
        let partition = self.router.partition(entries).await;

        let registrations = join_all(partition.batches.iter().map(|batch| {
            let weak = Arc::downgrade(&subscription);
            let sink = PushSink::new(move |entry, response| {
                if let Some(subscription) = weak.upgrade() {
                    subscription.on_push(entry, response);
                }
            });
            batch.backend.subscribe(&batch.items, params.ppm_user, sink)
        }))
        .await;

        let mut failed: Vec<(usize, EntryError)> = partition.unroutable;
        for (batch, result) in partition.batches.iter().zip(registrations) {
            match result {
                Ok(handle) => {
                    debug!(
                        subscription_id = %id,
                        backend = %batch.backend_ref(),
                        %handle,
                        "Backend subscription registered"
                    );
                    subscription.add_registration(batch.backend.clone(), handle);
                }
                Err(e) => {
                    warn!(
                        subscription_id = %id,
                        backend = %batch.backend_ref(),
                        error = %e,
                        "Backend refused subscription"
                    );
                    let err = EntryError::from(&e);
                    failed.extend(
                        batch
                            .positions
                            .iter()
                            .flatten()
                            .map(|&position| (position, err.clone())),
                    );
                }
            }
        }
        failed.sort_by_key(|(position, _)| *position);
        let errors: MultinetResponse = failed
            .into_iter()
            .filter_map(|(position, err)| {
                entries
                    .get(position)
                    .map(|e| (e.clone(), ResponseEntry::Error(err)))
            })
            .collect();

        subscription.release_immediate();

        info!(
            subscription_id = %id,
            entries = entries.len(),
            failed = errors.len(),
            grouping = %params.grouping,
            ppm_user = ?params.ppm_user,
            "Async subscription created"
        );
        AsyncRequest { id, errors }
    }

    /// Cancel one subscription.
    ///
    /// Once this returns no callback for `id` runs again. When called from
    /// a thread other than the dispatch thread it also waits for a callback
    /// of `id` that is already running. Returns `false` for unknown ids.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.subscriptions.write().remove(&id) else {
            return false;
        };
        subscription.cancel();
        if thread::current().id() != self.dispatch_thread {
            subscription.wait_idle();
        }
        info!(subscription_id = %id, "Async subscription cancelled");
        true
    }

    /// Cancel every live subscription; returns the ids cancelled
    pub fn cancel_all(&self) -> Vec<SubscriptionId> {
        let ids: Vec<SubscriptionId> = self.subscriptions.read().keys().copied().collect();
        ids.into_iter().filter(|id| self.cancel(*id)).collect()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscriptions.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }
}
