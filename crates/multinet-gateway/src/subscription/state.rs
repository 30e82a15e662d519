//! Per-subscription buffer, trigger detection and lifecycle

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use multinet_core::{
    Entry, MultinetResponse, PpmUser, ProtocolBackend, ResponseEntry, SubscriptionHandle,
};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{Callback, GroupKey, Grouping, SubscriptionId};
use crate::dispatch::DispatchQueue;

/// Options fixed when a subscription is created
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionParams {
    pub grouping: Grouping,
    pub ppm_user: Option<PpmUser>,
    pub immediate: bool,
    pub timestamp: bool,
}

struct BufferState {
    /// Last known result per entry; never pruned while active
    buffer: HashMap<Entry, ResponseEntry>,
    /// `immediate` snapshot not yet enqueued
    pending_immediate: bool,
}

/// One live `get_async` registration.
///
/// Push events from any backend thread are serialized by the buffer lock;
/// the resulting deliveries are enqueued while that lock is held so the
/// dispatch order equals the order in which pushes were applied.
pub struct Subscription {
    id: SubscriptionId,
    /// Registered entries, deduplicated, in registration order
    entries: Vec<Entry>,
    members: HashSet<Entry>,
    params: SubscriptionParams,
    /// Group key → first registered entry of that group
    triggers: HashMap<GroupKey, Entry>,
    cancelled: AtomicBool,
    state: Mutex<BufferState>,
    registrations: Mutex<Vec<(Arc<dyn ProtocolBackend>, SubscriptionHandle)>>,
    /// Held for the whole callback invocation
    pub(crate) callback: Mutex<Callback>,
    queue: DispatchQueue,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        entries: Vec<Entry>,
        params: SubscriptionParams,
        callback: Callback,
        queue: DispatchQueue,
    ) -> Self {
        let mut members = HashSet::new();
        let entries: Vec<Entry> = entries
            .into_iter()
            .filter(|e| members.insert(e.clone()))
            .collect();

        let mut triggers = HashMap::new();
        for entry in &entries {
            triggers
                .entry(GroupKey::of(params.grouping, entry))
                .or_insert_with(|| entry.clone());
        }

        Self {
            id,
            entries,
            members,
            params,
            triggers,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(BufferState {
                buffer: HashMap::new(),
                pending_immediate: params.immediate,
            }),
            registrations: Mutex::new(Vec::new()),
            callback: Mutex::new(callback),
            queue,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn grouping(&self) -> Grouping {
        self.params.grouping
    }

    pub fn ppm_user(&self) -> Option<PpmUser> {
        self.params.ppm_user
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether an update to `entry` fires a delivery
    pub fn is_trigger(&self, entry: &Entry) -> bool {
        match self.params.grouping {
            Grouping::Individual => self.members.contains(entry),
            grouping => self.triggers.get(&GroupKey::of(grouping, entry)) == Some(entry),
        }
    }

    /// Last known result for `entry`
    pub fn buffered(&self, entry: &Entry) -> Option<ResponseEntry> {
        self.state.lock().buffer.get(entry).cloned()
    }

    /// Apply one backend push event
    pub fn on_push(self: &Arc<Self>, entry: Entry, response: ResponseEntry) {
        if self.is_cancelled() {
            trace!(subscription_id = %self.id, entry = %entry, "Discarding push for cancelled subscription");
            return;
        }
        if !self.members.contains(&entry) {
            trace!(subscription_id = %self.id, entry = %entry, "Discarding push for unregistered entry");
            return;
        }
        let response = if self.params.timestamp {
            response
        } else {
            response.without_timestamp()
        };

        let mut state = self.state.lock();
        if self.is_cancelled() {
            return;
        }
        if state.pending_immediate {
            state.pending_immediate = false;
            let snapshot = self.snapshot(&state.buffer, |_| true);
            self.queue.deliver(self.clone(), snapshot, true);
        }

        state.buffer.insert(entry.clone(), response.clone());
        if !self.is_trigger(&entry) {
            return;
        }

        let payload = match self.params.grouping {
            Grouping::Individual => std::iter::once((entry, response)).collect(),
            grouping => {
                let key = GroupKey::of(grouping, &entry);
                self.snapshot(&state.buffer, |e| GroupKey::of(grouping, e) == key)
            }
        };
        self.queue.deliver(self.clone(), payload, false);
    }

    /// Enqueue the `immediate` snapshot if no push has done so yet
    pub(crate) fn release_immediate(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if !state.pending_immediate || self.is_cancelled() {
            return;
        }
        state.pending_immediate = false;
        let snapshot = self.snapshot(&state.buffer, |_| true);
        self.queue.deliver(self.clone(), snapshot, true);
    }

    /// Buffered results of the selected entries, in registration order.
    /// Entries never updated are omitted.
    fn snapshot(
        &self,
        buffer: &HashMap<Entry, ResponseEntry>,
        selected: impl Fn(&Entry) -> bool,
    ) -> MultinetResponse {
        self.entries
            .iter()
            .filter(|e| selected(e))
            .filter_map(|e| buffer.get(e).map(|r| (e.clone(), r.clone())))
            .collect()
    }

    /// Record a backend registration; released at once if already cancelled
    pub(crate) fn add_registration(
        &self,
        backend: Arc<dyn ProtocolBackend>,
        handle: SubscriptionHandle,
    ) {
        let mut registrations = self.registrations.lock();
        if self.is_cancelled() {
            drop(registrations);
            release(self.id, backend.as_ref(), handle);
            return;
        }
        registrations.push((backend, handle));
    }

    /// Mark cancelled and release every backend registration.
    ///
    /// Returns `false` if the subscription was already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        {
            // on_push re-checks the flag under this lock before touching the buffer
            let _state = self.state.lock();
            if self.cancelled.swap(true, Ordering::SeqCst) {
                return false;
            }
        }
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for (backend, handle) in registrations {
            release(self.id, backend.as_ref(), handle);
        }
        true
    }

    /// Block until no callback of this subscription is running
    pub(crate) fn wait_idle(&self) {
        drop(self.callback.lock());
    }
}

fn release(id: SubscriptionId, backend: &dyn ProtocolBackend, handle: SubscriptionHandle) {
    if let Err(e) = backend.unsubscribe(handle) {
        warn!(
            subscription_id = %id,
            backend = %backend.backend_ref(),
            %handle,
            error = %e,
            "Failed to release backend subscription"
        );
    }
}
