//! Dispatch Loop - the only place user callbacks run
//!
//! Every subscription enqueues its deliveries onto one unbounded queue.
//! A dedicated OS thread drains it and invokes callbacks one at a time in
//! enqueue order, so callbacks never run concurrently with each other and
//! never run on the async executor.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use multinet_core::{Entry, MultinetError, MultinetResponse, PpmUser, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace, warn};

use crate::config::DispatchConfig;
use crate::filters::DeliveryFilter;
use crate::subscription::{Subscription, SubscriptionId};

/// A payload waiting to be handed to its subscription's callback
pub(crate) struct Delivery {
    pub subscription: Arc<Subscription>,
    pub payload: MultinetResponse,
    /// Built by `immediate` rather than by a backend push
    pub synthetic: bool,
}

pub(crate) enum DispatchItem {
    Deliver(Delivery),
    Shutdown,
}

/// Producer side of the dispatch queue
#[derive(Clone)]
pub(crate) struct DispatchQueue(pub(crate) mpsc::UnboundedSender<DispatchItem>);

impl DispatchQueue {
    pub fn deliver(&self, subscription: Arc<Subscription>, payload: MultinetResponse, synthetic: bool) {
        let delivery = Delivery {
            subscription,
            payload,
            synthetic,
        };
        if self.0.send(DispatchItem::Deliver(delivery)).is_err() {
            trace!("Dispatch loop stopped, dropping delivery");
        }
    }
}

/// Report of a callback that returned an error or panicked, or of a
/// delivery filter that panicked
#[derive(Debug, Clone, Serialize)]
pub struct CallbackFailure {
    pub subscription: SubscriptionId,
    pub ppm_user: Option<PpmUser>,
    /// Entries of the payload the callback was handling
    pub entries: Vec<Entry>,
    pub message: String,
}

type Filters = Arc<Mutex<Vec<Box<dyn DeliveryFilter>>>>;

/// Owns the dispatch thread
pub struct Dispatcher {
    queue: DispatchQueue,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    filters: Filters,
    failures: broadcast::Sender<CallbackFailure>,
}

impl Dispatcher {
    /// Spawn the dispatch thread
    pub fn start(config: &DispatchConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(config.failure_channel_capacity.max(1));
        let filters: Filters = Arc::new(Mutex::new(Vec::new()));

        let loop_filters = filters.clone();
        let loop_failures = failures.clone();
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(rx, loop_filters, loop_failures))
            .map_err(|e| {
                MultinetError::DispatcherUnavailable(format!(
                    "failed to spawn dispatch thread: {}",
                    e
                ))
            })?;

        info!(thread = %config.thread_name, "Dispatch loop started");

        Ok(Self {
            queue: DispatchQueue(tx),
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
            filters,
            failures,
        })
    }

    pub(crate) fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// True when called from inside a callback
    pub fn is_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Receiver of callback failure reports
    pub fn failures(&self) -> broadcast::Receiver<CallbackFailure> {
        self.failures.subscribe()
    }

    /// Append a filter; filters run in registration order
    pub fn add_filter(&self, filter: Box<dyn DeliveryFilter>) {
        self.filters.lock().push(filter);
    }

    /// Let filters drop per-subscription state
    pub fn release(&self, subscription: SubscriptionId) {
        for filter in self.filters.lock().iter_mut() {
            filter.release(subscription);
        }
    }

    /// Stop the loop after the deliveries already queued.
    ///
    /// Joins the thread unless called from the dispatch thread itself.
    pub fn shutdown(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        let _ = self.queue.0.send(DispatchItem::Shutdown);
        if self.is_dispatch_thread() {
            return;
        }
        if handle.join().is_err() {
            warn!("Dispatch thread terminated abnormally");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut rx: mpsc::UnboundedReceiver<DispatchItem>,
    filters: Filters,
    failures: broadcast::Sender<CallbackFailure>,
) {
    while let Some(item) = rx.blocking_recv() {
        match item {
            DispatchItem::Deliver(delivery) => dispatch_one(delivery, &filters, &failures),
            DispatchItem::Shutdown => break,
        }
    }
    info!("Dispatch loop stopped");
}

fn dispatch_one(
    delivery: Delivery,
    filters: &Filters,
    failures: &broadcast::Sender<CallbackFailure>,
) {
    let Delivery {
        subscription,
        mut payload,
        synthetic,
    } = delivery;
    let id = subscription.id();
    let ppm_user = subscription.ppm_user();

    if subscription.is_cancelled() {
        trace!(subscription_id = %id, "Skipping delivery for cancelled subscription");
        return;
    }

    if !synthetic {
        let received: Vec<Entry> = payload.entries().cloned().collect();
        let filtered = panic::catch_unwind(AssertUnwindSafe(|| {
            filters
                .lock()
                .iter_mut()
                .fold(payload, |payload, filter| filter.filter(id, payload, ppm_user))
        }));
        payload = match filtered {
            Ok(payload) => payload,
            Err(panic) => {
                let message =
                    format!("delivery filter panicked: {}", panic_message(panic.as_ref()));
                report(failures, id, ppm_user, received, message);
                return;
            }
        };
        if payload.is_empty() {
            trace!(subscription_id = %id, "Delivery suppressed by filter");
            return;
        }
    }

    let entries: Vec<Entry> = payload.entries().cloned().collect();
    let mut guard = subscription.callback.lock();
    // cancel() may have completed while the filters ran
    if subscription.is_cancelled() {
        return;
    }
    let callback = &mut *guard;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(payload, ppm_user)));
    drop(guard);

    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("{:#}", e),
        Err(panic) => format!("callback panicked: {}", panic_message(panic.as_ref())),
    };
    report(failures, id, ppm_user, entries, message);
}

/// Log and broadcast user code that failed on the dispatch thread
fn report(
    failures: &broadcast::Sender<CallbackFailure>,
    subscription: SubscriptionId,
    ppm_user: Option<PpmUser>,
    entries: Vec<Entry>,
    message: String,
) {
    warn!(subscription_id = %subscription, error = %message, "Callback failed");
    let _ = failures.send(CallbackFailure {
        subscription,
        ppm_user,
        entries,
        message,
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
