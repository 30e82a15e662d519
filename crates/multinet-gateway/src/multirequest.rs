//! MultiRequest - the caller facing entry point
//!
//! Validates arguments, routes entries through the [`ProtocolRouter`],
//! merges results and manages async subscriptions. Argument errors fail the
//! call before any backend is contacted; everything a backend reports is
//! returned per entry.

use std::sync::Arc;

use futures::future::join_all;
use multinet_core::{
    parse_entries, validate_ppm_user, BackendError, BackendRef, DeviceDirectory, Entry,
    EntrySpec, MultinetError, MultinetResponse, PpmUser, ProtocolBackend, ResponseEntry, Result,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::aggregate::{self, BatchOutcome};
use crate::config::MultinetConfig;
use crate::dispatch::{CallbackFailure, Dispatcher};
use crate::filters::DeliveryFilter;
use crate::handlers::{Handler, HandlerRegistration, HandlerRegistry};
use crate::router::{Partition, ProtocolRouter};
use crate::subscription::{
    AsyncRequest, Grouping, SubscriptionId, SubscriptionManager, SubscriptionParams,
};

/// Options for `get` and `get_meta`. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub ppm_user: Option<i64>,
    pub timestamp: Option<bool>,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ppm_user(mut self, ppm_user: i64) -> Self {
        self.ppm_user = Some(ppm_user);
        self
    }

    pub fn timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ppm_user: Option<i64>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ppm_user(mut self, ppm_user: i64) -> Self {
        self.ppm_user = Some(ppm_user);
        self
    }
}

/// Options for `get_async`. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct AsyncOptions {
    pub ppm_user: Option<i64>,
    pub grouping: Option<Grouping>,
    pub immediate: Option<bool>,
    pub timestamp: Option<bool>,
}

impl AsyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ppm_user(mut self, ppm_user: i64) -> Self {
        self.ppm_user = Some(ppm_user);
        self
    }

    pub fn grouping(mut self, grouping: Grouping) -> Self {
        self.grouping = Some(grouping);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    pub fn timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Builder for [`MultiRequest`]
#[derive(Default)]
pub struct MultiRequestBuilder {
    config: Option<MultinetConfig>,
    directory: Option<Arc<dyn DeviceDirectory>>,
    backends: Vec<Arc<dyn ProtocolBackend>>,
}

impl MultiRequestBuilder {
    pub fn config(mut self, config: MultinetConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an external device directory instead of `[routing]`
    pub fn directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ProtocolBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Validate the configuration and start the dispatch loop
    pub fn build(self) -> Result<MultiRequest> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(config.routing.directory()));
        let router = Arc::new(ProtocolRouter::new(directory));
        for backend in self.backends {
            router.register_backend(backend);
        }

        let dispatcher = Dispatcher::start(&config.dispatch)?;
        let subscriptions =
            SubscriptionManager::new(router.clone(), dispatcher.queue(), dispatcher.thread_id());

        Ok(MultiRequest {
            config,
            router,
            subscriptions,
            handlers: HandlerRegistry::new(),
            dispatcher,
        })
    }
}

/// Multiplexed access to entries served by any registered backend
pub struct MultiRequest {
    config: MultinetConfig,
    router: Arc<ProtocolRouter>,
    subscriptions: SubscriptionManager,
    handlers: HandlerRegistry,
    dispatcher: Dispatcher,
}

impl MultiRequest {
    pub fn builder() -> MultiRequestBuilder {
        MultiRequestBuilder::default()
    }

    pub fn config(&self) -> &MultinetConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    pub fn register_backend(&self, backend: Arc<dyn ProtocolBackend>) {
        self.router.register_backend(backend);
    }

    fn ppm_user(&self, requested: Option<i64>) -> Result<Option<PpmUser>> {
        match requested {
            Some(n) => validate_ppm_user(n).map(Some),
            None => self.config.default_ppm_user(),
        }
    }

    /// Read entries; one result per entry, in request order
    pub async fn get<I, E>(&self, entries: I, options: GetOptions) -> Result<MultinetResponse>
    where
        I: IntoIterator<Item = E>,
        E: Into<EntrySpec>,
    {
        let entries = parse_entries(entries)?;
        let ppm_user = self.ppm_user(options.ppm_user)?;
        let timestamp = options.timestamp.unwrap_or(self.config.requests.timestamp);

        let Partition {
            batches,
            unroutable,
        } = self.router.partition(&entries).await;
        let results = self.router.get(&batches, ppm_user).await;
        let outcomes = batches
            .iter()
            .zip(results)
            .map(|(batch, result)| BatchOutcome::new(batch, result))
            .collect();

        let mut response = aggregate::merge(&entries, outcomes, unroutable);
        if !timestamp {
            response = response
                .into_iter()
                .map(|(entry, r)| (entry, r.without_timestamp()))
                .collect();
        }
        debug!(
            entries = response.len(),
            backends = batches.len(),
            errors = response.all_errors().len(),
            "get completed"
        );
        Ok(response)
    }

    /// Write entries.
    ///
    /// A backend that acknowledges a write without echoing data yields the
    /// written value (without a timestamp) for that entry.
    pub async fn set<I, E, V>(&self, writes: I, options: SetOptions) -> Result<MultinetResponse>
    where
        I: IntoIterator<Item = (E, V)>,
        E: Into<EntrySpec>,
        V: Into<Value>,
    {
        let writes = writes
            .into_iter()
            .map(|(entry, value)| Ok((entry.into().into_entry()?, value.into())))
            .collect::<Result<Vec<(Entry, Value)>>>()?;
        let ppm_user = self.ppm_user(options.ppm_user)?;
        let order: Vec<Entry> = writes.iter().map(|(entry, _)| entry.clone()).collect();

        let Partition {
            batches,
            unroutable,
        } = self.router.partition_writes(writes).await;
        let results = self.router.set(&batches, ppm_user).await;
        let outcomes = batches
            .iter()
            .zip(results)
            .map(|(batch, result)| {
                let result = result.map(|acks| echo_writes(&batch.items, acks));
                BatchOutcome::new(batch, result)
            })
            .collect();

        let response = aggregate::merge(&order, outcomes, unroutable);
        debug!(
            entries = response.len(),
            errors = response.all_errors().len(),
            "set completed"
        );
        Ok(response)
    }

    /// Read entry metadata
    pub async fn get_meta<I, E>(&self, entries: I, options: GetOptions) -> Result<MultinetResponse>
    where
        I: IntoIterator<Item = E>,
        E: Into<EntrySpec>,
    {
        let entries = parse_entries(entries)?;
        let ppm_user = self.ppm_user(options.ppm_user)?;

        let Partition {
            batches,
            unroutable,
        } = self.router.partition(&entries).await;
        let results = self.router.get_meta(&batches, ppm_user).await;
        let outcomes = batches
            .iter()
            .zip(results)
            .map(|(batch, result)| BatchOutcome::new(batch, result))
            .collect();
        Ok(aggregate::merge(&entries, outcomes, unroutable))
    }

    /// Subscribe `callback` to value changes of `entries`.
    ///
    /// The callback runs on the dispatch thread, never concurrently with any
    /// other callback of this `MultiRequest`. It should return promptly:
    /// a slow callback delays every subscription.
    pub async fn get_async<F, I, E>(
        &self,
        callback: F,
        entries: I,
        options: AsyncOptions,
    ) -> Result<AsyncRequest>
    where
        F: FnMut(MultinetResponse, Option<PpmUser>) -> anyhow::Result<()> + Send + 'static,
        I: IntoIterator<Item = E>,
        E: Into<EntrySpec>,
    {
        let entries = parse_entries(entries)?;
        if entries.is_empty() {
            return Err(MultinetError::invalid("get_async needs at least one entry"));
        }
        let defaults = &self.config.requests;
        let params = SubscriptionParams {
            grouping: options.grouping.unwrap_or(defaults.grouping),
            ppm_user: self.ppm_user(options.ppm_user)?,
            immediate: options.immediate.unwrap_or(defaults.immediate),
            timestamp: options.timestamp.unwrap_or(defaults.timestamp),
        };
        Ok(self
            .subscriptions
            .create(entries, params, Box::new(callback))
            .await)
    }

    /// Cancel one subscription; see [`SubscriptionManager::cancel`]
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        let cancelled = self.subscriptions.cancel(id);
        if cancelled {
            self.dispatcher.release(id);
        }
        cancelled
    }

    /// Cancel every subscription; returns how many were live
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.subscriptions.cancel_all();
        for id in &cancelled {
            self.dispatcher.release(*id);
        }
        cancelled.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Add a filter for live async deliveries
    pub fn add_filter(&self, filter: impl DeliveryFilter + 'static) {
        self.dispatcher.add_filter(Box::new(filter));
    }

    /// Reports of callbacks that returned an error or panicked, and of
    /// delivery filters that panicked
    pub fn callback_failures(&self) -> broadcast::Receiver<CallbackFailure> {
        self.dispatcher.failures()
    }

    /// Enable or disable set history on every backend.
    ///
    /// Returns the backends that did not apply the change.
    pub async fn set_history(&self, enabled: bool) -> Vec<BackendRef> {
        let backends = self.router.backends();
        let results = join_all(backends.iter().map(|b| b.set_history(enabled))).await;

        let mut rejected = Vec::new();
        for (backend, result) in backends.iter().zip(results) {
            match result {
                Ok(()) => {}
                Err(BackendError::NotSupported(_)) => {
                    debug!(backend = %backend.backend_ref(), "Set history not supported");
                    rejected.push(backend.backend_ref().clone());
                }
                Err(e) => {
                    warn!(backend = %backend.backend_ref(), error = %e, "Failed to change set history");
                    rejected.push(backend.backend_ref().clone());
                }
            }
        }
        rejected.sort();
        info!(enabled, rejected = rejected.len(), "Set history updated");
        rejected
    }

    /// Record a handler for `start_handlers`.
    ///
    /// An empty `ppm_users` list subscribes without a PPM user.
    pub fn register_handler<I, E, H>(&self, entries: I, ppm_users: &[i64], handler: H) -> Result<()>
    where
        I: IntoIterator<Item = E>,
        E: Into<EntrySpec>,
        H: Fn(MultinetResponse, Option<PpmUser>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entries = parse_entries(entries)?;
        if entries.is_empty() {
            return Err(MultinetError::invalid("handler needs at least one entry"));
        }
        let ppm_users = if ppm_users.is_empty() {
            vec![None]
        } else {
            ppm_users
                .iter()
                .map(|&n| validate_ppm_user(n).map(Some))
                .collect::<Result<Vec<_>>>()?
        };
        let handler: Handler = Arc::new(handler);
        self.handlers.register(HandlerRegistration {
            entries,
            ppm_users,
            handler,
        });
        Ok(())
    }

    /// Start every registered handler, one `parameter`-grouped
    /// subscription per handler and PPM user
    pub async fn start_handlers(&self) -> Vec<AsyncRequest> {
        let defaults = &self.config.requests;
        let mut started = Vec::new();
        for registration in self.handlers.drain() {
            for &ppm_user in &registration.ppm_users {
                let handler = registration.handler.clone();
                let params = SubscriptionParams {
                    grouping: Grouping::Parameter,
                    ppm_user,
                    immediate: defaults.immediate,
                    timestamp: defaults.timestamp,
                };
                let request = self
                    .subscriptions
                    .create(
                        registration.entries.clone(),
                        params,
                        Box::new(move |data, ppm| handler(data, ppm)),
                    )
                    .await;
                started.push(request);
            }
        }
        info!(subscriptions = started.len(), "Async handlers started");
        started
    }
}

impl Drop for MultiRequest {
    fn drop(&mut self) {
        let cancelled = self.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "Cancelled subscriptions on shutdown");
        }
        self.dispatcher.shutdown();
    }
}

/// Fill acknowledged writes with the value that was written
fn echo_writes(writes: &[(Entry, Value)], acks: Vec<Option<ResponseEntry>>) -> Vec<ResponseEntry> {
    acks.into_iter()
        .zip(writes)
        .map(|(ack, (_, value))| ack.unwrap_or_else(|| ResponseEntry::value(value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use multinet_core::{entries, ErrorKind, MockBackend};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn multi() -> (MultiRequest, Arc<MockBackend>) {
        let ado = Arc::new(MockBackend::new("ado"));
        ado.add_value("simple.test:sinM", 0.5).unwrap();
        let config = MultinetConfig::from_toml_str("[routing]\ndefault_backend = \"ado\"").unwrap();
        let multi = MultiRequest::builder()
            .config(config)
            .backend(ado.clone())
            .build()
            .unwrap();
        (multi, ado)
    }

    #[test]
    fn echo_fills_missing_acks() {
        let writes = vec![
            (Entry::parse("d:a").unwrap(), json!(1)),
            (Entry::parse("d:b").unwrap(), json!(2)),
        ];
        let failed = ResponseEntry::error(multinet_core::EntryError::device(Some(3), "ro"));
        let echoed = echo_writes(&writes, vec![None, Some(failed.clone())]);
        assert_eq!(echoed, vec![ResponseEntry::value(json!(1)), failed]);
    }

    #[tokio::test]
    async fn invalid_ppm_user_fails_before_any_backend_call() {
        let (multi, ado) = multi();
        let err = multi
            .get(["simple.test:sinM"], GetOptions::new().ppm_user(9))
            .await
            .unwrap_err();
        assert!(matches!(err, MultinetError::InvalidArgument(_)));
        assert!(ado.get_requests().is_empty());
    }

    #[tokio::test]
    async fn malformed_entry_fails_the_call() {
        let (multi, ado) = multi();
        let err = multi
            .get(entries!["simple.test:sinM", "broken"], GetOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidArgument));
        assert!(ado.get_requests().is_empty());
    }

    #[tokio::test]
    async fn timestamp_option_strips_times() {
        let (multi, _ado) = multi();
        let with = multi.get(["simple.test:sinM"], GetOptions::new()).await.unwrap();
        assert!(with.value_and_time("simple.test:sinM").is_some());

        let without = multi
            .get(["simple.test:sinM"], GetOptions::new().timestamp(false))
            .await
            .unwrap();
        assert_eq!(without.value("simple.test:sinM"), Some(&json!(0.5)));
        assert!(without.value_and_time("simple.test:sinM").is_none());
    }

    #[tokio::test]
    async fn empty_async_request_is_rejected() {
        let (multi, _ado) = multi();
        let err = multi
            .get_async(|_, _| Ok(()), Vec::<&str>::new(), AsyncOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MultinetError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn handler_ppm_users_are_validated_at_registration() {
        let (multi, _ado) = multi();
        let err = multi
            .register_handler(["simple.test:sinM"], &[1, 9], |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, MultinetError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn drop_releases_backend_registrations() {
        let (multi, ado) = multi();
        multi
            .get_async(|_, _| Ok(()), ["simple.test:sinM"], AsyncOptions::new())
            .await
            .unwrap();
        assert_eq!(ado.subscription_count(), 1);
        drop(multi);
        assert_eq!(ado.subscription_count(), 0);
    }
}
