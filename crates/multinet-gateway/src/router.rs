//! Protocol Router - maps entries to backends and fans calls out
//!
//! A logical call is partitioned into one [`RequestBatch`] per backend.
//! Each batch remembers which request positions its items came from so the
//! aggregator can put results back in request order. Batches for different
//! backends run concurrently; one backend failing never cancels its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use multinet_core::{
    BackendRef, BackendResult, DeviceDirectory, Entry, EntryError, PpmUser, ProtocolBackend,
    ResponseEntry,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Items destined for one backend within one logical call
pub struct RequestBatch<T> {
    pub backend: Arc<dyn ProtocolBackend>,
    /// Items sent to the backend, in first-seen order
    pub items: Vec<T>,
    /// Request positions served by each item (more than one when coalesced)
    pub positions: Vec<Vec<usize>>,
}

impl<T> RequestBatch<T> {
    fn new(backend: Arc<dyn ProtocolBackend>) -> Self {
        Self {
            backend,
            items: Vec::new(),
            positions: Vec::new(),
        }
    }

    pub fn backend_ref(&self) -> &BackendRef {
        self.backend.backend_ref()
    }

    fn push(&mut self, item: T, position: usize) -> usize {
        self.items.push(item);
        self.positions.push(vec![position]);
        self.items.len() - 1
    }
}

/// Result of partitioning one logical call
pub struct Partition<T> {
    pub batches: Vec<RequestBatch<T>>,
    /// Positions that could not be routed, with the reason
    pub unroutable: Vec<(usize, EntryError)>,
}

impl<T> Default for Partition<T> {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            unroutable: Vec::new(),
        }
    }
}

impl<T> Partition<T> {
    fn batch_for(
        &mut self,
        index: &mut HashMap<BackendRef, usize>,
        backend: Arc<dyn ProtocolBackend>,
    ) -> usize {
        let batches = &mut self.batches;
        *index
            .entry(backend.backend_ref().clone())
            .or_insert_with(|| {
                batches.push(RequestBatch::new(backend));
                batches.len() - 1
            })
    }
}

type Route = std::result::Result<Arc<dyn ProtocolBackend>, EntryError>;

/// Routes entries to registered protocol backends
pub struct ProtocolRouter {
    directory: Arc<dyn DeviceDirectory>,
    backends: RwLock<HashMap<BackendRef, Arc<dyn ProtocolBackend>>>,
    /// Device → backend, filled on first successful lookup
    resolved: RwLock<HashMap<String, BackendRef>>,
}

impl ProtocolRouter {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self {
            directory,
            backends: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Register a backend under its own [`BackendRef`]
    pub fn register_backend(&self, backend: Arc<dyn ProtocolBackend>) {
        let id = backend.backend_ref().clone();
        info!(backend = %id, "Registering protocol backend");
        self.backends.write().insert(id, backend);
    }

    pub fn unregister_backend(&self, id: &BackendRef) -> Option<Arc<dyn ProtocolBackend>> {
        let removed = self.backends.write().remove(id);
        if removed.is_some() {
            info!(backend = %id, "Unregistered protocol backend");
        }
        removed
    }

    pub fn backend(&self, id: &BackendRef) -> Option<Arc<dyn ProtocolBackend>> {
        self.backends.read().get(id).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<dyn ProtocolBackend>> {
        self.backends.read().values().cloned().collect()
    }

    /// Which backend serves `entry`'s device.
    ///
    /// Successful lookups are cached for the lifetime of the router;
    /// failures are retried on the next call.
    pub async fn resolve_backend(
        &self,
        entry: &Entry,
    ) -> std::result::Result<BackendRef, EntryError> {
        self.resolve_device(entry.device()).await
    }

    async fn resolve_device(&self, device: &str) -> std::result::Result<BackendRef, EntryError> {
        if let Some(backend) = self.resolved.read().get(device) {
            return Ok(backend.clone());
        }

        match self.directory.lookup(device).await {
            Ok(Some(backend)) => {
                debug!(device = %device, backend = %backend, "Resolved device backend");
                self.resolved
                    .write()
                    .insert(device.to_string(), backend.clone());
                Ok(backend)
            }
            Ok(None) => Err(EntryError::device(
                None,
                format!("No backend serves device '{}'", device),
            )),
            Err(e) => {
                warn!(device = %device, error = %e, "Device directory lookup failed");
                Err(EntryError::connection(format!(
                    "Device directory lookup failed for '{}': {}",
                    device, e
                )))
            }
        }
    }

    async fn route(&self, device: &str) -> Route {
        let id = self.resolve_device(device).await?;
        self.backend(&id).ok_or_else(|| {
            EntryError::connection(format!("Backend '{}' is not registered", id))
        })
    }

    /// Route every entry, consulting the directory once per distinct device
    async fn route_each<'a>(&self, entries: impl IntoIterator<Item = &'a Entry>) -> Vec<Route> {
        let mut by_device: HashMap<&'a str, Route> = HashMap::new();
        let mut routes = Vec::new();
        for entry in entries {
            let route = match by_device.get(entry.device()) {
                Some(route) => route.clone(),
                None => {
                    let route = self.route(entry.device()).await;
                    by_device.insert(entry.device(), route.clone());
                    route
                }
            };
            routes.push(route);
        }
        routes
    }

    /// Group entries by backend, coalescing duplicates into one item
    pub async fn partition(&self, entries: &[Entry]) -> Partition<Entry> {
        let routes = self.route_each(entries).await;
        let mut partition = Partition::default();
        let mut index = HashMap::new();
        let mut seen: HashMap<&Entry, (usize, usize)> = HashMap::new();

        for (position, (entry, route)) in entries.iter().zip(routes).enumerate() {
            if let Some(&(batch, slot)) = seen.get(entry) {
                partition.batches[batch].positions[slot].push(position);
                continue;
            }
            match route {
                Ok(backend) => {
                    let batch = partition.batch_for(&mut index, backend);
                    let slot = partition.batches[batch].push(entry.clone(), position);
                    seen.insert(entry, (batch, slot));
                }
                Err(err) => partition.unroutable.push((position, err)),
            }
        }
        partition
    }

    /// Group writes by backend; every write is kept, duplicates included
    pub async fn partition_writes(&self, writes: Vec<(Entry, Value)>) -> Partition<(Entry, Value)> {
        let routes = self.route_each(writes.iter().map(|(e, _)| e)).await;
        let mut partition = Partition::default();
        let mut index = HashMap::new();

        for (position, (write, route)) in writes.into_iter().zip(routes).enumerate() {
            match route {
                Ok(backend) => {
                    let batch = partition.batch_for(&mut index, backend);
                    partition.batches[batch].push(write, position);
                }
                Err(err) => partition.unroutable.push((position, err)),
            }
        }
        partition
    }

    /// Read every batch concurrently; results align with `batches`
    pub async fn get(
        &self,
        batches: &[RequestBatch<Entry>],
        ppm_user: Option<PpmUser>,
    ) -> Vec<BackendResult<Vec<ResponseEntry>>> {
        let results = join_all(
            batches
                .iter()
                .map(|batch| batch.backend.get(&batch.items, ppm_user)),
        )
        .await;
        log_failures("get", batches, &results);
        results
    }

    /// Write every batch concurrently; results align with `batches`
    pub async fn set(
        &self,
        batches: &[RequestBatch<(Entry, Value)>],
        ppm_user: Option<PpmUser>,
    ) -> Vec<BackendResult<Vec<Option<ResponseEntry>>>> {
        let results = join_all(
            batches
                .iter()
                .map(|batch| batch.backend.set(&batch.items, ppm_user)),
        )
        .await;
        log_failures("set", batches, &results);
        results
    }

    pub async fn get_meta(
        &self,
        batches: &[RequestBatch<Entry>],
        ppm_user: Option<PpmUser>,
    ) -> Vec<BackendResult<Vec<ResponseEntry>>> {
        let results = join_all(
            batches
                .iter()
                .map(|batch| batch.backend.get_meta(&batch.items, ppm_user)),
        )
        .await;
        log_failures("get_meta", batches, &results);
        results
    }
}

fn log_failures<T, R>(operation: &str, batches: &[RequestBatch<T>], results: &[BackendResult<R>]) {
    for (batch, result) in batches.iter().zip(results) {
        if let Err(e) = result {
            warn!(
                backend = %batch.backend_ref(),
                operation,
                entries = batch.items.len(),
                error = %e,
                "Backend call failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use multinet_core::{BackendError, ErrorKind, MockBackend, StaticDirectory};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entries(list: &[&str]) -> Vec<Entry> {
        list.iter().map(|s| Entry::parse(s).unwrap()).collect()
    }

    fn router() -> ProtocolRouter {
        let directory = StaticDirectory::new()
            .route("simple.cdev", "cdev")
            .route("web.status", "http")
            .with_default("ado");
        let router = ProtocolRouter::new(Arc::new(directory));
        router.register_backend(Arc::new(MockBackend::new("ado")));
        router.register_backend(Arc::new(MockBackend::new("cdev")));
        router
    }

    /// Directory that counts lookups and fails for one device
    struct CountingDirectory {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl DeviceDirectory for CountingDirectory {
        async fn lookup(&self, device: &str) -> BackendResult<Option<BackendRef>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if device == "broken.dev" {
                return Err(BackendError::Timeout);
            }
            Ok(Some(BackendRef::new("ado")))
        }
    }

    #[tokio::test]
    async fn partition_groups_by_backend_and_keeps_positions() {
        let router = router();
        let request = entries(&["simple.test:sinM", "simple.cdev:degM", "simple.test:intS"]);
        let partition = router.partition(&request).await;

        assert!(partition.unroutable.is_empty());
        assert_eq!(partition.batches.len(), 2);
        let ado = &partition.batches[0];
        assert_eq!(ado.backend_ref().as_str(), "ado");
        assert_eq!(ado.items, vec![request[0].clone(), request[2].clone()]);
        assert_eq!(ado.positions, vec![vec![0], vec![2]]);
        assert_eq!(partition.batches[1].positions, vec![vec![1]]);
    }

    #[tokio::test]
    async fn duplicate_entries_are_coalesced() {
        let router = router();
        let request = entries(&["simple.test:sinM", "simple.test:sinM:value"]);
        let partition = router.partition(&request).await;
        assert_eq!(partition.batches.len(), 1);
        assert_eq!(partition.batches[0].items.len(), 1);
        assert_eq!(partition.batches[0].positions, vec![vec![0, 1]]);
    }

    #[tokio::test]
    async fn writes_are_never_coalesced() {
        let router = router();
        let writes = vec![
            (Entry::parse("simple.test:intS").unwrap(), Value::from(1)),
            (Entry::parse("simple.test:intS").unwrap(), Value::from(2)),
        ];
        let partition = router.partition_writes(writes).await;
        assert_eq!(partition.batches[0].items.len(), 2);
        assert_eq!(partition.batches[0].positions, vec![vec![0], vec![1]]);
    }

    #[tokio::test]
    async fn unregistered_backend_is_unroutable() {
        let router = router();
        let partition = router.partition(&entries(&["web.status:up"])).await;
        assert!(partition.batches.is_empty());
        let (position, err) = &partition.unroutable[0];
        assert_eq!(*position, 0);
        assert_eq!(err.kind, ErrorKind::ConnectionFailure);
    }

    #[tokio::test]
    async fn unregistering_a_backend_stops_routing_to_it() {
        let router = router();
        let cdev = BackendRef::new("cdev");
        assert!(router.unregister_backend(&cdev).is_some());
        assert!(router.unregister_backend(&cdev).is_none());
        assert!(router.backend(&cdev).is_none());

        let partition = router
            .partition(&entries(&["simple.cdev:degM", "simple.test:sinM"]))
            .await;
        assert_eq!(partition.batches.len(), 1);
        assert_eq!(partition.batches[0].backend_ref().as_str(), "ado");
        let (position, err) = &partition.unroutable[0];
        assert_eq!(*position, 0);
        assert_eq!(err.kind, ErrorKind::ConnectionFailure);
    }

    #[tokio::test]
    async fn unknown_device_without_default_is_a_device_error() {
        let router = ProtocolRouter::new(Arc::new(StaticDirectory::new()));
        let err = router
            .resolve_backend(&Entry::parse("nowhere:x").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceError);
    }

    #[tokio::test]
    async fn successful_lookups_are_cached_and_failures_are_not() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
        });
        let router = ProtocolRouter::new(directory.clone());
        let good = Entry::parse("simple.test:sinM").unwrap();
        let bad = Entry::parse("broken.dev:x").unwrap();

        router.resolve_backend(&good).await.unwrap();
        router.resolve_backend(&good).await.unwrap();
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);

        let err = router.resolve_backend(&bad).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionFailure);
        router.resolve_backend(&bad).await.unwrap_err();
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fan_out_isolates_backend_failures() {
        let ado = Arc::new(MockBackend::new("ado"));
        ado.add_value("simple.test:sinM", 0.5).unwrap();
        let cdev = Arc::new(MockBackend::new("cdev"));
        cdev.set_connected(false);

        let directory = StaticDirectory::new()
            .route("simple.cdev", "cdev")
            .with_default("ado");
        let router = ProtocolRouter::new(Arc::new(directory));
        router.register_backend(ado);
        router.register_backend(cdev);

        let partition = router
            .partition(&entries(&["simple.test:sinM", "simple.cdev:degM"]))
            .await;
        let results = router.get(&partition.batches, None).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(BackendError::Connection(_))));
    }
}
