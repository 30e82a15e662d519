//! Mock protocol backend for testing
//!
//! Serves values from an in-memory table, keeps a registry of push
//! subscriptions and lets tests inject value changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::backend::{Metadata, ProtocolBackend, PushSink, SubscriptionHandle};
use crate::entry::{Entry, EntrySpec, PpmUser};
use crate::error::{BackendError, BackendResult, Result};
use crate::models::{EntryError, ResponseEntry};
use crate::routing::BackendRef;

/// Status reported for entries the mock does not know
pub const STATUS_NO_SUCH_NAME: i32 = 1001;

struct MockSubscription {
    entries: HashSet<Entry>,
    ppm_user: Option<PpmUser>,
    sink: PushSink,
}

/// In-process backend used by unit and integration tests
pub struct MockBackend {
    backend_ref: BackendRef,
    connected: AtomicBool,
    latency: Option<Duration>,
    values: RwLock<HashMap<(Option<PpmUser>, Entry), ResponseEntry>>,
    metadata: RwLock<HashMap<Entry, Metadata>>,
    subscriptions: RwLock<HashMap<u64, MockSubscription>>,
    next_handle: AtomicU64,
    history: AtomicBool,
    /// Entry lists received by `get`, in call order
    get_requests: Mutex<Vec<Vec<Entry>>>,
}

impl MockBackend {
    pub fn new(backend_ref: impl Into<BackendRef>) -> Self {
        Self {
            backend_ref: backend_ref.into(),
            connected: AtomicBool::new(true),
            latency: None,
            values: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            history: AtomicBool::new(true),
            get_requests: Mutex::new(Vec::new()),
        }
    }

    /// Simulate network latency on every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set connection state
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Serve `value` for `entry` when no PPM user is selected
    pub fn add_value(&self, entry: impl Into<EntrySpec>, value: impl Into<Value>) -> Result<()> {
        self.add_value_for(None, entry, value)
    }

    pub fn add_value_for(
        &self,
        ppm_user: Option<PpmUser>,
        entry: impl Into<EntrySpec>,
        value: impl Into<Value>,
    ) -> Result<()> {
        let entry = entry.into().into_entry()?;
        self.values
            .write()
            .insert((ppm_user, entry), ResponseEntry::value_at(value, Utc::now()));
        Ok(())
    }

    /// Make `entry` fail with a device status (reads and writes)
    pub fn add_error(
        &self,
        entry: impl Into<EntrySpec>,
        status: i32,
        message: impl Into<String>,
    ) -> Result<()> {
        let entry = entry.into().into_entry()?;
        self.values.write().insert(
            (None, entry),
            ResponseEntry::error(EntryError::device(Some(status), message)),
        );
        Ok(())
    }

    pub fn add_metadata(&self, entry: impl Into<EntrySpec>, metadata: Metadata) -> Result<()> {
        let entry = entry.into().into_entry()?;
        self.metadata.write().insert(entry, metadata);
        Ok(())
    }

    /// Deliver `response` to every subscription on `entry` for `ppm_user`.
    ///
    /// Returns how many subscriptions were notified.
    pub fn push(&self, ppm_user: Option<PpmUser>, entry: &Entry, response: ResponseEntry) -> usize {
        let sinks: Vec<PushSink> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.ppm_user == ppm_user && s.entries.contains(entry))
            .map(|s| s.sink.clone())
            .collect();

        for sink in &sinks {
            sink.push(entry.clone(), response.clone());
        }
        sinks.len()
    }

    /// Store a new value and push it to subscribers (no PPM user)
    pub fn push_value(&self, entry: impl Into<EntrySpec>, value: impl Into<Value>) -> Result<usize> {
        let entry = entry.into().into_entry()?;
        let response = ResponseEntry::value_at(value, Utc::now());
        self.values
            .write()
            .insert((None, entry.clone()), response.clone());
        Ok(self.push(None, &entry, response))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn get_requests(&self) -> Vec<Vec<Entry>> {
        self.get_requests.lock().clone()
    }

    pub fn history_enabled(&self) -> bool {
        self.history.load(Ordering::SeqCst)
    }

    async fn simulate_io(&self) -> BackendResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BackendError::Connection(format!(
                "{} backend unreachable",
                self.backend_ref
            )));
        }
        Ok(())
    }

    fn lookup(&self, ppm_user: Option<PpmUser>, entry: &Entry) -> ResponseEntry {
        let values = self.values.read();
        values
            .get(&(ppm_user, entry.clone()))
            .or_else(|| values.get(&(None, entry.clone())).filter(|r| r.is_error()))
            .cloned()
            .unwrap_or_else(|| no_such_name(entry))
    }
}

fn no_such_name(entry: &Entry) -> ResponseEntry {
    ResponseEntry::error(EntryError::device(
        Some(STATUS_NO_SUCH_NAME),
        format!("no such name: {}", entry),
    ))
}

#[async_trait]
impl ProtocolBackend for MockBackend {
    fn backend_ref(&self) -> &BackendRef {
        &self.backend_ref
    }

    async fn get(
        &self,
        entries: &[Entry],
        ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<ResponseEntry>> {
        self.simulate_io().await?;
        self.get_requests.lock().push(entries.to_vec());
        Ok(entries.iter().map(|e| self.lookup(ppm_user, e)).collect())
    }

    async fn set(
        &self,
        entries: &[(Entry, Value)],
        ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<Option<ResponseEntry>>> {
        self.simulate_io().await?;

        let mut results = Vec::with_capacity(entries.len());
        for (entry, value) in entries {
            if let ResponseEntry::Error(err) = self.lookup(ppm_user, entry) {
                if err.status != Some(STATUS_NO_SUCH_NAME) {
                    results.push(Some(ResponseEntry::Error(err)));
                    continue;
                }
            }
            let response = ResponseEntry::value_at(value.clone(), Utc::now());
            self.values
                .write()
                .insert((ppm_user, entry.clone()), response.clone());
            self.push(ppm_user, entry, response);
            results.push(None);
        }
        Ok(results)
    }

    async fn subscribe(
        &self,
        entries: &[Entry],
        ppm_user: Option<PpmUser>,
        sink: PushSink,
    ) -> BackendResult<SubscriptionHandle> {
        self.simulate_io().await?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().insert(
            handle,
            MockSubscription {
                entries: entries.iter().cloned().collect(),
                ppm_user,
                sink,
            },
        );
        tracing::debug!(backend = %self.backend_ref, handle, "Mock subscription registered");
        Ok(SubscriptionHandle(handle))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> BackendResult<()> {
        self.subscriptions.write().remove(&handle.0);
        Ok(())
    }

    async fn get_meta(
        &self,
        entries: &[Entry],
        _ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<ResponseEntry>> {
        self.simulate_io().await?;
        let metadata = self.metadata.read();
        Ok(entries
            .iter()
            .map(|e| match metadata.get(e) {
                Some(meta) => ResponseEntry::value(Value::Object(meta.clone())),
                None => no_such_name(e),
            })
            .collect())
    }

    async fn set_history(&self, enabled: bool) -> BackendResult<()> {
        self.simulate_io().await?;
        self.history.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}
