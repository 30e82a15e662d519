//! ProtocolBackend trait - the capability every wire protocol exposes

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::entry::{Entry, PpmUser};
use crate::error::{BackendError, BackendResult};
use crate::models::ResponseEntry;
use crate::routing::BackendRef;

/// Metadata describing one entry (units, limits, type, ...)
pub type Metadata = serde_json::Map<String, Value>;

/// Push callback handed to a backend on `subscribe`.
///
/// The backend calls [`PushSink::push`] on every value change, from any of
/// its own threads or tasks. Successive updates to the same entry must be
/// pushed in order; no ordering is expected across entries.
#[derive(Clone)]
pub struct PushSink(Arc<dyn Fn(Entry, ResponseEntry) + Send + Sync>);

impl PushSink {
    pub fn new(f: impl Fn(Entry, ResponseEntry) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn push(&self, entry: Entry, response: ResponseEntry) {
        (self.0)(entry, response)
    }
}

impl fmt::Debug for PushSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PushSink")
    }
}

/// Token identifying one backend-side subscription registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The core trait that all protocol backends implement.
///
/// Implementations own their transport, framing, authentication and
/// reconnection policy. Every list result is aligned positionally with its
/// input; a whole-call `Err` applies to every entry of that call.
///
/// Backends can leave default implementations for features they don't support.
#[async_trait]
pub trait ProtocolBackend: Send + Sync {
    /// Routing identity of this backend
    fn backend_ref(&self) -> &BackendRef;

    /// Read entries
    async fn get(
        &self,
        entries: &[Entry],
        ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<ResponseEntry>>;

    /// Write entries; `None` marks a write that succeeded without echoing data
    async fn set(
        &self,
        entries: &[(Entry, Value)],
        ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<Option<ResponseEntry>>>;

    /// Register for push updates on `entries`
    async fn subscribe(
        &self,
        entries: &[Entry],
        ppm_user: Option<PpmUser>,
        sink: PushSink,
    ) -> BackendResult<SubscriptionHandle>;

    /// Drop a registration. Must not block on I/O and must tolerate
    /// unknown or already-released handles.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> BackendResult<()>;

    /// Read entry metadata (JSON objects)
    async fn get_meta(
        &self,
        entries: &[Entry],
        ppm_user: Option<PpmUser>,
    ) -> BackendResult<Vec<ResponseEntry>> {
        let _ = (entries, ppm_user);
        Err(BackendError::NotSupported("get_meta".to_string()))
    }

    /// Enable or disable set history recording
    async fn set_history(&self, enabled: bool) -> BackendResult<()> {
        let _ = enabled;
        Err(BackendError::NotSupported("set_history".to_string()))
    }
}
