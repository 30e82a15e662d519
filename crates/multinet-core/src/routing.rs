//! Backend identities and device directory lookups.
//!
//! Every device is served by exactly one backend protocol. Which one is a
//! property of the device id and is answered by a [`DeviceDirectory`] (in
//! production, the control system's name service).

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

/// Opaque identifier of a backend protocol (`"ado"`, `"cdev"`, `"http"`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(String);

impl BackendRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Resolves which backend serves a device.
///
/// `Ok(None)` means the directory does not know the device. Errors mean
/// the directory itself could not be consulted.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn lookup(&self, device: &str) -> BackendResult<Option<BackendRef>>;
}

/// Directory backed by a fixed route table plus an optional fallback
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    routes: HashMap<String, BackendRef>,
    default_backend: Option<BackendRef>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `device` to `backend`
    pub fn route(mut self, device: impl Into<String>, backend: impl Into<BackendRef>) -> Self {
        self.routes.insert(device.into(), backend.into());
        self
    }

    /// Backend for devices without an explicit route
    pub fn with_default(mut self, backend: impl Into<BackendRef>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    pub fn from_routes(
        routes: HashMap<String, BackendRef>,
        default_backend: Option<BackendRef>,
    ) -> Self {
        Self {
            routes,
            default_backend,
        }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn lookup(&self, device: &str) -> BackendResult<Option<BackendRef>> {
        Ok(self
            .routes
            .get(device)
            .or(self.default_backend.as_ref())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_routes_win_over_default() {
        let dir = StaticDirectory::new()
            .route("simple.cdev", "cdev")
            .with_default("ado");
        assert_eq!(
            dir.lookup("simple.cdev").await.unwrap(),
            Some(BackendRef::new("cdev"))
        );
        assert_eq!(
            dir.lookup("simple.test").await.unwrap(),
            Some(BackendRef::new("ado"))
        );
    }

    #[tokio::test]
    async fn unknown_device_without_default() {
        let dir = StaticDirectory::new().route("simple.test", "ado");
        assert_eq!(dir.lookup("nowhere").await.unwrap(), None);
    }
}
