//! multinet-core - Core traits and types for the multinet access layer
//!
//! This crate provides the fundamental abstractions that allow different
//! control-system protocols (ADO, CDEV, HTTP gateway, ...) to be addressed
//! through one entry model and one capability interface.

pub mod backend;
pub mod entry;
pub mod error;
pub mod mock;
pub mod models;
pub mod routing;

pub use backend::{Metadata, ProtocolBackend, PushSink, SubscriptionHandle};
pub use entry::{parse_entries, validate_ppm_user, Entry, EntrySpec, PpmUser, DEFAULT_PROPERTY};
pub use error::{BackendError, BackendResult, ErrorKind, MultinetError, Result};
pub use mock::MockBackend;
pub use models::*;
pub use routing::{BackendRef, DeviceDirectory, StaticDirectory};
