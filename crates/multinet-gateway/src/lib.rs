//! multinet-gateway - Multiplexed access to control-system entries
//!
//! This crate routes entries to the protocol backend serving their device,
//! merges per-backend results into one ordered response and delivers
//! asynchronous value changes to user callbacks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          MultiRequest                            │
//! │                                                                  │
//! │   get / set / get_meta            get_async / cancel             │
//! │          │                                │                      │
//! │          ▼                                ▼                      │
//! │  ┌────────────────┐              ┌─────────────────────┐         │
//! │  │ ProtocolRouter │◄─────────────│ SubscriptionManager │         │
//! │  │  (partition)   │              │  (buffer, trigger)  │         │
//! │  └───────┬────────┘              └──────────┬──────────┘         │
//! │          │                                  │ deliveries         │
//! │          ▼                                  ▼                    │
//! │  ┌────────────────┐              ┌─────────────────────┐         │
//! │  │   aggregate    │              │   Dispatch thread   │         │
//! │  │    (merge)     │              │ (filters, callback) │         │
//! │  └────────────────┘              └─────────────────────┘         │
//! │          │                                                       │
//! │    ┌─────┴───────────────┬─────────────────────┐                 │
//! │    ▼                     ▼                     ▼                 │
//! │ ┌──────────┐       ┌──────────┐          ┌──────────┐            │
//! │ │   ADO    │       │   CDEV   │          │   HTTP   │            │
//! │ │ backend  │       │ backend  │          │ backend  │            │
//! │ └──────────┘       └──────────┘          └──────────┘            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use multinet_gateway::{AsyncOptions, GetOptions, Grouping, MultiRequest, MultinetConfig};
//!
//! let multi = MultiRequest::builder()
//!     .config(MultinetConfig::load("multinet.toml")?)
//!     .backend(ado_backend)
//!     .backend(cdev_backend)
//!     .build()?;
//!
//! let response = multi
//!     .get(entries!["simple.test:sinM", ("simple.cdev", "degM")], GetOptions::new())
//!     .await?;
//! for (entry, error) in response.all_errors().iter() {
//!     eprintln!("{}: {:?}", entry, error);
//! }
//!
//! let request = multi
//!     .get_async(
//!         |data, ppm_user| {
//!             println!("{:?} {:?}", ppm_user, data);
//!             Ok(())
//!         },
//!         ["simple.test:sinM", "simple.test:intS"],
//!         AsyncOptions::new().grouping(Grouping::Ado).ppm_user(1),
//!     )
//!     .await?;
//! multi.cancel(request.id);
//! ```

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod filters;
pub mod handlers;
pub mod multirequest;
pub mod router;
pub mod subscription;

pub use config::{DispatchConfig, MultinetConfig, RequestDefaults, RoutingConfig};
pub use dispatch::{CallbackFailure, Dispatcher};
pub use filters::{AnyChange, DeliveryFilter};
pub use handlers::Handler;
pub use multirequest::{AsyncOptions, GetOptions, MultiRequest, MultiRequestBuilder, SetOptions};
pub use router::{Partition, ProtocolRouter, RequestBatch};
pub use subscription::{
    AsyncRequest, Callback, GroupKey, Grouping, Subscription, SubscriptionId, SubscriptionManager,
    SubscriptionParams,
};

// Re-export core types for convenience
pub use multinet_core::{
    entries, BackendError, BackendRef, DeviceDirectory, Entry, EntrySpec, ErrorKind,
    MultinetError, MultinetResponse, PpmUser, ProtocolBackend, ResponseEntry, Result,
};
