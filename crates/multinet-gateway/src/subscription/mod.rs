//! Subscription management for asynchronous value updates
//!
//! Each `get_async` call creates one [`Subscription`]. Backends push value
//! changes into it; the subscription buffers them per entry and decides,
//! according to its [`Grouping`], when a change fires a delivery onto the
//! dispatch queue.

mod manager;
mod state;

use std::fmt;
use std::str::FromStr;

use multinet_core::{Entry, MultinetError, MultinetResponse, PpmUser};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use manager::SubscriptionManager;
pub use state::{Subscription, SubscriptionParams};

/// User callback for async deliveries
pub type Callback =
    Box<dyn FnMut(MultinetResponse, Option<PpmUser>) -> anyhow::Result<()> + Send + 'static>;

/// Identifier of one `get_async` registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How buffered updates are batched before a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    /// One delivery per device, fired by the device's first registered entry
    Ado,
    /// One delivery per (device, parameter), fired by its first registered entry
    Parameter,
    /// Every update is delivered on its own
    #[default]
    Individual,
}

impl Grouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grouping::Ado => "ado",
            Grouping::Parameter => "parameter",
            Grouping::Individual => "individual",
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Grouping {
    type Err = MultinetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ado" => Ok(Grouping::Ado),
            "parameter" => Ok(Grouping::Parameter),
            "individual" => Ok(Grouping::Individual),
            other => Err(MultinetError::invalid(format!(
                "unknown grouping '{}' (expected ado, parameter or individual)",
                other
            ))),
        }
    }
}

/// Group an entry belongs to under a grouping mode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    Device(String),
    Parameter(String, String),
    Entry(Entry),
}

impl GroupKey {
    pub fn of(grouping: Grouping, entry: &Entry) -> Self {
        match grouping {
            Grouping::Ado => GroupKey::Device(entry.device().to_string()),
            Grouping::Parameter => {
                GroupKey::Parameter(entry.device().to_string(), entry.parameter().to_string())
            }
            Grouping::Individual => GroupKey::Entry(entry.clone()),
        }
    }
}

/// Handle returned by `get_async`
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    pub id: SubscriptionId,
    /// Entries that could not be registered with their backend, in request order
    pub errors: MultinetResponse,
}

impl AsyncRequest {
    /// True when every entry was registered
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_parses_lowercase_names() {
        assert_eq!("ado".parse::<Grouping>().unwrap(), Grouping::Ado);
        assert_eq!("parameter".parse::<Grouping>().unwrap(), Grouping::Parameter);
        assert_eq!("individual".parse::<Grouping>().unwrap(), Grouping::Individual);
        assert!(matches!(
            "device".parse::<Grouping>(),
            Err(MultinetError::InvalidArgument(_))
        ));
        assert_eq!(Grouping::default(), Grouping::Individual);
    }

    #[test]
    fn subscription_ids_serialize_as_uuid() {
        let id = SubscriptionId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
        assert_eq!(
            serde_json::to_value(id).unwrap(),
            serde_json::Value::String(id.as_uuid().to_string())
        );
        assert_ne!(id, SubscriptionId::new());
    }

    #[test]
    fn group_keys_follow_grouping() {
        let a = Entry::parse("d:p1").unwrap();
        let b = Entry::parse("d:p2").unwrap();
        let c = Entry::parse("d:p1:units").unwrap();

        assert_eq!(GroupKey::of(Grouping::Ado, &a), GroupKey::of(Grouping::Ado, &b));
        assert_ne!(
            GroupKey::of(Grouping::Parameter, &a),
            GroupKey::of(Grouping::Parameter, &b)
        );
        assert_eq!(
            GroupKey::of(Grouping::Parameter, &a),
            GroupKey::of(Grouping::Parameter, &c)
        );
        assert_ne!(
            GroupKey::of(Grouping::Individual, &a),
            GroupKey::of(Grouping::Individual, &c)
        );
    }
}
