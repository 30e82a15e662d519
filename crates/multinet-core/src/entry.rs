//! Entry addresses and PPM user selectors
//!
//! An [`Entry`] names one device/parameter/property triple. Callers can write
//! an entry either as a delimited string (`"simple.test:sinM"`) or as a tuple
//! (`("simple.test", "sinM")`); both normalize to the same canonical value,
//! which is what equality and hashing use.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MultinetError, Result};

/// Property used when an address omits one
pub const DEFAULT_PROPERTY: &str = "value";

/// Separator of the delimited string form
pub const DELIMITER: char = ':';

/// Canonical device/parameter/property address.
///
/// The property is always populated; an omitted property becomes
/// [`DEFAULT_PROPERTY`]. Serialized as its delimited string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Entry {
    device: String,
    parameter: String,
    property: String,
}

impl Entry {
    /// Build an entry from its parts, validating each segment
    pub fn new(
        device: impl Into<String>,
        parameter: impl Into<String>,
        property: Option<String>,
    ) -> Result<Self> {
        let device = segment("device", device.into())?;
        let parameter = segment("parameter", parameter.into())?;
        let property = match property {
            Some(p) => segment("property", p)?,
            None => DEFAULT_PROPERTY.to_string(),
        };
        Ok(Self {
            device,
            parameter,
            property,
        })
    }

    /// Parse the delimited form `device:parameter[:property]`
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split(DELIMITER).collect();
        match parts.as_slice() {
            [device, parameter] => Self::new(*device, *parameter, None),
            [device, parameter, property] => {
                Self::new(*device, *parameter, Some(property.to_string()))
            }
            _ => Err(MultinetError::invalid(format!(
                "entry '{}' must have the form device:parameter[:property]",
                input
            ))),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    /// Same device and parameter with a different property
    pub fn with_property(&self, property: impl Into<String>) -> Result<Self> {
        Self::new(
            self.device.clone(),
            self.parameter.clone(),
            Some(property.into()),
        )
    }
}

fn segment(what: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(MultinetError::invalid(format!("{} must not be empty", what)));
    }
    if value.contains(DELIMITER) {
        return Err(MultinetError::invalid(format!(
            "{} '{}' must not contain '{}'",
            what, value, DELIMITER
        )));
    }
    Ok(value)
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            self.device, DELIMITER, self.parameter, DELIMITER, self.property
        )
    }
}

impl FromStr for Entry {
    type Err = MultinetError;

    fn from_str(s: &str) -> Result<Self> {
        Entry::parse(s)
    }
}

impl TryFrom<String> for Entry {
    type Error = MultinetError;

    fn try_from(value: String) -> Result<Self> {
        Entry::parse(&value)
    }
}

impl From<Entry> for String {
    fn from(entry: Entry) -> Self {
        entry.to_string()
    }
}

/// Any accepted spelling of an entry, prior to validation.
///
/// Lets one call mix the string and tuple forms:
///
/// ```
/// # use multinet_core::{entries, parse_entries};
/// let parsed = parse_entries(entries!["simple.test:sinM", ("simple.cdev", "degM")]).unwrap();
/// assert_eq!(parsed[0].to_string(), "simple.test:sinM:value");
/// assert_eq!(parsed[1].device(), "simple.cdev");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum EntrySpec {
    /// Delimited string form
    Address(String),
    /// Tuple form
    Parts {
        device: String,
        parameter: String,
        property: Option<String>,
    },
    /// Already canonical
    Entry(Entry),
}

impl EntrySpec {
    /// Validate and normalize
    pub fn into_entry(self) -> Result<Entry> {
        match self {
            EntrySpec::Address(s) => Entry::parse(&s),
            EntrySpec::Parts {
                device,
                parameter,
                property,
            } => Entry::new(device, parameter, property),
            EntrySpec::Entry(e) => Ok(e),
        }
    }
}

impl TryFrom<EntrySpec> for Entry {
    type Error = MultinetError;

    fn try_from(spec: EntrySpec) -> Result<Self> {
        spec.into_entry()
    }
}

impl From<&str> for EntrySpec {
    fn from(s: &str) -> Self {
        EntrySpec::Address(s.to_string())
    }
}

impl From<String> for EntrySpec {
    fn from(s: String) -> Self {
        EntrySpec::Address(s)
    }
}

impl From<&String> for EntrySpec {
    fn from(s: &String) -> Self {
        EntrySpec::Address(s.clone())
    }
}

impl From<(&str, &str)> for EntrySpec {
    fn from((device, parameter): (&str, &str)) -> Self {
        EntrySpec::Parts {
            device: device.to_string(),
            parameter: parameter.to_string(),
            property: None,
        }
    }
}

impl From<(&str, &str, &str)> for EntrySpec {
    fn from((device, parameter, property): (&str, &str, &str)) -> Self {
        EntrySpec::Parts {
            device: device.to_string(),
            parameter: parameter.to_string(),
            property: Some(property.to_string()),
        }
    }
}

impl From<(String, String)> for EntrySpec {
    fn from((device, parameter): (String, String)) -> Self {
        EntrySpec::Parts {
            device,
            parameter,
            property: None,
        }
    }
}

impl From<(String, String, String)> for EntrySpec {
    fn from((device, parameter, property): (String, String, String)) -> Self {
        EntrySpec::Parts {
            device,
            parameter,
            property: Some(property),
        }
    }
}

impl From<Entry> for EntrySpec {
    fn from(entry: Entry) -> Self {
        EntrySpec::Entry(entry)
    }
}

impl From<&Entry> for EntrySpec {
    fn from(entry: &Entry) -> Self {
        EntrySpec::Entry(entry.clone())
    }
}

/// Build a `Vec<EntrySpec>` from mixed entry spellings
#[macro_export]
macro_rules! entries {
    ($($e:expr),* $(,)?) => {
        vec![$($crate::EntrySpec::from($e)),*]
    };
}

/// Validate a whole sequence of entries, failing on the first bad one
pub fn parse_entries<I, E>(entries: I) -> Result<Vec<Entry>>
where
    I: IntoIterator<Item = E>,
    E: Into<EntrySpec>,
{
    entries.into_iter().map(|e| e.into().into_entry()).collect()
}

/// PPM user selector, always within `[1, 8]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct PpmUser(u8);

impl PpmUser {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 8;

    pub fn new(n: i64) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&n) {
            Ok(Self(n as u8))
        } else {
            Err(MultinetError::invalid(format!(
                "PPM user must be within {}..={}, got {}",
                Self::MIN,
                Self::MAX,
                n
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Every valid PPM user in ascending order
    pub fn all() -> impl Iterator<Item = PpmUser> {
        (Self::MIN as u8..=Self::MAX as u8).map(PpmUser)
    }
}

impl TryFrom<i64> for PpmUser {
    type Error = MultinetError;

    fn try_from(n: i64) -> Result<Self> {
        PpmUser::new(n)
    }
}

impl From<PpmUser> for u8 {
    fn from(user: PpmUser) -> Self {
        user.0
    }
}

impl fmt::Display for PpmUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Enforce `1 <= n <= 8`
pub fn validate_ppm_user(n: i64) -> Result<PpmUser> {
    PpmUser::new(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tuple_and_string_forms_are_equal() {
        let from_tuple = EntrySpec::from(("simple.test", "sinM")).into_entry().unwrap();
        let from_str = Entry::parse("simple.test:sinM").unwrap();
        assert_eq!(from_tuple, from_str);

        let explicit = EntrySpec::from(("simple.test", "sinM", "value"))
            .into_entry()
            .unwrap();
        assert_eq!(explicit, from_str);

        let set: HashSet<Entry> = [from_tuple, from_str, explicit].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn property_defaults_to_value() {
        let entry = Entry::parse("simple.test:intS").unwrap();
        assert_eq!(entry.property(), DEFAULT_PROPERTY);
        assert_eq!(entry.to_string(), "simple.test:intS:value");
    }

    #[test]
    fn with_property_keeps_device_and_parameter() {
        let entry = Entry::parse("simple.test:sinM").unwrap();
        let units = entry.with_property("units").unwrap();
        assert_eq!(units.to_string(), "simple.test:sinM:units");
        assert_ne!(units, entry);
        assert!(entry.with_property("").is_err());
        assert!(entry.with_property("a:b").is_err());
    }

    #[test]
    fn explicit_property_is_kept() {
        let entry = Entry::parse("simple.test:sinM:timestampSeconds").unwrap();
        assert_eq!(entry.device(), "simple.test");
        assert_eq!(entry.parameter(), "sinM");
        assert_eq!(entry.property(), "timestampSeconds");
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for bad in ["", "simple.test", "a:b:c:d", ":sinM", "simple.test:", "a: :c"] {
            assert!(
                matches!(Entry::parse(bad), Err(MultinetError::InvalidArgument(_))),
                "expected '{}' to be rejected",
                bad
            );
        }
        assert!(EntrySpec::from(("dev:x", "param")).into_entry().is_err());
        assert!(EntrySpec::from(("dev", "")).into_entry().is_err());
    }

    #[test]
    fn mixed_sequences_parse_in_order() {
        let parsed = parse_entries(crate::entries![
            "a.dev:p1",
            ("b.dev", "p2"),
            ("c.dev", "p3", "units"),
            Entry::parse("d.dev:p4").unwrap(),
        ])
        .unwrap();
        let devices: Vec<&str> = parsed.iter().map(|e| e.device()).collect();
        assert_eq!(devices, ["a.dev", "b.dev", "c.dev", "d.dev"]);
        assert_eq!(parsed[2].property(), "units");
    }

    #[test]
    fn parse_entries_fails_on_first_bad_entry() {
        let result = parse_entries(["a:b", "broken", "c:d"]);
        assert!(matches!(result, Err(MultinetError::InvalidArgument(_))));
    }

    #[test]
    fn ppm_user_range() {
        for n in 1..=8 {
            assert_eq!(validate_ppm_user(n).unwrap().get() as i64, n);
        }
        for n in [-1, 0, 9, 100, i64::MIN, i64::MAX] {
            assert!(validate_ppm_user(n).is_err(), "{} should be rejected", n);
        }
        assert_eq!(PpmUser::all().count(), 8);
    }

    #[test]
    fn entry_serializes_as_canonical_string() {
        let entry = Entry::parse("simple.test:sinM").unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, "\"simple.test:sinM:value\"");
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert!(serde_json::from_str::<Entry>("\"nope\"").is_err());
    }

    #[test]
    fn ppm_user_deserialization_validates() {
        let user: PpmUser = serde_json::from_str("3").unwrap();
        assert_eq!(user.get(), 3);
        assert!(serde_json::from_str::<PpmUser>("9").is_err());
    }
}
