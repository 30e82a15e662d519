//! Delivery filters applied by the dispatch loop
//!
//! Filters see every live delivery before its callback does and may drop
//! entries from it. A delivery filtered down to nothing is not delivered.
//! Synthetic `immediate` deliveries bypass filters.

use std::collections::HashMap;

use multinet_core::{MultinetResponse, PpmUser};

use crate::subscription::SubscriptionId;

pub trait DeliveryFilter: Send {
    fn filter(
        &mut self,
        subscription: SubscriptionId,
        data: MultinetResponse,
        ppm_user: Option<PpmUser>,
    ) -> MultinetResponse;

    /// Forget state kept for a cancelled subscription
    fn release(&mut self, subscription: SubscriptionId) {
        let _ = subscription;
    }
}

impl<F> DeliveryFilter for F
where
    F: FnMut(MultinetResponse, Option<PpmUser>) -> MultinetResponse + Send,
{
    fn filter(
        &mut self,
        _subscription: SubscriptionId,
        data: MultinetResponse,
        ppm_user: Option<PpmUser>,
    ) -> MultinetResponse {
        self(data, ppm_user)
    }
}

/// Pass a delivery only when some reading changed since the previous one
/// for the same subscription and PPM user. Timestamps are ignored.
#[derive(Debug, Default)]
pub struct AnyChange {
    last: HashMap<(SubscriptionId, Option<PpmUser>), MultinetResponse>,
}

impl AnyChange {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_readings(a: &MultinetResponse, b: &MultinetResponse) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b.iter())
            .all(|((ea, ra), (eb, rb))| ea == eb && ra.same_reading(rb))
}

impl DeliveryFilter for AnyChange {
    fn filter(
        &mut self,
        subscription: SubscriptionId,
        data: MultinetResponse,
        ppm_user: Option<PpmUser>,
    ) -> MultinetResponse {
        let key = (subscription, ppm_user);
        if let Some(previous) = self.last.get(&key) {
            if same_readings(previous, &data) {
                return MultinetResponse::new();
            }
        }
        self.last.insert(key, data.clone());
        data
    }

    fn release(&mut self, subscription: SubscriptionId) {
        self.last.retain(|(id, _), _| *id != subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use multinet_core::{Entry, ResponseEntry};
    use serde_json::json;

    fn reading(value: i64) -> MultinetResponse {
        let mut data = MultinetResponse::new();
        data.push(
            Entry::parse("simple.test:intS").unwrap(),
            ResponseEntry::value_at(json!(value), Utc::now()),
        );
        data
    }

    #[test]
    fn any_change_drops_repeated_readings() {
        let mut filter = AnyChange::new();
        let id = SubscriptionId::new();

        assert_eq!(filter.filter(id, reading(1), None).len(), 1);
        // same value, fresh timestamp
        assert!(filter.filter(id, reading(1), None).is_empty());
        assert_eq!(filter.filter(id, reading(2), None).len(), 1);
    }

    #[test]
    fn any_change_is_keyed_by_subscription_and_ppm_user() {
        let mut filter = AnyChange::new();
        let a = SubscriptionId::new();
        let b = SubscriptionId::new();
        let user = PpmUser::new(2).unwrap();

        assert!(!filter.filter(a, reading(1), None).is_empty());
        assert!(!filter.filter(b, reading(1), None).is_empty());
        assert!(!filter.filter(a, reading(1), Some(user)).is_empty());
        assert!(filter.filter(a, reading(1), None).is_empty());

        filter.release(a);
        assert!(!filter.filter(a, reading(1), None).is_empty());
    }

    #[test]
    fn closures_are_filters() {
        let mut only_odd = |data: MultinetResponse, _ppm: Option<PpmUser>| {
            let mut data = data;
            data.retain(|_, r| r.as_value().and_then(|v| v.as_i64()).map_or(false, |n| n % 2 == 1));
            data
        };
        let id = SubscriptionId::new();
        assert!(DeliveryFilter::filter(&mut only_odd, id, reading(2), None).is_empty());
        assert_eq!(DeliveryFilter::filter(&mut only_odd, id, reading(3), None).len(), 1);
    }
}
