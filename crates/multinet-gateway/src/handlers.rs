//! Deferred async handlers
//!
//! Handlers are recorded first and activated together by
//! `MultiRequest::start_handlers`, which gives each (handler, PPM user)
//! pair its own `parameter`-grouped subscription.

use std::sync::Arc;

use multinet_core::{Entry, MultinetResponse, PpmUser};
use parking_lot::Mutex;

/// Shared handler callable from several subscriptions
pub type Handler =
    Arc<dyn Fn(MultinetResponse, Option<PpmUser>) -> anyhow::Result<()> + Send + Sync + 'static>;

pub struct HandlerRegistration {
    pub entries: Vec<Entry>,
    /// One subscription per element; `None` means no PPM user
    pub ppm_users: Vec<Option<PpmUser>>,
    pub handler: Handler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    pending: Mutex<Vec<HandlerRegistration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: HandlerRegistration) {
        self.pending.lock().push(registration);
    }

    /// Take every registration not yet started
    pub fn drain(&self) -> Vec<HandlerRegistration> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
