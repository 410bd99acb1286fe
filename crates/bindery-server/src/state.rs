//! Shared application state.

use std::sync::Arc;

use bindery_core::session::PublishService;

use crate::auth::PrimaryAuth;

pub struct AppState {
    pub service: PublishService,
    pub auth: Arc<dyn PrimaryAuth>,

    /// Include debug detail in error responses. Development only.
    pub dev_errors: bool,
}

impl AppState {
    pub fn new(service: PublishService, auth: Arc<dyn PrimaryAuth>) -> Self {
        Self {
            service,
            auth,
            dev_errors: false,
        }
    }

    pub fn with_dev_errors(mut self, enabled: bool) -> Self {
        self.dev_errors = enabled;
        self
    }
}
