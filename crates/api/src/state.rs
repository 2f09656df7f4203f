//! Application state

use std::sync::Arc;

use paywire_billing::WebhookPipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<WebhookPipeline>,
    /// Operator bearer token; admin routes are only mounted when set
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: Arc<WebhookPipeline>, admin_token: Option<String>) -> Self {
        if admin_token.is_none() {
            tracing::warn!("ADMIN_TOKEN not set - operator routes disabled");
        }
        Self {
            pipeline,
            admin_token: admin_token.map(Arc::from),
        }
    }
}
