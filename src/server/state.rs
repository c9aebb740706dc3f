//! Server application state

use std::sync::Arc;

use crate::handler::ConversationHandler;
use crate::session::ContextStore;

/// Shared application state for all route handlers
pub struct AppState {
    pub handler: Arc<ConversationHandler>,
    pub store: Arc<ContextStore>,
}

impl AppState {
    pub fn new(handler: ConversationHandler) -> Self {
        let store = Arc::clone(handler.store());
        Self {
            handler: Arc::new(handler),
            store,
        }
    }
}
