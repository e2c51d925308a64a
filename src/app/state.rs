//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::SessionRegistry;
use crate::ws::hub::ConnectionHub;
use crate::ws::router::MessageRouter;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub router: MessageRouter,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let registry = Arc::new(SessionRegistry::new(config.rules));
        let hub = Arc::new(ConnectionHub::new());
        let router = MessageRouter::new(registry.clone(), hub.clone());

        Self {
            config,
            registry,
            hub,
            router,
        }
    }
}
