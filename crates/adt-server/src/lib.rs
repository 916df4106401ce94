pub mod api;
pub mod config;
pub mod dispatcher;
pub mod registry;
pub mod ws;

use adt_storage::CommandStore;
use config::ServerConfig;
use dispatcher::Dispatcher;
use registry::RegistryHandle;
use std::sync::Arc;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Spawns the registry loop, so it must be called inside a Tokio runtime.
    pub fn new(config: ServerConfig, store: Arc<dyn CommandStore>) -> Self {
        let dispatcher = Dispatcher::new(store, registry::spawn());
        Self {
            config: Arc::new(config),
            dispatcher,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        self.dispatcher.registry()
    }

    pub fn store(&self) -> &Arc<dyn CommandStore> {
        self.dispatcher.store()
    }
}

pub use api::router;
