use crate::config::AppConfig;
use crate::events::EventHub;
use crate::library::LocationStore;
use std::sync::Arc;

/// Everything a player needs from the surrounding application, handed to
/// constructors instead of living in globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub hub: Arc<EventHub>,
    pub store: Option<Arc<dyn LocationStore>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            hub: Arc::new(EventHub::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn LocationStore>) -> Self {
        self.store = Some(store);
        self
    }
}
