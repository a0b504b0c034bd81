use std::sync::Arc;

use crate::config::{Config, SessionTiming};
use crate::engine::Tracker;
use crate::hub::Hub;
use crate::observability::metrics::Metrics;
use crate::storage::Storage;

/// Everything a request or session handler needs, wired once at startup.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub tracker: Arc<Tracker>,
    pub storage: Arc<dyn Storage>,
    pub metrics: Metrics,
    pub send_queue_size: usize,
    pub timing: SessionTiming,
    pub static_dir: String,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, config: &Config) -> Self {
        let metrics = Metrics::new();
        let hub = Arc::new(Hub::new(metrics.clone()));
        let tracker = Arc::new(Tracker::new(storage.clone(), hub.clone(), metrics.clone()));

        Self {
            hub,
            tracker,
            storage,
            metrics,
            send_queue_size: config.send_queue_size,
            timing: config.session_timing(),
            static_dir: config.static_dir.clone(),
        }
    }
}
