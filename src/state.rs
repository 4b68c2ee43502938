//! Shared application state.

use crate::pool::PoolManager;
use crate::runtime::SandboxBackend;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub backend: Arc<dyn SandboxBackend>,
    pub reaper_enabled: bool,
}

impl AppState {
    pub fn new(
        pool: Arc<PoolManager>,
        backend: Arc<dyn SandboxBackend>,
        reaper_enabled: bool,
    ) -> Self {
        Self {
            pool,
            backend,
            reaper_enabled,
        }
    }
}
