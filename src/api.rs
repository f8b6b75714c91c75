//! HTTP API for colloquy
//!
//! Identity is established upstream; handlers trust the `x-user-id` header.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::llm::ModelRegistry;
use crate::runtime::ProductionOrchestrator;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProductionOrchestrator>,
    pub llm_registry: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(orchestrator: ProductionOrchestrator, llm_registry: Arc<ModelRegistry>) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            llm_registry,
        }
    }
}
