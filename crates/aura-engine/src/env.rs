//! Shared runtime environment
//!
//! The bundle of registries and services every engine, injector, and
//! orchestrator needs. Owned by the facade, shared by `Arc`.

use std::sync::Arc;

use aura_core::{Config, StateStore, TemplateRenderer};

use crate::actions::ActionRegistry;
use crate::bus::EventBus;
use crate::container::ServiceRegistry;

/// Everything a task run resolves against
pub struct RuntimeEnv {
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub actions: Arc<ActionRegistry>,
    pub services: Arc<ServiceRegistry>,
    pub renderer: Arc<TemplateRenderer>,
    pub state_store: Arc<StateStore>,
}

impl RuntimeEnv {
    pub fn new(config: Config) -> Self {
        let renderer = Arc::new(TemplateRenderer::new(config.clone()));
        Self {
            config,
            bus: Arc::new(EventBus::default()),
            actions: Arc::new(ActionRegistry::new()),
            services: Arc::new(ServiceRegistry::new()),
            renderer,
            state_store: Arc::new(StateStore::new()),
        }
    }
}
