mod lifecycle;
mod session;

pub use session::ConnectionContext;

use crate::catalog::{PromptCatalog, StaticCatalog};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::engine::RoundEngine;
use crate::events::EventBus;
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;
use crate::repository::{MemoryRepository, Repository};
use crate::transport::{Hub, Transport};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub repo: Arc<dyn Repository>,
    pub registry: SessionRegistry,
    pub hub: Arc<Hub>,
    pub catalog: Arc<dyn PromptCatalog>,
    pub clock: Clock,
    pub bus: EventBus,
    /// One engine per playing session
    engines: RwLock<HashMap<SessionId, Arc<RoundEngine>>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn Repository>,
        catalog: Arc<dyn PromptCatalog>,
    ) -> Self {
        Self {
            config,
            repo,
            registry: SessionRegistry::new(),
            hub: Arc::new(Hub::new()),
            catalog,
            clock: Clock::new(),
            bus: EventBus::new(),
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// In-memory store with the built-in template list
    pub fn in_memory(config: AppConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryRepository::new()),
            Arc::new(StaticCatalog::default()),
        )
    }

    pub fn transport(&self) -> &dyn Transport {
        self.hub.as_ref()
    }

    pub async fn broadcast(&self, session_id: &str, msg: ServerMessage) {
        self.transport().send_to_channel(session_id, msg).await;
    }

    /// Engine of a session, created on first use
    pub async fn engine_for(&self, session_id: &str) -> Arc<RoundEngine> {
        if let Some(engine) = self.engines.read().await.get(session_id) {
            return engine.clone();
        }
        self.engines
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RoundEngine::new(session_id.to_string())))
            .clone()
    }

    pub async fn existing_engine(&self, session_id: &str) -> Option<Arc<RoundEngine>> {
        self.engines.read().await.get(session_id).cloned()
    }

    /// Cancel and forget the engine of a session
    pub(crate) async fn drop_engine(&self, session_id: &str) {
        let engine = self.engines.write().await.remove(session_id);
        if let Some(engine) = engine {
            engine.cancel(self).await;
        }
    }

    pub async fn engine_count(&self) -> usize {
        self.engines.read().await.len()
    }
}
