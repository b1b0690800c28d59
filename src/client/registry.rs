use super::{ClientSettings, PluginClient};
use crate::config::PluginSpec;
use crate::logging::LogSink;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Tracks every plugin client the host started so they can be torn down together.
pub struct ClientRegistry {
    settings: ClientSettings,
    sink: Arc<dyn LogSink>,
    clients: Mutex<Vec<Arc<PluginClient>>>,
}

impl ClientRegistry {
    pub fn new(settings: ClientSettings, sink: Arc<dyn LogSink>) -> Self {
        Self {
            settings,
            sink,
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Create a client that `cleanup` will kill.
    pub fn new_managed_client(&self, name: impl Into<String>, spec: PluginSpec) -> Arc<PluginClient> {
        let client = Arc::new(PluginClient::new(
            name,
            spec,
            self.settings,
            self.sink.clone(),
        ));
        self.register(client.clone());
        client
    }

    pub fn register(&self, client: Arc<PluginClient>) {
        self.lock().push(client);
    }

    pub fn clients(&self) -> Vec<Arc<PluginClient>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Kill every registered client concurrently and wait for all of them.
    pub async fn cleanup(&self) {
        let clients = self.clients();
        if clients.is_empty() {
            return;
        }

        info!("waiting for all plugin processes to complete...");

        let mut tasks = JoinSet::new();
        for client in clients {
            tasks.spawn(async move { client.kill().await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("Plugin cleanup task failed: {}", e);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PluginClient>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
