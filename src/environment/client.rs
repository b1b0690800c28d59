use super::server::InvokeArgs;
use super::{Artifact, Builder, Environment, Ui};
use crate::error::Result;
use crate::rpc::RpcClient;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Stub for a remote [`Environment`].
#[derive(Debug)]
pub struct EnvironmentClient {
    rpc: RpcClient,
}

impl EnvironmentClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    /// Dial the root endpoint a plugin printed during its handshake.
    pub async fn connect(address: &str) -> Result<Self> {
        Ok(Self::new(RpcClient::connect(address).await?))
    }
}

#[async_trait]
impl Environment for EnvironmentClient {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn Builder>> {
        let handle = self.rpc.call_remote("Environment.Lookup", name).await?;
        Ok(Arc::new(BuilderClient::new(handle.into_lazy_client())))
    }

    async fn invoke(&self, args: Vec<String>) -> Result<i32> {
        self.rpc.call("Environment.Invoke", InvokeArgs { args }).await
    }

    async fn ui(&self) -> Result<Arc<dyn Ui>> {
        let handle = self.rpc.call_remote("Environment.Ui", ()).await?;
        Ok(Arc::new(UiClient::new(handle.into_lazy_client())))
    }
}

/// Stub for a remote [`Builder`].
#[derive(Debug)]
pub struct BuilderClient {
    rpc: RpcClient,
}

impl BuilderClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Builder for BuilderClient {
    async fn prepare(&self, settings: Value) -> Result<Vec<String>> {
        self.rpc.call("Builder.Prepare", settings).await
    }

    async fn run(&self) -> Result<Arc<dyn Artifact>> {
        let handle = self.rpc.call_remote("Builder.Run", ()).await?;
        Ok(Arc::new(ArtifactClient::new(handle.into_lazy_client())))
    }
}

/// Stub for a remote [`Artifact`].
#[derive(Debug)]
pub struct ArtifactClient {
    rpc: RpcClient,
}

impl ArtifactClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Artifact for ArtifactClient {
    async fn id(&self) -> Result<String> {
        self.rpc.call("Artifact.Id", ()).await
    }

    async fn files(&self) -> Result<Vec<String>> {
        self.rpc.call("Artifact.Files", ()).await
    }

    async fn destroy(&self) -> Result<()> {
        self.rpc.call("Artifact.Destroy", ()).await
    }
}

/// Stub for a remote [`Ui`].
#[derive(Debug)]
pub struct UiClient {
    rpc: RpcClient,
}

impl UiClient {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl Ui for UiClient {
    async fn say(&self, message: &str) -> Result<()> {
        self.rpc.call("Ui.Say", message).await
    }

    async fn error(&self, message: &str) -> Result<()> {
        self.rpc.call("Ui.Error", message).await
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.rpc.call("Ui.Ask", query).await
    }
}
