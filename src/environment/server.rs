use super::{Artifact, Builder, Environment, Ui};
use crate::error::Result;
use crate::rpc::{decode_params, encode_result, unknown_method, Broker, Service};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Arguments of `Environment.Invoke`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct InvokeArgs {
    pub args: Vec<String>,
}

pub struct EnvironmentServer {
    env: Arc<dyn Environment>,
}

impl EnvironmentServer {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl Service for EnvironmentServer {
    fn name(&self) -> &'static str {
        "Environment"
    }

    async fn dispatch(&self, method: &str, params: Value, broker: &Broker) -> Result<Value> {
        match method {
            "Lookup" => {
                let name: String = decode_params(params)?;
                let builder = self.env.lookup(&name).await?;
                let handle = broker.expose(Arc::new(BuilderServer::new(builder))).await?;
                encode_result(handle)
            }
            "Invoke" => {
                let InvokeArgs { args } = decode_params(params)?;
                encode_result(self.env.invoke(args).await?)
            }
            "Ui" => {
                let ui = self.env.ui().await?;
                let handle = broker.expose(Arc::new(UiServer::new(ui))).await?;
                encode_result(handle)
            }
            other => Err(unknown_method(self.name(), other)),
        }
    }
}

pub struct BuilderServer {
    builder: Arc<dyn Builder>,
}

impl BuilderServer {
    pub fn new(builder: Arc<dyn Builder>) -> Self {
        Self { builder }
    }
}

#[async_trait]
impl Service for BuilderServer {
    fn name(&self) -> &'static str {
        "Builder"
    }

    async fn dispatch(&self, method: &str, params: Value, broker: &Broker) -> Result<Value> {
        match method {
            "Prepare" => encode_result(self.builder.prepare(params).await?),
            "Run" => {
                let artifact = self.builder.run().await?;
                let handle = broker
                    .expose(Arc::new(ArtifactServer::new(artifact)))
                    .await?;
                encode_result(handle)
            }
            other => Err(unknown_method(self.name(), other)),
        }
    }
}

pub struct ArtifactServer {
    artifact: Arc<dyn Artifact>,
}

impl ArtifactServer {
    pub fn new(artifact: Arc<dyn Artifact>) -> Self {
        Self { artifact }
    }
}

#[async_trait]
impl Service for ArtifactServer {
    fn name(&self) -> &'static str {
        "Artifact"
    }

    async fn dispatch(&self, method: &str, _params: Value, _broker: &Broker) -> Result<Value> {
        match method {
            "Id" => encode_result(self.artifact.id().await?),
            "Files" => encode_result(self.artifact.files().await?),
            "Destroy" => {
                self.artifact.destroy().await?;
                Ok(Value::Null)
            }
            other => Err(unknown_method(self.name(), other)),
        }
    }
}

pub struct UiServer {
    ui: Arc<dyn Ui>,
}

impl UiServer {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

#[async_trait]
impl Service for UiServer {
    fn name(&self) -> &'static str {
        "Ui"
    }

    async fn dispatch(&self, method: &str, params: Value, _broker: &Broker) -> Result<Value> {
        match method {
            "Say" => {
                let message: String = decode_params(params)?;
                self.ui.say(&message).await?;
                Ok(Value::Null)
            }
            "Error" => {
                let message: String = decode_params(params)?;
                self.ui.error(&message).await?;
                Ok(Value::Null)
            }
            "Ask" => {
                let query: String = decode_params(params)?;
                encode_result(self.ui.ask(&query).await?)
            }
            other => Err(unknown_method(self.name(), other)),
        }
    }
}
