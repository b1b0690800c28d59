//! Built-in environment served by `plugin-broker serve`.

use crate::environment::{Artifact, Builder, Environment, Ui};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct DemoEnvironment {
    builds: Arc<AtomicU64>,
}

impl DemoEnvironment {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Environment for DemoEnvironment {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn Builder>> {
        match name {
            "echo" => Ok(Arc::new(EchoBuilder::new(self.builds.clone()))),
            other => Err(BrokerError::remote(format!("unknown builder: {other}"))),
        }
    }

    async fn invoke(&self, args: Vec<String>) -> Result<i32> {
        info!(?args, "Invoked");
        i32::try_from(args.len()).map_err(|_| BrokerError::remote("too many arguments"))
    }

    async fn ui(&self) -> Result<Arc<dyn Ui>> {
        Ok(Arc::new(TracingUi))
    }
}

/// Produces an artifact listing the settings it was prepared with.
#[derive(Debug)]
pub struct EchoBuilder {
    builds: Arc<AtomicU64>,
    settings: Mutex<Option<Vec<String>>>,
}

impl EchoBuilder {
    fn new(builds: Arc<AtomicU64>) -> Self {
        Self {
            builds,
            settings: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Builder for EchoBuilder {
    async fn prepare(&self, settings: Value) -> Result<Vec<String>> {
        let Value::Object(map) = settings else {
            return Err(BrokerError::remote("settings must be an object"));
        };

        let mut warnings = Vec::new();
        let mut lines = Vec::with_capacity(map.len());
        for (key, value) in map {
            match value {
                Value::Null => warnings.push(format!("setting '{key}' is empty")),
                Value::String(s) => lines.push(format!("{key}={s}")),
                other => lines.push(format!("{key}={other}")),
            }
        }

        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = Some(lines);
        Ok(warnings)
    }

    async fn run(&self) -> Result<Arc<dyn Artifact>> {
        let files = self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| BrokerError::remote("builder was not prepared"))?;

        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(EchoArtifact {
            id: format!("echo-{n}"),
            files,
            destroyed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
pub struct EchoArtifact {
    id: String,
    files: Vec<String>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Artifact for EchoArtifact {
    async fn id(&self) -> Result<String> {
        Ok(self.id.clone())
    }

    async fn files(&self) -> Result<Vec<String>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BrokerError::remote(format!("artifact {} was destroyed", self.id)));
        }
        Ok(self.files.clone())
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            warn!(artifact = %self.id, "Artifact already destroyed");
        }
        Ok(())
    }
}

/// Non-interactive UI that reports through tracing.
#[derive(Debug, Clone, Copy)]
pub struct TracingUi;

#[async_trait]
impl Ui for TracingUi {
    async fn say(&self, message: &str) -> Result<()> {
        info!("{}", message);
        Ok(())
    }

    async fn error(&self, message: &str) -> Result<()> {
        error!("{}", message);
        Ok(())
    }

    async fn ask(&self, query: &str) -> Result<String> {
        info!(query, "No interactive input, answering with an empty string");
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn invoke_counts_arguments() {
        let env = DemoEnvironment::new();
        let code = env.invoke(vec!["a".into(), "b".into()]).await.unwrap();
        assert_eq!(code, 2);
        assert_eq!(env.invoke(Vec::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_builder_is_an_application_error() {
        let env = DemoEnvironment::new();
        match env.lookup("nope").await {
            Err(BrokerError::Remote(message)) => assert_eq!(message, "unknown builder: nope"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn echo_builder_lists_settings() {
        let env = DemoEnvironment::new();
        let builder = env.lookup("echo").await.unwrap();

        let warnings = builder
            .prepare(json!({"name": "web", "replicas": 3, "region": null}))
            .await
            .unwrap();
        assert_eq!(warnings, vec!["setting 'region' is empty"]);

        let artifact = builder.run().await.unwrap();
        assert_eq!(artifact.id().await.unwrap(), "echo-1");
        assert_eq!(artifact.files().await.unwrap(), vec!["name=web", "replicas=3"]);

        artifact.destroy().await.unwrap();
        assert!(matches!(artifact.files().await, Err(BrokerError::Remote(_))));
    }

    #[tokio::test]
    async fn run_requires_prepare() {
        let env = DemoEnvironment::new();
        let builder = env.lookup("echo").await.unwrap();
        assert!(builder.run().await.is_err());
        assert!(builder.prepare(json!([1, 2])).await.is_err());
    }
}
