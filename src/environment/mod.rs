//! Interfaces a plugin hands to its host, and their RPC proxies.
//!
//! Each trait has a `*Server` that exposes a local implementation as a
//! [`Service`](crate::rpc::Service) and a `*Client` stub that implements the
//! same trait by calling across a connection. Methods returning another
//! interface travel as a [`RemoteHandle`](crate::rpc::RemoteHandle) and come
//! back out of the stub as a nested stub.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

mod client;
mod server;

pub use client::{ArtifactClient, BuilderClient, EnvironmentClient, UiClient};
pub use server::{ArtifactServer, BuilderServer, EnvironmentServer, UiServer};

/// The root object a plugin exposes to its host.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Resolve a named builder.
    async fn lookup(&self, name: &str) -> Result<Arc<dyn Builder>>;

    /// Run a command line and return its exit code.
    async fn invoke(&self, args: Vec<String>) -> Result<i32>;

    /// The user interface plugins report through.
    async fn ui(&self) -> Result<Arc<dyn Ui>>;
}

#[async_trait]
pub trait Builder: Send + Sync {
    /// Validate settings, returning any warnings.
    async fn prepare(&self, settings: Value) -> Result<Vec<String>>;

    async fn run(&self) -> Result<Arc<dyn Artifact>>;
}

#[async_trait]
pub trait Artifact: Send + Sync {
    async fn id(&self) -> Result<String>;

    async fn files(&self) -> Result<Vec<String>>;

    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
pub trait Ui: Send + Sync {
    async fn say(&self, message: &str) -> Result<()>;

    async fn error(&self, message: &str) -> Result<()>;

    async fn ask(&self, query: &str) -> Result<String>;
}
