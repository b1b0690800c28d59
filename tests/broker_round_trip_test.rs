//! In-process tests for single-connection endpoints and the stubs that dial them.

use async_trait::async_trait;
use plugin_broker::config::PortRange;
use plugin_broker::demo::DemoEnvironment;
use plugin_broker::environment::{
    Artifact, Builder, Environment, EnvironmentClient, EnvironmentServer, Ui,
};
use plugin_broker::error::{BrokerError, Result};
use plugin_broker::rpc::{Broker, RemoteHandle, RpcClient};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Environment that records every invocation.
#[derive(Default)]
struct RecordingEnvironment {
    invocations: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl Environment for RecordingEnvironment {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn Builder>> {
        Err(BrokerError::remote(format!("no builder {name}")))
    }

    async fn invoke(&self, args: Vec<String>) -> Result<i32> {
        self.invocations.lock().unwrap().push(args);
        Ok(42)
    }

    async fn ui(&self) -> Result<Arc<dyn Ui>> {
        Err(BrokerError::remote("headless"))
    }
}

/// Environment whose `invoke` stalls when the first argument is `slow`.
struct SlowEnvironment;

#[async_trait]
impl Environment for SlowEnvironment {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn Builder>> {
        Err(BrokerError::remote(format!("no builder {name}")))
    }

    async fn invoke(&self, args: Vec<String>) -> Result<i32> {
        if args.first().map(String::as_str) == Some("slow") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(args.len() as i32)
    }

    async fn ui(&self) -> Result<Arc<dyn Ui>> {
        Err(BrokerError::remote("headless"))
    }
}

fn broker(min_port: u16, max_port: u16) -> Broker {
    Broker::new(PortRange::new(min_port, max_port), Some(Duration::from_secs(10)))
}

async fn demo_client(broker: &Broker) -> EnvironmentClient {
    let server = EnvironmentServer::new(Arc::new(DemoEnvironment::new()));
    let address = broker.expose_once(Arc::new(server)).await.unwrap();
    EnvironmentClient::connect(&address).await.unwrap()
}

#[tokio::test]
async fn test_round_trip_reaches_implementation_once() {
    let env = Arc::new(RecordingEnvironment::default());
    let address = broker(44000, 44099)
        .expose_once(Arc::new(EnvironmentServer::new(env.clone())))
        .await
        .unwrap();

    let client = EnvironmentClient::connect(&address).await.unwrap();
    let args = vec!["build".to_string(), "two words".to_string(), String::new()];
    assert_eq!(client.invoke(args.clone()).await.unwrap(), 42);

    assert_eq!(*env.invocations.lock().unwrap(), vec![args]);
}

#[tokio::test]
async fn test_second_dial_is_refused() {
    // Single-port range so no other endpoint can take the port back.
    let address = broker(44100, 44100)
        .expose_once(Arc::new(EnvironmentServer::new(Arc::new(
            RecordingEnvironment::default(),
        ))))
        .await
        .unwrap();

    let first = EnvironmentClient::connect(&address).await.unwrap();
    first.invoke(Vec::new()).await.unwrap();

    match RpcClient::connect(&address).await {
        Err(BrokerError::Connection(_)) => {}
        other => panic!("second dial should be refused, got {:?}", other),
    }

    // The first connection keeps working.
    assert_eq!(first.invoke(vec!["again".into()]).await.unwrap(), 42);
}

#[tokio::test]
async fn test_nested_stubs_reach_original_objects() {
    let client = demo_client(&broker(44300, 44399)).await;

    let builder = client.lookup("echo").await.unwrap();
    let warnings = builder
        .prepare(json!({"image": "alpine", "size": 2, "note": null}))
        .await
        .unwrap();
    assert_eq!(warnings, vec!["setting 'note' is empty"]);

    // Two levels down: Environment -> Builder -> Artifact.
    let artifact = builder.run().await.unwrap();
    assert_eq!(artifact.id().await.unwrap(), "echo-1");
    assert_eq!(artifact.files().await.unwrap(), vec!["image=alpine", "size=2"]);
    artifact.destroy().await.unwrap();

    let second = builder.run().await.unwrap();
    assert_eq!(second.id().await.unwrap(), "echo-2");

    let ui = client.ui().await.unwrap();
    ui.say("hello from the host").await.unwrap();
    ui.error("something went wrong").await.unwrap();
    assert_eq!(ui.ask("continue?").await.unwrap(), "");
}

#[tokio::test]
async fn test_remote_errors_arrive_verbatim() {
    let client = demo_client(&broker(44400, 44499)).await;

    match client.lookup("missing").await {
        Err(BrokerError::Remote(message)) => assert_eq!(message, "unknown builder: missing"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("lookup of a missing builder succeeded"),
    }

    // Errors from nested objects come back unchanged as well.
    let builder = client.lookup("echo").await.unwrap();
    let err = builder.run().await.err().unwrap();
    assert_eq!(err.to_string(), "builder was not prepared");

    // The connection survives application errors.
    assert_eq!(client.invoke(vec!["x".into()]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_shape_mismatch_is_a_channel_error() {
    let address = broker(44500, 44599)
        .expose_once(Arc::new(EnvironmentServer::new(Arc::new(
            DemoEnvironment::new(),
        ))))
        .await
        .unwrap();
    let rpc = RpcClient::connect(&address).await.unwrap();

    // Invoke returns an integer, not a handle.
    let err = rpc
        .call_remote("Environment.Invoke", json!({"args": ["a"]}))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Channel(_)), "{err}");

    let err = rpc
        .call::<_, Value>("Environment.Explode", ())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Channel(_)), "{err}");

    let err = rpc
        .call::<_, i32>("Environment.Invoke", json!({"wrong": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Channel(_)), "{err}");

    let code: i32 = rpc
        .call("Environment.Invoke", json!({"args": ["a", "b"]}))
        .await
        .unwrap();
    assert_eq!(code, 2);
}

#[tokio::test]
async fn test_lazy_client_dials_on_first_call() {
    let handle = broker(44600, 44699)
        .expose(Arc::new(EnvironmentServer::new(Arc::new(
            DemoEnvironment::new(),
        ))))
        .await
        .unwrap();

    let address = handle.address().to_string();
    let rpc = handle.into_lazy_client();
    assert!(!rpc.is_connected());
    assert_eq!(rpc.address(), address);

    let code: i32 = rpc
        .call("Environment.Invoke", json!({"args": ["one"]}))
        .await
        .unwrap();
    assert_eq!(code, 1);
    assert!(rpc.is_connected());
}

#[tokio::test]
async fn test_unused_endpoint_is_retired() {
    let broker = Broker::new(
        PortRange::new(44700, 44700),
        Some(Duration::from_millis(200)),
    );
    let handle: RemoteHandle = broker
        .expose(Arc::new(EnvironmentServer::new(Arc::new(
            DemoEnvironment::new(),
        ))))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;

    match handle.connect().await {
        Err(BrokerError::Connection(_)) => {}
        other => panic!("retired endpoint accepted a dial: {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let client = Arc::new(demo_client(&broker(44800, 44899)).await);

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..16usize {
        let client = client.clone();
        tasks.spawn(async move {
            let args = vec!["x".to_string(); n];
            (n, client.invoke(args).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (n, result) = joined.unwrap();
        assert_eq!(result.unwrap(), n as i32);
    }
}

#[tokio::test]
async fn test_cancelled_call_does_not_poison_the_stub() {
    let address = broker(44900, 44999)
        .expose_once(Arc::new(EnvironmentServer::new(Arc::new(SlowEnvironment))))
        .await
        .unwrap();
    let client = EnvironmentClient::connect(&address).await.unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        client.invoke(vec!["slow".into()]),
    )
    .await;
    assert!(cancelled.is_err(), "slow call should have been cancelled");

    // The reply to the cancelled call is skipped, not handed to the next caller.
    for n in 1..=3usize {
        let args = vec!["fast".to_string(); n];
        assert_eq!(client.invoke(args).await.unwrap(), n as i32);
    }
}
