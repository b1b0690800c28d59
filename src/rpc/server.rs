use super::{codes, RemoteHandle, RpcRequest, RpcResponse, MAX_LINE_LENGTH};
use crate::config::{Config, PortRange};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

/// An object whose methods can be called through an endpoint.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Prefix of every method this service answers, e.g. `Environment`.
    fn name(&self) -> &'static str;

    /// Run `method` (service prefix already stripped) against the wrapped object.
    ///
    /// A method returning an interface exposes it through `broker` and
    /// replies with the resulting [`RemoteHandle`].
    async fn dispatch(&self, method: &str, params: Value, broker: &Broker) -> Result<Value>;
}

/// Creates single-connection endpoints inside a port range.
#[derive(Debug, Clone)]
pub struct Broker {
    ports: PortRange,
    accept_timeout: Option<Duration>,
}

impl Broker {
    pub fn new(ports: PortRange, accept_timeout: Option<Duration>) -> Self {
        Self {
            ports,
            accept_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ports, config.accept_timeout())
    }

    pub fn ports(&self) -> PortRange {
        self.ports
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout
    }

    /// Serve `service` on a fresh endpoint and return its address.
    pub async fn expose_once(&self, service: Arc<dyn Service>) -> Result<String> {
        Ok(self.expose(service).await?.address)
    }

    /// Serve `service` on a fresh endpoint and return a handle to it.
    ///
    /// The address is bound before this returns, so the handle can be sent
    /// to a peer straight away. The endpoint accepts one connection, closes
    /// its listener, and serves that connection until the peer hangs up.
    pub async fn expose(&self, service: Arc<dyn Service>) -> Result<RemoteHandle> {
        let listener = self.bind().await?;
        let address = listener.local_addr()?.to_string();

        debug!(service = service.name(), %address, "Exposing endpoint");

        let broker = self.clone();
        let endpoint = address.clone();
        tokio::spawn(async move {
            broker.accept_once(listener, service, endpoint).await;
        });

        Ok(RemoteHandle::new(address))
    }

    async fn bind(&self) -> Result<TcpListener> {
        for port in self.ports.ports() {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => trace!(port, "Port unavailable: {}", e),
            }
        }

        Err(BrokerError::Connection(format!(
            "no free port in range {}-{}",
            self.ports.min_port, self.ports.max_port
        )))
    }

    async fn accept_once(self, listener: TcpListener, service: Arc<dyn Service>, address: String) {
        let accepted = match self.accept_timeout {
            Some(limit) => match timeout(limit, listener.accept()).await {
                Ok(accepted) => accepted,
                Err(_) => {
                    warn!(
                        service = service.name(),
                        %address,
                        "No connection within {:?}, retiring endpoint",
                        limit
                    );
                    return;
                }
            },
            None => listener.accept().await,
        };

        // One connection per endpoint: later dials are refused.
        drop(listener);

        match accepted {
            Ok((stream, peer)) => {
                debug!(service = service.name(), %address, %peer, "Endpoint connected");
                serve_connection(stream, service.as_ref(), &self).await;
                debug!(%address, "Endpoint retired");
            }
            Err(e) => {
                warn!(service = service.name(), %address, "Failed to accept connection: {}", e);
            }
        }
    }
}

/// Answer requests on `stream` in order until the peer disconnects.
async fn serve_connection(stream: TcpStream, service: &dyn Service, broker: &Broker) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(service = service.name(), "Connection read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&line, service, broker).await;
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(service = service.name(), "Failed to encode reply: {}", e);
                break;
            }
        };

        if let Err(e) = framed.send(encoded).await {
            debug!(service = service.name(), "Connection write failed: {}", e);
            break;
        }
    }
}

async fn handle_line(line: &str, service: &dyn Service, broker: &Broker) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return RpcResponse::failure(None, codes::PARSE_ERROR, format!("invalid request: {}", e))
        }
    };

    let method = request
        .method
        .strip_prefix(service.name())
        .and_then(|rest| rest.strip_prefix('.'));
    let Some(method) = method else {
        return RpcResponse::failure(
            Some(request.id),
            codes::METHOD_NOT_FOUND,
            format!("can't find service for {}", request.method),
        );
    };

    trace!(service = service.name(), method, id = request.id, "Dispatching");

    match service.dispatch(method, request.params, broker).await {
        Ok(result) => RpcResponse::success(request.id, result),
        Err(err) => RpcResponse::failure(Some(request.id), error_code(&err), err.wire_message()),
    }
}

fn error_code(err: &BrokerError) -> i64 {
    match err {
        BrokerError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
        BrokerError::InvalidParams(_) => codes::INVALID_PARAMS,
        _ => codes::APPLICATION_ERROR,
    }
}

/// Decode request parameters for a dispatcher.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| BrokerError::InvalidParams(e.to_string()))
}

/// Encode a plain result value for a dispatcher.
pub fn encode_result<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Error for a method name the service does not implement.
pub fn unknown_method(service: &str, method: &str) -> BrokerError {
    BrokerError::MethodNotFound(format!("{}.{}", service, method))
}
