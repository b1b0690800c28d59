use super::{codes, RemoteHandle, RpcRequest, RpcResponse, MAX_LINE_LENGTH};
use crate::error::{BrokerError, Result};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::PoisonError;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

type Channel = Framed<TcpStream, LinesCodec>;

/// Client end of one endpoint connection.
///
/// Calls are serialized: each one writes a request and waits for its reply
/// before the next may start.
pub struct RpcClient {
    address: String,
    pending: std::sync::Mutex<Option<RemoteHandle>>,
    channel: OnceCell<Mutex<Channel>>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Dial `address` now.
    pub async fn connect(address: &str) -> Result<Self> {
        let channel = dial(address).await?;
        Ok(Self {
            address: address.to_string(),
            pending: std::sync::Mutex::new(None),
            channel: OnceCell::new_with(Some(Mutex::new(channel))),
            next_id: AtomicU64::new(1),
        })
    }

    /// Dial `handle` on the first call.
    pub fn lazy(handle: RemoteHandle) -> Self {
        Self {
            address: handle.address.clone(),
            pending: std::sync::Mutex::new(Some(handle)),
            channel: OnceCell::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.channel.initialized()
    }

    /// Call `method` and decode a plain result.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self.round_trip(method, params).await?;
        serde_json::from_value(value)
            .map_err(|e| BrokerError::Channel(format!("unexpected reply to {}: {}", method, e)))
    }

    /// Call `method`, whose result is an interface living behind another endpoint.
    pub async fn call_remote<P: Serialize>(&self, method: &str, params: P) -> Result<RemoteHandle> {
        let value = self.round_trip(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            BrokerError::Channel(format!("{} did not return a remote handle: {}", method, e))
        })
    }

    async fn channel(&self) -> Result<&Mutex<Channel>> {
        self.channel
            .get_or_try_init(|| async {
                let handle = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or_else(|| {
                        BrokerError::Connection(format!(
                            "remote handle for {} was already used",
                            self.address
                        ))
                    })?;
                Ok::<_, BrokerError>(Mutex::new(dial(&handle.address).await?))
            })
            .await
    }

    async fn round_trip<P: Serialize>(&self, method: &str, params: P) -> Result<Value> {
        let params = serde_json::to_value(params)?;

        let response = {
            let mut channel = self.channel().await?.lock().await;

            // Ids are taken under the lock so they rise in send order.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let encoded = serde_json::to_string(&RpcRequest::new(id, method, params))?;
            channel.send(encoded).await.map_err(|e| {
                BrokerError::Connection(format!("failed to send {} to {}: {}", method, self.address, e))
            })?;

            // Replies to cancelled calls may still be queued ahead of ours.
            loop {
                let line = match channel.next().await {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        return Err(BrokerError::Connection(format!(
                            "failed to read reply from {}: {}",
                            self.address, e
                        )))
                    }
                    None => {
                        return Err(BrokerError::Connection(format!(
                            "connection to {} closed",
                            self.address
                        )))
                    }
                };

                let response: RpcResponse = serde_json::from_str(&line).map_err(|e| {
                    BrokerError::Channel(format!("malformed reply to {}: {}", method, e))
                })?;

                match response.id {
                    Some(got) if got == id => break response,
                    Some(got) if got < id => {
                        debug!(address = %self.address, id = got, "Discarding stale reply");
                    }
                    other => {
                        return Err(BrokerError::Channel(format!(
                            "reply id mismatch: sent {}, received {:?}",
                            id, other
                        )))
                    }
                }
            }
        };

        if let Some(error) = response.error {
            return Err(match error.code {
                codes::APPLICATION_ERROR => BrokerError::Remote(error.message),
                _ => BrokerError::Channel(error.message),
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

async fn dial(address: &str) -> Result<Channel> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| BrokerError::Connection(format!("failed to connect to {}: {}", address, e)))?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(
        stream,
        LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
    ))
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}
