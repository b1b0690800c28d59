//! Single-connection RPC endpoints and the stubs that talk to them.
//!
//! Messages are newline-delimited JSON-RPC 2.0. Each connection carries
//! requests from exactly one stub and replies arrive in request order.
//! A method whose result is an interface replies with a [`RemoteHandle`]
//! naming a fresh endpoint that serves that interface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod client;
mod server;

pub use client::RpcClient;
pub use server::{decode_params, encode_result, unknown_method, Broker, Service};

pub const JSONRPC_VERSION: &str = "2.0";

/// Upper bound on a single encoded message.
pub(crate) const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    /// The implementation behind the endpoint returned an error.
    pub const APPLICATION_ERROR: i64 = -32000;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Reference to an interface value living behind a single-connection endpoint.
///
/// Dialing consumes the handle: the endpoint accepts one connection only.
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "HandleRepr")]
pub struct RemoteHandle {
    pub address: String,
}

/// Wire form of a [`RemoteHandle`]; the tag keeps plain strings from passing as handles.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum HandleRepr {
    Remote { address: String },
}

impl Serialize for RemoteHandle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        HandleRepr::Remote {
            address: self.address.clone(),
        }
        .serialize(serializer)
    }
}

impl From<HandleRepr> for RemoteHandle {
    fn from(repr: HandleRepr) -> Self {
        match repr {
            HandleRepr::Remote { address } => RemoteHandle { address },
        }
    }
}

impl RemoteHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial the endpoint now.
    pub async fn connect(self) -> crate::error::Result<RpcClient> {
        RpcClient::connect(&self.address).await
    }

    /// Defer dialing until the first call through the returned client.
    pub fn into_lazy_client(self) -> RpcClient {
        RpcClient::lazy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_handle_is_tagged() {
        let handle = RemoteHandle::new("127.0.0.1:10001");
        let value = serde_json::to_value(&handle).unwrap();
        assert_eq!(value, json!({"kind": "remote", "address": "127.0.0.1:10001"}));
        assert_eq!(serde_json::from_value::<RemoteHandle>(value).unwrap(), handle);
    }

    #[test]
    fn plain_values_are_not_remote_handles() {
        assert!(serde_json::from_value::<RemoteHandle>(json!("127.0.0.1:10001")).is_err());
        assert!(serde_json::from_value::<RemoteHandle>(json!({"address": "x"})).is_err());
    }

    #[test]
    fn failure_response_omits_result() {
        let resp = RpcResponse::failure(Some(3), codes::METHOD_NOT_FOUND, "no such method");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"id\":3"));
        assert!(json.contains("-32601"));
        assert!(!json.contains("result"));
    }
}
