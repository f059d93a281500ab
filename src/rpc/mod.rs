pub mod client;
pub mod codec;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Network address used by the rpc server when none is given; port 0 asks
/// the kernel for a free one.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:0";

pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
pub const CODE_INTERNAL_ERROR: i64 = -32603;

/// A procedure that can be called remotely.
pub type Method = Arc<dyn Fn(Option<Value>) -> Result<Value> + Send + Sync>;

/// Process-wide method registry, shared by every rpc connection.
static REGISTERED_METHODS: LazyLock<RwLock<HashMap<String, Method>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Add a method that can be called remotely. Registering the same name
/// again replaces the previous handler.
pub fn register<F>(name: &str, method: F)
where
    F: Fn(Option<Value>) -> Result<Value> + Send + Sync + 'static,
{
    let mut methods = REGISTERED_METHODS
        .write()
        .expect("rpc method registry is poisoned");
    methods.insert(name.to_string(), Arc::new(method));
}

fn lookup(name: &str) -> Option<Method> {
    let methods = REGISTERED_METHODS
        .read()
        .expect("rpc method registry is poisoned");
    methods.get(name).cloned()
}

/// One JSON-RPC 2.0 message from a client.
#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    /// Absent for notifications, which produce no response.
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Response {
    fn result(id: Value, result: Value) -> Self {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: String) -> Self {
        Response {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

/// Start the JSON-RPC server, returning the address it actually bound.
///
/// Connections are served until the process exits; each runs on its own
/// task and handles any number of length-prefixed request frames.
pub async fn start(address: &str) -> Result<SocketAddr> {
    let address = if address.is_empty() {
        DEFAULT_ADDRESS
    } else {
        address
    };

    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("rpc server could not listen on {address}"))?;
    let bound = listener.local_addr()?;

    info!(address = %bound, "rpc server listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream).await {
                            warn!(peer = %peer, error = %e, "rpc connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "error establishing connection with rpc client");
                }
            }
        }
    });

    Ok(bound)
}

async fn serve_connection(mut stream: TcpStream) -> Result<()> {
    while let Some(frame) = codec::read_frame(&mut stream).await? {
        let request: Request = match serde_json::from_slice(&frame) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "dropping rpc connection after undecodable frame");
                return Ok(());
            }
        };

        info!(
            method = %request.method,
            notification = request.id.is_none(),
            "rpc request received"
        );

        let response = dispatch(&request);

        // Notifications are executed for effect only.
        if request.id.is_none() {
            continue;
        }

        if let Some(response) = response {
            let payload = serde_json::to_vec(&response)?;
            codec::write_frame(&mut stream, &payload).await?;
        }
    }

    Ok(())
}

fn dispatch(request: &Request) -> Option<Response> {
    let id = request.id.clone().unwrap_or(Value::Null);

    let method = match lookup(&request.method) {
        Some(m) => m,
        None => {
            warn!(method = %request.method, "rpc request method not supported");
            return Some(Response::error(
                id,
                CODE_METHOD_NOT_FOUND,
                format!("method {} not found", request.method),
            ));
        }
    };

    match method(request.params.clone()) {
        Ok(result) => Some(Response::result(id, result)),
        Err(e) => {
            warn!(method = %request.method, error = %e, "error executing rpc method");
            Some(Response::error(
                id,
                CODE_INTERNAL_ERROR,
                format!("error executing rpc method {}", request.method),
            ))
        }
    }
}
