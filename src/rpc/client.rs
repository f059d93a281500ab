use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::debug;

use crate::app;

use super::{Response, codec};

/// How long `show_all` waits on any single instance before skipping it.
const SHOW_ALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Call `method` on the rpc server at `address` and wait for the response.
pub async fn call(address: &str, method: &str, params: Option<Value>) -> Result<Value> {
    let mut stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("could not reach rpc server at {address}"))?;

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": method,
        "params": params,
    });

    codec::write_frame(&mut stream, &serde_json::to_vec(&request)?).await?;

    let frame = codec::read_frame(&mut stream)
        .await?
        .context("rpc server closed the connection without responding")?;

    let response: Response =
        serde_json::from_slice(&frame).context("undecodable rpc response")?;

    if let Some(error) = response.error {
        bail!("rpc call failed with code {}: {}", error.code, error.message);
    }

    Ok(response.result.unwrap_or(Value::Null))
}

/// Call `method` on another instance, resolving its rpc address through the
/// instance registry.
pub async fn call_by_id(id: &str, method: &str, params: Option<Value>) -> Result<Value> {
    let address = app::rpc_address(id)?;
    call(&address, method, params).await
}

/// Runtime information about one instance, given its id or alias.
pub async fn show(id: &str) -> Result<Value> {
    call_by_id(id, "show-instance", None).await
}

/// Runtime information about every reachable instance on this system.
/// Instances without rpc or that do not answer are skipped.
pub async fn show_all() -> Result<Vec<Value>> {
    let home = app::home_dir()?;
    let mut instances = Vec::new();

    if !home.exists() {
        return Ok(instances);
    }

    for entry in std::fs::read_dir(&home)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }

        let id = entry.file_name().to_string_lossy().to_string();

        let address = match app::rpc_address(&id) {
            Ok(addr) => addr,
            Err(e) => {
                debug!(id = %id, error = %e, "skipping instance without rpc");
                continue;
            }
        };

        match tokio::time::timeout(SHOW_ALL_TIMEOUT, call(&address, "show-instance", None)).await
        {
            Ok(Ok(runtime)) => instances.push(runtime),
            Ok(Err(e)) => debug!(id = %id, error = %e, "rpc failed"),
            Err(_) => debug!(id = %id, "rpc timed out"),
        }
    }

    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc;
    use serde_json::json;
    use serial_test::serial;

    #[tokio::test]
    async fn test_call_round_trip() {
        rpc::register("client-echo", |params| Ok(params.unwrap_or(Value::Null)));

        let addr = rpc::start("").await.unwrap();
        let result = call(&addr.to_string(), "client-echo", Some(json!({"n": 42})))
            .await
            .unwrap();

        assert_eq!(result["n"], 42);
    }

    #[tokio::test]
    async fn test_call_surfaces_rpc_errors() {
        let addr = rpc::start("").await.unwrap();
        let err = call(&addr.to_string(), "missing-method", None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("-32601"));
        assert!(err.to_string().contains("method missing-method not found"));
    }

    #[tokio::test]
    async fn test_call_unreachable_server() {
        let err = call("127.0.0.1:1", "anything", None).await.unwrap_err();
        assert!(err.to_string().contains("could not reach rpc server"));
    }

    #[tokio::test]
    #[serial]
    async fn test_show_all_collects_reachable_instances_and_skips_the_rest() {
        let home = tempfile::tempdir().unwrap();
        // SAFETY: test is #[serial], nothing else reads HOME concurrently.
        unsafe { std::env::set_var("HOME", home.path()) };

        rpc::register("show-instance", |_| Ok(json!({"id": "alive"})));
        let addr = rpc::start("").await.unwrap();

        let alive = app::create_instance(Some("alive")).unwrap();
        alive.write_rpc_address(&addr.to_string()).unwrap();

        // An instance without an rpc file must be skipped, not failed.
        app::create_instance(Some("no-rpc")).unwrap();

        // And so must one whose server is gone.
        let dead = app::create_instance(Some("dead")).unwrap();
        dead.write_rpc_address("127.0.0.1:1").unwrap();

        let instances = show_all().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0]["id"], "alive");
    }

    #[tokio::test]
    #[serial]
    async fn test_call_by_id_resolves_registry_address() {
        let home = tempfile::tempdir().unwrap();
        // SAFETY: test is #[serial], nothing else reads HOME concurrently.
        unsafe { std::env::set_var("HOME", home.path()) };

        rpc::register("by-id-echo", |_| Ok(json!("pong")));
        let addr = rpc::start("").await.unwrap();

        let instance = app::create_instance(Some("by-id")).unwrap();
        instance.write_rpc_address(&addr.to_string()).unwrap();

        let result = call_by_id("by-id", "by-id-echo", None).await.unwrap();
        assert_eq!(result, "pong");

        let err = call_by_id("not-created", "by-id-echo", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rpc is disabled"));
    }
}
