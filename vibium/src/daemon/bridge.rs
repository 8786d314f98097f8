//! Bridges between foreign transports and the daemon socket.
//!
//! Both bridges forward payloads verbatim and preserve correlation ids end
//! to end; neither adds authentication.

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::daemon::client::{ensure_daemon, DaemonClient};
use crate::error::{EngineError, Result};

/// The stdio bridge behind `vibium mcp --connect`: newline-delimited JSON
/// from stdin goes to the daemon, responses come back on stdout.
pub async fn stdio(daemon_args: &[String]) -> Result<()> {
    let mut client = ensure_daemon(daemon_args)
        .await
        .map_err(|err| EngineError::Connection {
            message: err.message,
        })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = forward_line(&mut client, &line).await;
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Forward one raw request line, keeping the caller's id even for garbage.
async fn forward_line(client: &mut DaemonClient, line: &str) -> String {
    match client.forward_raw(line).await {
        Ok(response) => response,
        Err(err) => json!({
            "jsonrpc": "2.0",
            "id": serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(serde_json::Value::Null),
            "error": { "code": err.code, "message": err.message },
        })
        .to_string(),
    }
}

/// The HTTP bridge behind `vibium http`: accepts POSTed JSON-RPC payloads
/// and answers with the daemon's response.
pub async fn http(port: u16, daemon_args: Vec<String>) -> Result<()> {
    use warp::Filter;

    // make sure a daemon answers before accepting traffic
    drop(
        ensure_daemon(&daemon_args)
            .await
            .map_err(|err| EngineError::Connection {
                message: err.message,
            })?,
    );

    let route = warp::post()
        .and(warp::body::content_length_limit(16 * 1024 * 1024))
        .and(warp::body::bytes())
        .and_then(|body: bytes::Bytes| async move {
            let line = String::from_utf8_lossy(&body).to_string();
            let response = match DaemonClient::connect().await {
                Ok(mut client) => forward_line(&mut client, line.trim()).await,
                Err(err) => json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": err.code, "message": err.message },
                })
                .to_string(),
            };
            Ok::<_, warp::Rejection>(warp::reply::with_header(
                response,
                "content-type",
                "application/json",
            ))
        });

    tracing::info!(port, "HTTP bridge listening");
    warp::serve(route).run(([127, 0, 0, 1], port)).await;
    Ok(())
}
