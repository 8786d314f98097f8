//! Client side of the daemon socket: connect, auto-start, single calls.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::daemon::paths::DaemonPaths;
use crate::daemon::rpc::{RpcError, RpcResponse};
use crate::error::codes;

#[cfg(unix)]
type Stream = tokio::net::UnixStream;
#[cfg(windows)]
type Stream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Backoff schedule for the auto-start poll; sums to just under 5 s.
const BACKOFF: &[u64] = &[50, 100, 200, 400, 800, 1600, 1800];

/// Cheap liveness probe used by the lock recovery path.
pub fn probe() -> bool {
    #[cfg(unix)]
    {
        match DaemonPaths::resolve() {
            Ok(paths) => std::os::unix::net::UnixStream::connect(&paths.socket).is_ok(),
            Err(_) => false,
        }
    }
    #[cfg(windows)]
    {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(crate::daemon::paths::PIPE_NAME)
            .is_ok()
    }
}

fn io_error(err: impl std::fmt::Display) -> RpcError {
    RpcError {
        code: codes::INTERNAL_ERROR,
        message: err.to_string(),
        data: None,
    }
}

/// A connected client issuing sequential calls over one connection.
#[derive(Debug)]
pub struct DaemonClient {
    reader: tokio::io::Lines<BufReader<tokio::io::ReadHalf<Stream>>>,
    writer: tokio::io::WriteHalf<Stream>,
    next_id: u64,
}

impl DaemonClient {
    pub async fn connect() -> Result<Self, RpcError> {
        let stream = open_stream().await.map_err(io_error)?;
        let (read_half, writer) = tokio::io::split(stream);
        Ok(Self {
            reader: BufReader::new(read_half).lines(),
            writer,
            next_id: 1,
        })
    }

    /// One JSON-RPC round trip. Responses are matched by id equality; the
    /// daemon answers in order on a single connection.
    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut payload = serde_json::to_vec(&request).map_err(io_error)?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)?;

        loop {
            let line = self
                .reader
                .next_line()
                .await
                .map_err(io_error)?
                .ok_or_else(|| io_error("daemon closed the connection"))?;
            let response: RpcResponse = serde_json::from_str(&line).map_err(io_error)?;
            if response.id != json!(id) {
                // a response for someone else can only mean a protocol bug;
                // skip it rather than mis-deliver
                tracing::warn!("response with unexpected id {:?}", response.id);
                continue;
            }
            return match (response.result, response.error) {
                (_, Some(error)) => Err(error),
                (Some(result), None) => Ok(result),
                (None, None) => Ok(Value::Null),
            };
        }
    }

    /// Forward one raw request line verbatim and return the raw response
    /// line; the client's own id is preserved end to end.
    pub async fn forward_raw(&mut self, line: &str) -> Result<String, RpcError> {
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(io_error)?;
        self.writer.write_all(b"\n").await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)?;
        self.reader
            .next_line()
            .await
            .map_err(io_error)?
            .ok_or_else(|| io_error("daemon closed the connection"))
    }

    /// Shorthand for the MCP-shaped tool call.
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, RpcError> {
        self.call(
            "tools/call",
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }
}

async fn open_stream() -> std::io::Result<Stream> {
    #[cfg(unix)]
    {
        let paths = DaemonPaths::resolve()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()))?;
        tokio::net::UnixStream::connect(&paths.socket).await
    }
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        ClientOptions::new().open(crate::daemon::paths::PIPE_NAME)
    }
}

/// Connect to the daemon, forking one in the background when none answers.
///
/// The spawned daemon inherits the caller's configuration flags; the socket
/// is polled with exponential backoff for up to five seconds.
pub async fn ensure_daemon(daemon_args: &[String]) -> Result<DaemonClient, RpcError> {
    if let Ok(client) = DaemonClient::connect().await {
        return Ok(client);
    }

    let exe = std::env::current_exe().map_err(io_error)?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("start")
        .args(daemon_args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    command.spawn().map_err(io_error)?;

    for delay in BACKOFF {
        tokio::time::sleep(Duration::from_millis(*delay)).await;
        if let Ok(client) = DaemonClient::connect().await {
            return Ok(client);
        }
    }
    Err(io_error(
        "the daemon did not come up within 5 seconds; check `vibium daemon start` output",
    ))
}
