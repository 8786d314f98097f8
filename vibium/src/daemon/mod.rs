//! The daemon transport: a local socket listener speaking newline-delimited
//! JSON-RPC 2.0, guarded by the socket/PID/lock triplet on disk.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use crate::configuration::Configuration;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::session::Session;

pub mod bridge;
pub mod client;
pub mod paths;
pub mod rpc;

use paths::DaemonPaths;
use rpc::{RpcRequest, RpcResponse};

/// Shared by every connection task.
#[derive(Clone)]
struct DaemonState {
    engine: Engine,
    last_activity: Arc<StdMutex<Instant>>,
    shutdown: watch::Sender<bool>,
}

/// Run the daemon until shutdown is requested, a signal arrives, or the
/// idle timer fires. Exactly one daemon holds the lock file at a time.
pub async fn run(config: Configuration) -> Result<()> {
    // a second `daemon start` exits cleanly, leaving exactly one daemon
    if client::probe() {
        tracing::info!("a vibium daemon is already running");
        return Ok(());
    }

    let paths = DaemonPaths::resolve()?;
    std::fs::create_dir_all(&paths.dir)?;
    acquire_lock(&paths)?;

    let result = serve(&paths, config).await;

    paths.cleanup();
    result
}

async fn serve(paths: &DaemonPaths, config: Configuration) -> Result<()> {
    let idle_timeout = config.idle_timeout;
    let session = Arc::new(Session::new(config));
    let engine = Engine::new(Arc::clone(&session));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let state = DaemonState {
        engine,
        last_activity: Arc::new(StdMutex::new(Instant::now())),
        shutdown: shutdown_tx,
    };

    std::fs::write(&paths.pid, std::process::id().to_string())?;

    #[cfg(unix)]
    {
        // a previous clean exit may have left nothing, a crash leaves a
        // stale socket the lock check already cleared
        let _ = std::fs::remove_file(&paths.socket);
        let listener = tokio::net::UnixListener::bind(&paths.socket)?;
        tracing::info!(socket = %paths.socket.display(), "daemon listening");

        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("shutdown requested via RPC");
                        break;
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = idle_expiry(idle_timeout, &state.last_activity) => {
                    tracing::info!("idle timeout reached, shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let state = state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(stream, state).await {
                                    tracing::debug!("connection ended: {err}");
                                }
                            });
                        }
                        Err(err) => tracing::error!("accept failed: {err}"),
                    }
                }
            }
        }
    }

    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ServerOptions;

        tracing::info!(pipe = paths::PIPE_NAME, "daemon listening");
        loop {
            let server = ServerOptions::new().create(paths::PIPE_NAME)?;
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received Ctrl+C, shutting down");
                    break;
                }
                _ = idle_expiry(idle_timeout, &state.last_activity) => {
                    tracing::info!("idle timeout reached, shutting down");
                    break;
                }
                connected = server.connect() => {
                    connected?;
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(server, state).await {
                            tracing::debug!("connection ended: {err}");
                        }
                    });
                }
            }
        }
    }

    session.shutdown().await?;
    Ok(())
}

/// Resolves when the idle period elapses without any inbound request;
/// pends forever when idle exit is disabled.
async fn idle_expiry(timeout: Option<Duration>, last_activity: &Arc<StdMutex<Instant>>) {
    let Some(timeout) = timeout else {
        return futures::future::pending().await;
    };
    loop {
        let last = *last_activity.lock().expect("last activity poisoned");
        let deadline = last + timeout;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining).await;
    }
}

async fn handle_connection<S>(stream: S, state: DaemonState) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        *state.last_activity.lock().expect("last activity poisoned") = Instant::now();

        let response = match rpc::parse_line(&line) {
            Ok(request) => dispatch_request(&state, request).await,
            Err(error_response) => error_response,
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

async fn dispatch_request(state: &DaemonState, request: RpcRequest) -> RpcResponse {
    let RpcRequest {
        id, method, params, ..
    } = request;

    match method.as_str() {
        "daemon/status" => {
            let session = state.engine.session().status().await;
            RpcResponse::ok(
                id,
                json!({
                    "pid": std::process::id(),
                    "session": session,
                }),
            )
        }
        "daemon/shutdown" => {
            let _ = state.shutdown.send(true);
            RpcResponse::ok(id, json!({ "stopping": true }))
        }
        // the MCP surface wraps the tool name; the CLI sends it bare
        "tools/call" => {
            let call: ToolCallParams = match serde_json::from_value(params.unwrap_or(json!({}))) {
                Ok(call) => call,
                Err(err) => {
                    return RpcResponse::fail(
                        id,
                        crate::error::codes::INVALID_PARAMS,
                        err.to_string(),
                    )
                }
            };
            run_tool(state, id, &call.name, call.arguments).await
        }
        tool => {
            let arguments = params.unwrap_or(json!({}));
            run_tool(state, id, tool, arguments).await
        }
    }
}

async fn run_tool(state: &DaemonState, id: Value, tool: &str, arguments: Value) -> RpcResponse {
    match state.engine.dispatch(tool, arguments).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(err) => RpcResponse::from_error(id, &err),
    }
}

/// Take the advisory lock, clearing artifacts of a dead daemon first.
fn acquire_lock(paths: &DaemonPaths) -> Result<()> {
    for attempt in 0..2 {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&paths.lock)
        {
            Ok(mut file) => {
                use std::io::Write as _;
                let _ = write!(file, "{}", std::process::id());
                return Ok(());
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                let holder = std::fs::read_to_string(&paths.pid)
                    .ok()
                    .and_then(|raw| raw.trim().parse::<u32>().ok());
                let alive = match holder {
                    Some(pid) => paths::pid_alive(pid),
                    // no PID file: probe the socket instead
                    None => client::probe(),
                };
                if alive {
                    return Err(EngineError::invalid(
                        "a vibium daemon is already running",
                    ));
                }
                tracing::warn!("removing stale daemon files (previous instance is gone)");
                paths.cleanup();
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(EngineError::protocol("could not acquire the daemon lock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths {
            dir: dir.path().to_path_buf(),
            socket: dir.path().join("clicker.sock"),
            pid: dir.path().join("clicker.pid"),
            lock: dir.path().join("clicker.lock"),
        };

        // a dead daemon left its whole triplet behind
        std::fs::write(&paths.lock, "1").unwrap();
        std::fs::write(&paths.pid, format!("{}", u32::MAX - 2)).unwrap();
        std::fs::write(&paths.socket, "").unwrap();

        acquire_lock(&paths).unwrap();
        assert!(paths.lock.exists());
        assert!(!paths.socket.exists());
    }

    #[cfg(unix)]
    #[test]
    fn live_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths {
            dir: dir.path().to_path_buf(),
            socket: dir.path().join("clicker.sock"),
            pid: dir.path().join("clicker.pid"),
            lock: dir.path().join("clicker.lock"),
        };

        std::fs::write(&paths.lock, "x").unwrap();
        std::fs::write(&paths.pid, format!("{}", std::process::id())).unwrap();

        assert!(acquire_lock(&paths).is_err());
    }
}
