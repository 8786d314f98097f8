use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::channel::mpsc::channel;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use crate::client::BidiClient;
use crate::conn::{Connection, ConnectionConfig};
use crate::error::{BidiError, BrowserStderr, Result};
use crate::handler::{Handler, HandlerConfig, REQUEST_TIMEOUT};

/// Default `Browser::launch` timeout in MS
pub const LAUNCH_TIMEOUT: u64 = 20_000;

/// Grace period between asking a launched supervisor to exit and killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A [`Browser`] owns the BiDi association with one browser instance: either
/// a supervisor process it launched itself or a remote endpoint it connected
/// to.
#[derive(Debug)]
pub struct Browser {
    /// Handle used to issue commands on the connection
    client: BidiClient,
    /// How the spawned supervisor was configured, if any
    config: Option<BrowserConfig>,
    /// The spawned supervisor process
    child: Option<Child>,
    /// The BiDi web socket url of the browser instance
    ws_url: String,
    /// The id of the BiDi session, once negotiated
    session_id: Option<String>,
}

/// Remote endpoint metadata, served by supervisors on their status URL.
#[derive(serde::Deserialize, Debug, Default)]
pub struct BrowserConnection {
    #[serde(rename = "webSocketDebuggerUrl", alias = "webSocketUrl", default)]
    /// Remote BiDi websocket address
    pub web_socket_url: String,
}

impl Browser {
    /// Connect to an already running browser endpoint via the given URL.
    ///
    /// If the URL is a http(s) URL, the websocket URL is first resolved from
    /// the endpoint's `json/version` metadata, sending the configured API
    /// key as a bearer token.
    pub async fn connect(url: impl Into<String>) -> Result<(Self, Handler)> {
        Self::connect_with_config(url, None, BrowserConfig::default()).await
    }

    /// Connect to an already running browser endpoint with a given
    /// [`BrowserConfig`].
    pub async fn connect_with_config(
        url: impl Into<String>,
        api_key: Option<String>,
        config: BrowserConfig,
    ) -> Result<(Self, Handler)> {
        let mut ws_url = url.into();

        if ws_url.starts_with("http") {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            if let Some(ref key) = api_key {
                let value = HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|_| BidiError::msg("invalid API key"))?;
                headers.insert(AUTHORIZATION, value);
            }
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .default_headers(headers)
                .build()
                .map_err(|e| BidiError::msg(e.to_string()))?;

            let version_url = if ws_url.ends_with("/json/version") || ws_url.ends_with("/json/version/")
            {
                ws_url.clone()
            } else {
                format!(
                    "{}{}json/version",
                    &ws_url,
                    if ws_url.ends_with('/') { "" } else { "/" }
                )
            };

            match client.get(&version_url).send().await {
                Ok(req) => {
                    let connection: BrowserConnection =
                        serde_json::from_slice(&req.bytes().await.unwrap_or_default())
                            .unwrap_or_default();
                    if !connection.web_socket_url.is_empty() {
                        ws_url = connection.web_socket_url;
                    }
                }
                Err(_) => return Err(BidiError::NoResponse),
            }
        }

        let mut request = ws_url.as_str().into_client_request()?;
        if let Some(ref key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| BidiError::msg("invalid API key"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let conn = Connection::connect_with_config(request, config.connection.clone()).await?;

        let (tx, rx) = channel(1000);

        let handler = Handler::new(
            conn,
            rx,
            HandlerConfig {
                request_timeout: config.request_timeout,
            },
        );

        let browser = Self {
            client: BidiClient::new(tx),
            config: None,
            child: None,
            ws_url,
            session_id: None,
        };

        Ok((browser, handler))
    }

    /// Launches a new supervisor instance in the background and attaches to
    /// its BiDi web socket.
    ///
    /// This fails when no supervisor executable could be detected.
    ///
    /// This fails if no web socket url could be resolved from the child
    /// process output for more than the configured `launch_timeout`
    /// (20 seconds by default).
    pub async fn launch(mut config: BrowserConfig) -> Result<(Self, Handler)> {
        let executable = match config.executable.take() {
            Some(path) => path,
            None => default_executable().map_err(BidiError::msg)?,
        };

        let port = if config.port == 0 {
            free_local_port()?
        } else {
            config.port
        };

        let mut cmd = Command::new(&executable);
        cmd.arg(format!("--port={port}"))
            .args(&config.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref envs) = config.process_envs {
            cmd.envs(envs);
        }

        let mut child = cmd.spawn()?;

        /// Faillible initialization to run once the child process is created.
        ///
        /// All faillible calls must be executed inside this function. This ensures that all
        /// errors are caught and that the child process is properly cleaned-up.
        async fn with_child(
            config: &BrowserConfig,
            child: &mut Child,
            port: u16,
        ) -> Result<(String, Connection)> {
            let ws_url = ws_url_from_output(child, port, config.launch_timeout).await?;
            let conn = Connection::connect_with_config(ws_url.as_str(), config.connection.clone())
                .await?;
            Ok((ws_url, conn))
        }

        let (ws_url, conn) = match with_child(&config, &mut child, port).await {
            Ok(conn) => conn,
            Err(e) => {
                // An initialization error occurred, clean up the process
                if let Ok(Some(_)) = child.try_wait() {
                    // already exited, do nothing, may happen if the supervisor crashed
                } else {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
                return Err(e);
            }
        };

        let (tx, rx) = channel(1000);

        let handler = Handler::new(
            conn,
            rx,
            HandlerConfig {
                request_timeout: config.request_timeout,
            },
        );

        let browser = Self {
            client: BidiClient::new(tx),
            config: Some(config),
            child: Some(child),
            ws_url,
            session_id: None,
        };

        Ok((browser, handler))
    }

    /// Negotiate the BiDi session. Must be called once the [`Handler`] is
    /// being driven.
    ///
    /// A remote endpoint may already carry a session; the `session not
    /// created` answer is tolerated in that case.
    pub async fn new_session(&mut self, capabilities: serde_json::Value) -> Result<()> {
        let res = self
            .client
            .send(
                "session.new",
                serde_json::json!({ "capabilities": capabilities }),
            )?
            .await;

        match res {
            Ok(value) => {
                self.session_id = value
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Ok(())
            }
            Err(BidiError::Browser(err)) if err.error == "session not created" => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Handle used to issue commands on this connection.
    pub fn client(&self) -> BidiClient {
        self.client.clone()
    }

    /// Returns the address of the websocket this browser is attached to
    pub fn websocket_address(&self) -> &String {
        &self.ws_url
    }

    /// The negotiated BiDi session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether this association spawned its own supervisor process.
    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// The config of the spawned supervisor instance if any.
    pub fn config(&self) -> Option<&BrowserConfig> {
        self.config.as_ref()
    }

    /// Request for the browser association to end completely.
    ///
    /// Launched instances receive a `browser.close` command and a signal,
    /// then are killed after a grace period. For connected instances only
    /// the websocket is closed; a remote process is never terminated.
    pub async fn close(&mut self) -> Result<()> {
        if self.child.is_some() {
            // best effort: ask the browser itself to wind down first
            if let Ok(fut) = self.client.send_with_timeout(
                "browser.close",
                serde_json::json!({}),
                Duration::from_secs(5),
            ) {
                let _ = fut.await;
            }
        }

        let _ = self.client.close().await;

        if let Some(child) = self.child.as_mut() {
            terminate(child);
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => {
                    status?;
                }
                Err(_) => {
                    tracing::warn!("Supervisor did not exit within the grace period, killing it");
                    child.kill().await?;
                }
            }
        }
        Ok(())
    }

    /// Asynchronously wait for the spawned supervisor instance to exit
    /// completely.
    pub async fn wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        if let Some(child) = self.child.as_mut() {
            Ok(Some(child.wait().await?))
        } else {
            Ok(None)
        }
    }

    /// If the spawned supervisor instance has completely exited, collect it.
    pub fn try_wait(&mut self) -> io::Result<Option<std::process::ExitStatus>> {
        if let Some(child) = self.child.as_mut() {
            child.try_wait()
        } else {
            Ok(None)
        }
    }

    /// Forcibly kill the spawned supervisor instance
    pub async fn kill(&mut self) -> Option<io::Result<()>> {
        match self.child.as_mut() {
            Some(child) => Some(child.kill().await),
            None => None,
        }
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(Some(_)) = child.try_wait() {
                // Already exited, do nothing. Usually occurs after using the method close or kill.
            } else {
                // `kill_on_drop` is set for the child process, the runtime
                // reaps it in the background.
                tracing::warn!(
                    "Browser was not closed manually, it will be killed automatically in the background"
                );
            }
        }
    }
}

/// Ask the supervisor to exit; the polite signal on unix, a no-op elsewhere
/// (the caller falls back to `kill` after the grace period).
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Detect a supervisor binary on the `PATH`.
pub fn default_executable() -> std::result::Result<PathBuf, String> {
    for name in ["chromedriver", "msedgedriver", "geckodriver"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }
    Err("Could not auto detect a BiDi capable webdriver binary (expected chromedriver on the PATH)".to_string())
}

/// Reserve an ephemeral local port for the supervisor to bind.
fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Resolve the BiDi WebSocket URL from the provided supervisor process
///
/// If an error occurs, it returns the process' stderr output.
///
/// The URL resolution fails if:
/// - [`BidiError::LaunchTimeout`]: the timeout elapses first
/// - [`BidiError::LaunchExit`]: the supervisor process exits (or is killed)
/// - [`BidiError::LaunchIo`]: an input/output error occurs while reading the
///   process output
async fn ws_url_from_output(child: &mut Child, port: u16, timeout: Duration) -> Result<String> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BidiError::msg("no stdout piped on the supervisor process"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BidiError::msg("no stderr piped on the supervisor process"))?;

    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut stderr_bytes = Vec::<u8>::new();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(BidiError::LaunchTimeout(BrowserStderr::new(stderr_bytes)))
            },
            exit_status = child.wait() => {
                return Err(match exit_status {
                    Err(e) => BidiError::LaunchIo(e, BrowserStderr::new(stderr_bytes)),
                    Ok(exit_status) => {
                        BidiError::LaunchExit(exit_status, BrowserStderr::new(stderr_bytes))
                    }
                })
            },
            line = out_lines.next_line(), if !out_done => {
                match line {
                    Err(e) => return Err(BidiError::LaunchIo(e, BrowserStderr::new(stderr_bytes))),
                    Ok(None) => out_done = true,
                    Ok(Some(line)) => {
                        if let Some(ws) = ws_url_from_line(&line, port) {
                            return Ok(ws);
                        }
                    }
                }
            },
            line = err_lines.next_line(), if !err_done => {
                match line {
                    Err(e) => return Err(BidiError::LaunchIo(e, BrowserStderr::new(stderr_bytes))),
                    Ok(None) => err_done = true,
                    Ok(Some(line)) => {
                        stderr_bytes.extend_from_slice(line.as_bytes());
                        stderr_bytes.push(b'\n');
                        if let Some(ws) = ws_url_from_line(&line, port) {
                            return Ok(ws);
                        }
                    }
                }
            },
        }

        if out_done && err_done {
            let e = io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of stream");
            return Err(BidiError::LaunchIo(e, BrowserStderr::new(stderr_bytes)));
        }
    }
}

/// A supervisor either prints the websocket URL outright or announces the
/// port it bound; both resolve to the BiDi session endpoint.
fn ws_url_from_line(line: &str, port: u16) -> Option<String> {
    if let Some(idx) = line.find("ws://") {
        let ws = line[idx..]
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('.');
        if !ws.is_empty() {
            return Some(ws.to_string());
        }
    }
    if line.contains("started successfully") {
        return Some(format!("ws://127.0.0.1:{port}/session"));
    }
    None
}

#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Path of the supervisor binary.
    ///
    /// If unspecified, the crate will try to automatically detect a suitable
    /// binary.
    pub executable: Option<PathBuf>,
    /// Launch the supervisor on a specific port; `0` picks a free one.
    pub port: u16,
    /// Additional command line arguments to pass to the supervisor instance.
    pub args: Vec<String>,
    /// Environment variables to set for the supervisor process.
    pub process_envs: Option<HashMap<String, String>>,
    /// Timeout duration for `Browser::launch`.
    pub launch_timeout: Duration,
    /// The duration after a request with no response should time out
    pub request_timeout: Duration,
    /// Socket level configuration
    pub connection: ConnectionConfig,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            port: 0,
            args: Vec::new(),
            process_envs: None,
            launch_timeout: Duration::from_millis(LAUNCH_TIMEOUT),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            connection: ConnectionConfig::default(),
        }
    }
}

impl BrowserConfig {
    pub fn builder() -> BrowserConfigBuilder {
        BrowserConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct BrowserConfigBuilder {
    config: BrowserConfig,
}

impl BrowserConfigBuilder {
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.executable = Some(path.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn launch_timeout(mut self, timeout: Duration) -> Self {
        self.config.launch_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.config.connection = connection;
        self
    }

    pub fn build(self) -> std::result::Result<BrowserConfig, String> {
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_parsed_from_explicit_url() {
        let line = "DevTools listening on ws://127.0.0.1:9222/session/abc";
        assert_eq!(
            ws_url_from_line(line, 9515).as_deref(),
            Some("ws://127.0.0.1:9222/session/abc")
        );
    }

    #[test]
    fn ws_url_derived_from_port_announcement() {
        let line = "ChromeDriver was started successfully on port 9515.";
        assert_eq!(
            ws_url_from_line(line, 9515).as_deref(),
            Some("ws://127.0.0.1:9515/session")
        );
    }

    #[test]
    fn unrelated_lines_yield_nothing() {
        assert!(ws_url_from_line("Starting ChromeDriver 131.0", 9515).is_none());
    }
}
