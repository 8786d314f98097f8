//! The daemon's singleton browser association.
//!
//! A [`Session`] starts lazily on the first command that needs a browser,
//! either by launching a supervisor (`Launched`) or attaching to a remote
//! endpoint (`Connected`). When the connection dies the session answers the
//! current command with `BrowserCrashed` and relaunches on the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use vibium_bidi::{BidiClient, Browser, BrowserConfig, MethodId};

use crate::configuration::Configuration;
use crate::error::{EngineError, Result};
use crate::page::Page;
use crate::router;
use crate::trace::Tracer;

#[derive(Debug)]
pub struct Session {
    config: Configuration,
    state: Mutex<State>,
}

#[derive(Debug)]
enum State {
    /// No browser yet; the first command starts one.
    Idle,
    Running(Arc<Live>),
    /// The previous browser went away; the next command relaunches.
    Crashed,
}

impl Session {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            state: Mutex::new(State::Idle),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The running browser association, starting or relaunching it when
    /// needed. A freshly detected crash surfaces once as `BrowserCrashed`.
    pub async fn live(&self) -> Result<Arc<Live>> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Running(live) if !live.is_crashed() => return Ok(Arc::clone(live)),
            State::Running(live) => {
                let stale = Arc::clone(live);
                *state = State::Crashed;
                tokio::spawn(async move {
                    let _ = stale.teardown().await;
                });
                return Err(EngineError::BrowserCrashed);
            }
            State::Idle | State::Crashed => {}
        }

        let live = Live::start(self.config.clone()).await?;
        *state = State::Running(Arc::clone(&live));
        Ok(live)
    }

    /// Daemon status payload.
    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        match &*state {
            State::Idle => json!({ "browser": "idle" }),
            State::Crashed => json!({ "browser": "crashed" }),
            State::Running(live) => json!({
                "browser": if live.is_crashed() { "crashed" } else { "running" },
                "mode": if live.launched { "launched" } else { "connected" },
                "pages": live.pages_snapshot().len(),
            }),
        }
    }

    /// Tear the browser down and return to the idle state.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let State::Running(live) = std::mem::replace(&mut *state, State::Idle) {
            live.teardown().await?;
        }
        Ok(())
    }
}

/// Refcounted browser-side data collector for request/response bodies.
#[derive(Debug, Default)]
pub(crate) struct CollectorState {
    pub id: Option<String>,
    pub refs: usize,
}

#[derive(Debug, Default)]
pub(crate) struct NetworkState {
    /// The single `network.addIntercept` registration, shared by all routes.
    pub intercept: Mutex<Option<String>>,
    pub collector: Mutex<CollectorState>,
}

/// Engine-side clock bookkeeping; the authoritative shim lives in the page
/// and this mirror is what survives navigations via the preload script.
#[derive(Debug, Default, Clone)]
pub(crate) struct ClockState {
    pub installed: bool,
    /// Current virtual time, when known (paused/fixed modes).
    pub time: Option<i64>,
    pub timezone: Option<String>,
    pub preload_id: Option<String>,
}

/// A download announced by the browser.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Download {
    pub url: String,
    #[serde(rename = "suggestedFilename")]
    pub suggested_filename: String,
}

/// A call recorded through an `expose` channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExposedCall {
    pub name: String,
    pub args: Value,
}

/// The live half of a session: everything owned while a browser is up.
#[derive(Debug)]
pub struct Live {
    client: BidiClient,
    browser: Mutex<Browser>,
    /// Whether we own the supervisor process (terminate on shutdown) or
    /// attached to a remote endpoint (close the socket only).
    launched: bool,
    crashed: Arc<AtomicBool>,
    /// Pages in tab order.
    pages: RwLock<Vec<Arc<Page>>>,
    active: RwLock<String>,
    pub(crate) network: NetworkState,
    pub(crate) clock: Mutex<ClockState>,
    pub(crate) tracer: Mutex<Option<Tracer>>,
    pub(crate) downloads: StdMutex<Vec<Download>>,
    pub(crate) download_notify: tokio::sync::Notify,
    pub(crate) exposed: StdMutex<Vec<ExposedCall>>,
    config: Configuration,
}

impl Live {
    pub(crate) async fn start(config: Configuration) -> Result<Arc<Self>> {
        let launched = !config.is_remote();
        let (mut browser, mut handler) = if let Some(url) = config.connect_url.clone() {
            Browser::connect_with_config(url, config.api_key.clone(), browser_config(&config))
                .await
                .map_err(EngineError::from)?
        } else {
            Browser::launch(browser_config(&config))
                .await
                .map_err(EngineError::from)?
        };

        let crashed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&crashed);
        tokio::spawn(async move {
            while let Some(res) = handler.next().await {
                if let Err(err) = res {
                    tracing::error!("BiDi connection failed: {err}");
                    break;
                }
            }
            flag.store(true, Ordering::SeqCst);
        });

        browser
            .new_session(capabilities(&config))
            .await
            .map_err(EngineError::from)?;

        let client = browser.client();

        // the engine relies on these event streams; a browser rejecting one
        // module only loses the related features
        for module in ["browsingContext", "network", "log", "script", "input"] {
            let subscribe = client
                .send("session.subscribe", json!({ "events": [module] }))
                .map_err(EngineError::from)?
                .await;
            if let Err(err) = subscribe {
                tracing::debug!(module, "event subscription rejected: {err}");
            }
        }

        let live = Arc::new(Self {
            client,
            browser: Mutex::new(browser),
            launched,
            crashed,
            pages: RwLock::new(Vec::new()),
            active: RwLock::new(String::new()),
            network: NetworkState::default(),
            clock: Mutex::new(ClockState::default()),
            tracer: Mutex::new(None),
            downloads: StdMutex::new(Vec::new()),
            download_notify: tokio::sync::Notify::new(),
            exposed: StdMutex::new(Vec::new()),
            config,
        });

        live.discover_pages().await?;

        if let Some((width, height)) = live.config.viewport {
            let context = live.active_context();
            if let Err(err) = live
                .send(
                    "browsingContext.setViewport",
                    json!({ "context": context, "viewport": { "width": width, "height": height } }),
                )
                .await
            {
                tracing::debug!("default viewport rejected: {err}");
            }
        }

        router::spawn(Arc::clone(&live)).await?;

        Ok(live)
    }

    /// Discover the browsing context tree; the first entry is the default
    /// page. Browsers without any open context get one created.
    async fn discover_pages(&self) -> Result<()> {
        let tree = self.send("browsingContext.getTree", json!({})).await?;
        let contexts = tree
            .get("contexts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in &contexts {
            let Some(context) = entry.get("context").and_then(Value::as_str) else {
                continue;
            };
            let url = entry.get("url").and_then(Value::as_str).unwrap_or("about:blank");
            self.register_page(context, url);
        }

        if self.pages_snapshot().is_empty() {
            let created = self
                .send("browsingContext.create", json!({ "type": "tab" }))
                .await?;
            let context = created
                .get("context")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::protocol("browsingContext.create returned no context"))?;
            self.register_page(context, "about:blank");
        }

        let first = self
            .pages_snapshot()
            .first()
            .map(|p| p.context().to_string())
            .ok_or_else(|| EngineError::protocol("browser reported no browsing contexts"))?;
        *self.active.write().expect("active poisoned") = first;
        Ok(())
    }

    pub(crate) fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_remote(&self) -> bool {
        !self.launched
    }

    pub(crate) fn config(&self) -> &Configuration {
        &self.config
    }

    pub(crate) fn client(&self) -> &BidiClient {
        &self.client
    }

    /// Issue a BiDi command, recording it when a trace with `bidi:true` is
    /// running.
    pub(crate) async fn send(&self, method: impl Into<MethodId>, params: Value) -> Result<Value> {
        let method = method.into();
        self.trace_bidi(&method, &params);
        let fut = self
            .client
            .send(method, params)
            .map_err(EngineError::from)?;
        fut.await.map_err(EngineError::from)
    }

    /// Issue a BiDi command with an explicit deadline.
    pub(crate) async fn send_with_timeout(
        &self,
        method: impl Into<MethodId>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let method = method.into();
        self.trace_bidi(&method, &params);
        let fut = self
            .client
            .send_with_timeout(method, params, timeout)
            .map_err(EngineError::from)?;
        fut.await.map_err(EngineError::from)
    }

    fn trace_bidi(&self, method: &str, params: &Value) {
        if let Ok(mut guard) = self.tracer.try_lock() {
            if let Some(tracer) = guard.as_mut() {
                tracer.record_bidi_command(method, params);
            }
        }
    }

    /// Evaluate a function in a browsing context and return the raw
    /// `EvaluateResult`.
    pub(crate) async fn call_function(
        &self,
        context: &str,
        declaration: &str,
        arguments: Value,
        await_promise: bool,
        ownership: &str,
    ) -> Result<Value> {
        self.send(
            "script.callFunction",
            json!({
                "functionDeclaration": declaration,
                "arguments": arguments,
                "target": { "context": context },
                "awaitPromise": await_promise,
                "resultOwnership": ownership,
            }),
        )
        .await
    }

    /// Evaluate a function and flatten its value to plain JSON.
    pub(crate) async fn eval_json(
        &self,
        context: &str,
        declaration: &str,
        arguments: Value,
    ) -> Result<Value> {
        let result = self
            .call_function(context, declaration, arguments, true, "none")
            .await?;
        crate::values::unwrap_evaluate_result(&result)
    }

    // --- page registry ---------------------------------------------------

    pub(crate) fn register_page(&self, context: &str, url: &str) -> Arc<Page> {
        let mut pages = self.pages.write().expect("pages poisoned");
        if let Some(existing) = pages.iter().find(|p| p.context() == context) {
            return Arc::clone(existing);
        }
        let page = Arc::new(Page::new(context, url));
        pages.push(Arc::clone(&page));
        page
    }

    pub(crate) fn remove_page(&self, context: &str) {
        let mut pages = self.pages.write().expect("pages poisoned");
        pages.retain(|p| p.context() != context);
        let mut active = self.active.write().expect("active poisoned");
        if *active == context {
            *active = pages.first().map(|p| p.context().to_string()).unwrap_or_default();
        }
    }

    pub(crate) fn page_by_context(&self, context: &str) -> Option<Arc<Page>> {
        self.pages
            .read()
            .expect("pages poisoned")
            .iter()
            .find(|p| p.context() == context)
            .map(Arc::clone)
    }

    pub(crate) fn pages_snapshot(&self) -> Vec<Arc<Page>> {
        self.pages.read().expect("pages poisoned").clone()
    }

    pub(crate) fn active_context(&self) -> String {
        self.active.read().expect("active poisoned").clone()
    }

    pub(crate) fn set_active(&self, context: &str) {
        *self.active.write().expect("active poisoned") = context.to_string();
    }

    /// The page commands act on by default.
    pub(crate) fn active_page(&self) -> Result<Arc<Page>> {
        let context = self.active_context();
        self.page_by_context(&context)
            .ok_or_else(|| EngineError::protocol("no active page"))
    }

    /// Sum of routes across all pages, for intercept teardown.
    pub(crate) fn total_routes(&self) -> usize {
        self.pages
            .read()
            .expect("pages poisoned")
            .iter()
            .map(|p| p.route_count())
            .sum()
    }

    // --- shutdown --------------------------------------------------------

    pub(crate) async fn teardown(&self) -> Result<()> {
        if let Some(mut tracer) = self.tracer.lock().await.take() {
            tracer.abort();
        }
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(EngineError::from)
    }
}

fn browser_config(config: &Configuration) -> BrowserConfig {
    let mut builder = BrowserConfig::builder().request_timeout(config.default_timeout.max(Duration::from_secs(60)));
    if let Some(ref path) = config.executable {
        builder = builder.executable(path.clone());
    }
    builder.build().unwrap_or_default()
}

/// WebDriver capabilities negotiated on `session.new`. The headless flag and
/// default window size travel to the browser through the supervisor here.
fn capabilities(config: &Configuration) -> Value {
    let mut args = vec!["--no-first-run".to_string(), "--disable-search-engine-choice-screen".to_string()];
    if config.headless {
        args.push("--headless=new".to_string());
    }
    if let Some((width, height)) = config.viewport {
        args.push(format!("--window-size={width},{height}"));
    }
    json!({
        "alwaysMatch": {
            "acceptInsecureCerts": true,
            "unhandledPromptBehavior": { "default": "ignore" },
            "goog:chromeOptions": { "args": args },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_carry_the_headless_flag() {
        let caps = capabilities(&Configuration::default());
        let args = caps["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));

        let caps = capabilities(&Configuration::default().with_headless(false));
        let args = caps["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(!args.iter().any(|a| a == "--headless=new"));
    }
}
