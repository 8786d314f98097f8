//! The command engine: the stable set of named operations the daemon
//! exposes, each a deterministic sequence of BiDi calls.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::session::{Live, Session};

pub mod a11y;
pub mod actions;
pub mod clock;
pub mod dialogs;
pub mod find;
pub mod keys;
pub mod navigation;
pub mod network;
pub mod screenshot;
pub mod script;

/// Poll cadence of auto-wait loops.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything an operation needs: the live browser and its deadline.
#[derive(Debug)]
pub(crate) struct OpCtx {
    pub live: Arc<Live>,
    pub timeout: Duration,
}

/// Routes tool calls into operations.
#[derive(Debug, Clone)]
pub struct Engine {
    session: Arc<Session>,
}

impl Engine {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run one named operation. The whole operation is bounded by the caller
    /// supplied `timeout` argument (milliseconds) or the configured default.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Result<Value> {
        let name = normalize_tool(tool);
        let mut args = if args.is_null() { json!({}) } else { args };
        if !args.is_object() {
            return Err(EngineError::invalid("arguments must be a JSON object"));
        }

        let timeout = args
            .as_object_mut()
            .and_then(|obj| obj.remove("timeout"))
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.session.config().default_timeout);

        // small grace so operations report their own, more specific errors
        // before the backstop fires
        let mut backstop = timeout + Duration::from_millis(250);
        if name == "sleep" {
            if let Some(ms) = args.get("ms").and_then(|v| v.as_u64()) {
                backstop = backstop.max(Duration::from_millis(ms + 250));
            }
        }
        match tokio::time::timeout(backstop, self.run(&name, args, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                tool: name,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn run(&self, name: &str, args: Value, timeout: Duration) -> Result<Value> {
        // a handful of tools operate on the session itself
        match name {
            "quit" => {
                self.session.shutdown().await?;
                return Ok(json!({ "closed": true }));
            }
            "status" => return Ok(self.session.status().await),
            // kept as a no-op: launching is lazy, the verb predates that
            "browser_launch" => {
                self.session.live().await?;
                return Ok(json!({ "launched": true }));
            }
            _ => {}
        }

        // an unknown tool must not launch a browser as a side effect
        if !is_known_tool(name) {
            return Err(EngineError::MethodNotFound {
                name: name.to_string(),
            });
        }

        let live = self.session.live().await?;
        let ctx = OpCtx { live, timeout };

        match name {
            "go" | "navigate" => navigation::navigate(&ctx, args).await,
            "back" => navigation::back(&ctx).await,
            "forward" => navigation::forward(&ctx).await,
            "reload" => navigation::reload(&ctx).await,
            "url" => navigation::url(&ctx).await,
            "title" => navigation::title(&ctx).await,
            "content" => navigation::content(&ctx).await,
            "set_content" => navigation::set_content(&ctx, args).await,
            "wait_for_load" => navigation::wait_for_load(&ctx).await,
            "wait_for_url" => navigation::wait_for_url(&ctx, args).await,
            "sleep" => navigation::sleep(args).await,
            "tabs" => navigation::tabs(&ctx).await,
            "tab_new" => navigation::tab_new(&ctx, args).await,
            "tab_switch" => navigation::tab_switch(&ctx, args).await,
            "tab_close" => navigation::tab_close(&ctx, args).await,
            "set_window" => navigation::set_window(&ctx, args).await,

            "find" => find::find(&ctx, args).await,
            "find_all" => find::find_all(&ctx, args).await,
            "find_by_role" => find::find_by_role(&ctx, args).await,
            "map" => find::map(&ctx, args).await,

            "click" => actions::click(&ctx, args).await,
            "dblclick" => actions::dblclick(&ctx, args).await,
            "hover" => actions::hover(&ctx, args).await,
            "type" => actions::type_text(&ctx, args).await,
            "fill" => actions::fill(&ctx, args).await,
            "press" => actions::press(&ctx, args).await,
            "keys" => actions::key_sequence(&ctx, args).await,
            "clear" => actions::clear(&ctx, args).await,
            "check" => actions::check(&ctx, args).await,
            "uncheck" => actions::uncheck(&ctx, args).await,
            "select" | "select_option" => actions::select_option(&ctx, args).await,
            "tap" => actions::tap(&ctx, args).await,
            "drag_to" => actions::drag_to(&ctx, args).await,
            "scroll_into_view" => actions::scroll_into_view(&ctx, args).await,
            "dispatch_event" => actions::dispatch_event(&ctx, args).await,
            "set_files" => actions::set_files(&ctx, args).await,
            "is_visible" => actions::is_visible(&ctx, args).await,
            "attr" => actions::attr(&ctx, args).await,
            "value" => actions::value(&ctx, args).await,
            "text" => actions::text(&ctx, args).await,
            "html" => actions::html(&ctx, args).await,

            "eval" => script::eval(&ctx, args).await,
            "eval_handle" => script::eval_handle(&ctx, args).await,
            "add_script" => script::add_script(&ctx, args).await,
            "add_style" => script::add_style(&ctx, args).await,
            "expose" => script::expose(&ctx, args).await,

            "route" => network::route(&ctx, args).await,
            "unroute" => network::unroute(&ctx, args).await,
            "wait_for_response" => network::wait_for_response(&ctx, args).await,
            "wait_for_download" => network::wait_for_download(&ctx).await,
            "cookies" => network::cookies(&ctx, args).await,
            "set_cookies" => network::set_cookies(&ctx, args).await,
            "clear_cookies" => network::clear_cookies(&ctx).await,

            "on_dialog" => dialogs::on_dialog(&ctx, args).await,

            "clock_install" => clock::install(&ctx, args).await,
            "clock_fast_forward" => clock::fast_forward(&ctx, args).await,
            "clock_run_for" => clock::run_for(&ctx, args).await,
            "clock_pause_at" => clock::pause_at(&ctx, args).await,
            "clock_resume" => clock::resume(&ctx).await,
            "clock_set_fixed_time" => clock::set_fixed_time(&ctx, args).await,
            "clock_set_system_time" => clock::set_system_time(&ctx, args).await,
            "clock_set_timezone" => clock::set_timezone(&ctx, args).await,

            "a11y_tree" => a11y::tree(&ctx, args).await,
            "screenshot" => screenshot::screenshot(&ctx, args).await,
            "pdf" => screenshot::pdf(&ctx).await,

            "tracing_start" => crate::trace::start(&ctx, args).await,
            "tracing_stop" => crate::trace::stop(&ctx, args).await,
            "tracing_stop_chunk" => crate::trace::stop_chunk(&ctx, args).await,
            "tracing_start_group" => crate::trace::start_group(&ctx, args).await,
            "tracing_stop_group" => crate::trace::stop_group(&ctx).await,

            other => Err(EngineError::MethodNotFound {
                name: other.to_string(),
            }),
        }
    }
}

/// Tool names arrive in kebab (CLI), dotted (MCP) or snake form; the engine
/// speaks snake.
pub(crate) fn normalize_tool(tool: &str) -> String {
    tool.trim().replace(['-', '.'], "_")
}

/// Kept in sync with the dispatch table above.
fn is_known_tool(name: &str) -> bool {
    matches!(
        name,
        "go" | "navigate"
            | "back"
            | "forward"
            | "reload"
            | "url"
            | "title"
            | "content"
            | "set_content"
            | "wait_for_load"
            | "wait_for_url"
            | "sleep"
            | "tabs"
            | "tab_new"
            | "tab_switch"
            | "tab_close"
            | "set_window"
            | "find"
            | "find_all"
            | "find_by_role"
            | "map"
            | "click"
            | "dblclick"
            | "hover"
            | "type"
            | "fill"
            | "press"
            | "keys"
            | "clear"
            | "check"
            | "uncheck"
            | "select"
            | "select_option"
            | "tap"
            | "drag_to"
            | "scroll_into_view"
            | "dispatch_event"
            | "set_files"
            | "is_visible"
            | "attr"
            | "value"
            | "text"
            | "html"
            | "eval"
            | "eval_handle"
            | "add_script"
            | "add_style"
            | "expose"
            | "route"
            | "unroute"
            | "wait_for_response"
            | "wait_for_download"
            | "cookies"
            | "set_cookies"
            | "clear_cookies"
            | "on_dialog"
            | "clock_install"
            | "clock_fast_forward"
            | "clock_run_for"
            | "clock_pause_at"
            | "clock_resume"
            | "clock_set_fixed_time"
            | "clock_set_system_time"
            | "clock_set_timezone"
            | "a11y_tree"
            | "screenshot"
            | "pdf"
            | "tracing_start"
            | "tracing_stop"
            | "tracing_stop_chunk"
            | "tracing_start_group"
            | "tracing_stop_group"
    )
}

/// Deserialize operation parameters. Unknown keys are rejected rather than
/// silently ignored.
pub(crate) fn params<T: DeserializeOwned>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|err| EngineError::invalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_normalize() {
        assert_eq!(normalize_tool("find-all"), "find_all");
        assert_eq!(normalize_tool("clock.install"), "clock_install");
        assert_eq!(normalize_tool("click"), "click");
    }

    #[test]
    fn the_cli_surface_is_known() {
        for tool in [
            "go",
            "find_all",
            "find_by_role",
            "scroll_into_view",
            "wait_for_url",
            "is_visible",
            "a11y_tree",
            "set_window",
            "clock_install",
            "tracing_stop_chunk",
        ] {
            assert!(is_known_tool(tool), "{tool} should be routable");
        }
        assert!(!is_known_tool("bogus"));
        assert!(!is_known_tool("browser_launch"), "handled before the table");
    }
}
