//! Navigation and page lifecycle operations.

use std::time::{Duration, Instant};

use futures::StreamExt;
use futures_timer::Delay;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx, POLL_INTERVAL};
use crate::error::{EngineError, Result};
use crate::glob::UrlPattern;
use crate::js;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NavigateParams {
    pub url: String,
}

pub(crate) async fn navigate(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: NavigateParams = params(args)?;
    let page = ctx.live.active_page()?;
    let result = ctx
        .live
        .send_with_timeout(
            "browsingContext.navigate",
            json!({ "context": page.context(), "url": p.url, "wait": "complete" }),
            ctx.timeout,
        )
        .await?;
    if let Some(url) = result.get("url").and_then(Value::as_str) {
        page.set_url(url);
    }
    Ok(json!({ "url": result.get("url").cloned().unwrap_or(json!(p.url)) }))
}

async fn traverse(ctx: &OpCtx, delta: i64) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .send(
            "browsingContext.traverseHistory",
            json!({ "context": page.context(), "delta": delta }),
        )
        .await?;
    Ok(Value::Null)
}

pub(crate) async fn back(ctx: &OpCtx) -> Result<Value> {
    traverse(ctx, -1).await
}

pub(crate) async fn forward(ctx: &OpCtx) -> Result<Value> {
    traverse(ctx, 1).await
}

pub(crate) async fn reload(ctx: &OpCtx) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .send_with_timeout(
            "browsingContext.reload",
            json!({ "context": page.context(), "wait": "complete" }),
            ctx.timeout,
        )
        .await?;
    Ok(Value::Null)
}

pub(crate) async fn url(ctx: &OpCtx) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .eval_json(page.context(), "() => window.location.href", json!([]))
        .await
}

pub(crate) async fn title(ctx: &OpCtx) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .eval_json(page.context(), "() => document.title", json!([]))
        .await
}

pub(crate) async fn content(ctx: &OpCtx) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .eval_json(page.context(), js::OUTER_HTML, json!([]))
        .await
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetContentParams {
    pub html: String,
}

pub(crate) async fn set_content(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: SetContentParams = params(args)?;
    let page = ctx.live.active_page()?;
    ctx.live
        .eval_json(
            page.context(),
            js::SET_CONTENT,
            json!([{ "type": "string", "value": p.html }]),
        )
        .await?;
    Ok(Value::Null)
}

/// Wait for the load event, answering immediately when the document is
/// already complete.
pub(crate) async fn wait_for_load(ctx: &OpCtx) -> Result<Value> {
    let page = ctx.live.active_page()?;
    let mut loads = ctx
        .live
        .client()
        .listen("browsingContext.load", Some(page.context().to_string()))
        .await
        .map_err(EngineError::from)?;

    let state = ctx
        .live
        .eval_json(page.context(), "() => document.readyState", json!([]))
        .await?;
    if state.as_str() == Some("complete") {
        return Ok(Value::Null);
    }

    match tokio::time::timeout(ctx.timeout, loads.next()).await {
        Ok(Some(_)) => Ok(Value::Null),
        Ok(None) => Err(EngineError::BrowserCrashed),
        Err(_) => Err(EngineError::Timeout {
            tool: "wait-for-load".to_string(),
            timeout_ms: ctx.timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForUrlParams {
    pub pattern: String,
}

pub(crate) async fn wait_for_url(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: WaitForUrlParams = params(args)?;
    let pattern = UrlPattern::parse(&p.pattern)?;
    let page = ctx.live.active_page()?;
    let start = Instant::now();
    loop {
        let current = ctx
            .live
            .eval_json(page.context(), "() => window.location.href", json!([]))
            .await?;
        if let Some(url) = current.as_str() {
            if pattern.matches(url) {
                return Ok(json!(url));
            }
        }
        if start.elapsed() + POLL_INTERVAL >= ctx.timeout {
            return Err(EngineError::Timeout {
                tool: format!("wait-for-url {}", p.pattern),
                timeout_ms: ctx.timeout.as_millis() as u64,
            });
        }
        Delay::new(POLL_INTERVAL).await;
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SleepParams {
    pub ms: u64,
}

pub(crate) async fn sleep(args: Value) -> Result<Value> {
    let p: SleepParams = params(args)?;
    tokio::time::sleep(Duration::from_millis(p.ms)).await;
    Ok(Value::Null)
}

pub(crate) async fn tabs(ctx: &OpCtx) -> Result<Value> {
    let active = ctx.live.active_context();
    let tabs: Vec<Value> = ctx
        .live
        .pages_snapshot()
        .iter()
        .enumerate()
        .map(|(index, page)| {
            json!({
                "index": index,
                "context": page.context(),
                "url": page.url(),
                "active": page.context() == active,
            })
        })
        .collect();
    Ok(Value::Array(tabs))
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TabNewParams {
    #[serde(default)]
    pub url: Option<String>,
}

pub(crate) async fn tab_new(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TabNewParams = params(args)?;
    let created = ctx
        .live
        .send("browsingContext.create", json!({ "type": "tab" }))
        .await?;
    let context = created
        .get("context")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::protocol("browsingContext.create returned no context"))?
        .to_string();

    ctx.live.register_page(&context, "about:blank");
    ctx.live.set_active(&context);

    if let Some(url) = p.url {
        ctx.live
            .send_with_timeout(
                "browsingContext.navigate",
                json!({ "context": context, "url": url, "wait": "complete" }),
                ctx.timeout,
            )
            .await?;
    }
    Ok(json!({ "context": context }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TabSwitchParams {
    /// Tab index as printed by `tabs`, or a context id.
    pub tab: Value,
}

pub(crate) async fn tab_switch(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TabSwitchParams = params(args)?;
    let pages = ctx.live.pages_snapshot();
    let context = match &p.tab {
        Value::Number(n) => {
            let index = n.as_u64().ok_or_else(|| EngineError::invalid("tab index must be unsigned"))? as usize;
            pages
                .get(index)
                .map(|page| page.context().to_string())
                .ok_or_else(|| EngineError::invalid(format!("no tab at index {index}")))?
        }
        Value::String(s) => s.clone(),
        _ => return Err(EngineError::invalid("tab must be an index or a context id")),
    };

    ctx.live
        .send("browsingContext.activate", json!({ "context": context }))
        .await?;
    ctx.live.set_active(&context);
    Ok(Value::Null)
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TabCloseParams {
    #[serde(default)]
    pub tab: Option<Value>,
}

pub(crate) async fn tab_close(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TabCloseParams = params(args)?;
    let context = match p.tab {
        None => ctx.live.active_context(),
        Some(Value::Number(n)) => {
            let index = n.as_u64().unwrap_or_default() as usize;
            ctx.live
                .pages_snapshot()
                .get(index)
                .map(|page| page.context().to_string())
                .ok_or_else(|| EngineError::invalid(format!("no tab at index {index}")))?
        }
        Some(Value::String(s)) => s,
        Some(_) => return Err(EngineError::invalid("tab must be an index or a context id")),
    };

    ctx.live
        .send("browsingContext.close", json!({ "context": context }))
        .await?;
    ctx.live.remove_page(&context);
    Ok(Value::Null)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetWindowParams {
    pub width: u32,
    pub height: u32,
}

/// Window sizing drives the local browser; a remote endpoint owns its own
/// windows.
pub(crate) async fn set_window(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: SetWindowParams = params(args)?;
    if ctx.live.is_remote() {
        return Err(EngineError::NotSupported {
            what: "set-window".to_string(),
        });
    }
    let page = ctx.live.active_page()?;
    ctx.live
        .send(
            "browsingContext.setViewport",
            json!({
                "context": page.context(),
                "viewport": { "width": p.width, "height": p.height },
            }),
        )
        .await?;
    Ok(Value::Null)
}
