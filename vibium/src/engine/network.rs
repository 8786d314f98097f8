//! Network interception, response waiting and cookies.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::{EngineError, Result};
use crate::glob::UrlPattern;
use crate::page::{Route, RouteAction};
use crate::session::Live;

/// Upper bound the browser buffers per collected response body.
const MAX_COLLECTED_BODY: u64 = 20 * 1024 * 1024;

/// Install the single `network.addIntercept` registration on first use.
async fn ensure_intercept(live: &Live) -> Result<()> {
    let mut intercept = live.network.intercept.lock().await;
    if intercept.is_some() {
        return Ok(());
    }
    let added = live
        .send(
            "network.addIntercept",
            json!({ "phases": ["beforeRequestSent"] }),
        )
        .await?;
    *intercept = added
        .get("intercept")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(())
}

/// Remove the intercept once the last route is gone.
async fn remove_intercept_if_unused(live: &Live) -> Result<()> {
    if live.total_routes() > 0 {
        return Ok(());
    }
    let mut intercept = live.network.intercept.lock().await;
    if let Some(id) = intercept.take() {
        live.send("network.removeIntercept", json!({ "intercept": id }))
            .await?;
    }
    Ok(())
}

/// Reference-counted acquisition of the browser-side data collector. The
/// collector exists exactly while routes, listeners or waiters exist.
pub(crate) async fn acquire_collector(live: &Live) {
    let mut collector = live.network.collector.lock().await;
    if collector.refs == 0 && collector.id.is_none() {
        match live
            .send(
                "network.addDataCollector",
                json!({
                    "dataTypes": ["response"],
                    "maxEncodedDataSize": MAX_COLLECTED_BODY,
                }),
            )
            .await
        {
            Ok(added) => {
                collector.id = added
                    .get("collector")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Err(err) => {
                // bodies become unavailable but interception still works
                tracing::debug!("data collector unavailable: {err}");
            }
        }
    }
    collector.refs += 1;
}

pub(crate) async fn release_collector(live: &Live) {
    let mut collector = live.network.collector.lock().await;
    collector.refs = collector.refs.saturating_sub(1);
    if collector.refs == 0 {
        if let Some(id) = collector.id.take() {
            if let Err(err) = live
                .send("network.removeDataCollector", json!({ "collector": id }))
                .await
            {
                tracing::debug!("removing data collector failed: {err}");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteParams {
    pub pattern: String,
    /// Externally tagged action; a missing action continues the request
    /// untouched.
    #[serde(default)]
    pub action: Option<RouteAction>,
}

pub(crate) async fn route(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: RouteParams = params(args)?;
    let pattern = UrlPattern::parse(&p.pattern)?;
    let page = ctx.live.active_page()?;

    ensure_intercept(&ctx.live).await?;
    acquire_collector(&ctx.live).await;

    page.push_route(Route {
        pattern,
        action: p.action.unwrap_or(RouteAction::Continue { headers: None }),
    });
    Ok(json!({ "routes": page.route_count() }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnrouteParams {
    pub pattern: String,
}

pub(crate) async fn unroute(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: UnrouteParams = params(args)?;
    let page = ctx.live.active_page()?;

    let before = page.route_count();
    let remaining = page.remove_routes(&p.pattern);
    let removed = before.saturating_sub(remaining);

    for _ in 0..removed {
        release_collector(&ctx.live).await;
    }
    remove_intercept_if_unused(&ctx.live).await?;
    Ok(json!({ "removed": removed, "routes": remaining }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitForResponseParams {
    pub pattern: String,
}

/// Wait for a response whose URL matches the pattern; includes the body
/// when the data collector could capture it.
pub(crate) async fn wait_for_response(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: WaitForResponseParams = params(args)?;
    let pattern = UrlPattern::parse(&p.pattern)?;

    acquire_collector(&ctx.live).await;
    let result = wait_for_response_inner(ctx, &pattern).await;
    release_collector(&ctx.live).await;
    result
}

async fn wait_for_response_inner(ctx: &OpCtx, pattern: &UrlPattern) -> Result<Value> {
    let mut responses = ctx
        .live
        .client()
        .listen("network.responseCompleted", None)
        .await
        .map_err(EngineError::from)?;

    let deadline = tokio::time::Instant::now() + ctx.timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, responses.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(EngineError::BrowserCrashed),
            Err(_) => {
                return Err(EngineError::Timeout {
                    tool: format!("wait-for-response {}", pattern.as_str()),
                    timeout_ms: ctx.timeout.as_millis() as u64,
                })
            }
        };

        let response = &event.params["response"];
        let Some(url) = response.get("url").and_then(Value::as_str) else {
            continue;
        };
        if !pattern.matches(url) {
            continue;
        }

        let request_id = event.params["request"]["request"].as_str().map(str::to_string);
        let mut out = json!({
            "url": url,
            "status": response.get("status").cloned().unwrap_or(Value::Null),
            "headers": flatten_headers(response.get("headers")),
        });

        if let Some(request_id) = request_id {
            if let Some(body) = fetch_body(&ctx.live, &request_id).await {
                out["body"] = json!(body);
            }
        }
        return Ok(out);
    }
}

async fn fetch_body(live: &Live, request_id: &str) -> Option<String> {
    let collector = live.network.collector.lock().await.id.clone()?;
    let data = live
        .send(
            "network.getData",
            json!({
                "request": request_id,
                "dataType": "response",
                "collector": collector,
            }),
        )
        .await
        .ok()?;
    data.get("bytes")
        .and_then(|b| b.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn flatten_headers(headers: Option<&Value>) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(list) = headers.and_then(Value::as_array) {
        for header in list {
            let (Some(name), Some(value)) = (
                header.get("name").and_then(Value::as_str),
                header
                    .get("value")
                    .and_then(|v| v.get("value"))
                    .and_then(Value::as_str),
            ) else {
                continue;
            };
            out.insert(name.to_ascii_lowercase(), json!(value));
        }
    }
    Value::Object(out)
}

/// `wait-for-download`: the next download announced by the browser.
pub(crate) async fn wait_for_download(ctx: &OpCtx) -> Result<Value> {
    let seen = ctx.live.downloads.lock().expect("downloads poisoned").len();
    let deadline = tokio::time::Instant::now() + ctx.timeout;

    loop {
        {
            let downloads = ctx.live.downloads.lock().expect("downloads poisoned");
            if downloads.len() > seen {
                return Ok(serde_json::to_value(&downloads[seen])?);
            }
        }
        if tokio::time::timeout_at(deadline, ctx.live.download_notify.notified())
            .await
            .is_err()
        {
            return Err(EngineError::Timeout {
                tool: "wait-for-download".to_string(),
                timeout_ms: ctx.timeout.as_millis() as u64,
            });
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CookiesParams {
    #[serde(default)]
    pub urls: Option<Vec<String>>,
}

pub(crate) async fn cookies(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: CookiesParams = params(args)?;
    let result = ctx.live.send("storage.getCookies", json!({})).await?;
    let cookies = result
        .get("cookies")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let domains: Option<Vec<String>> = p.urls.map(|urls| {
        urls.iter()
            .filter_map(|u| url::Url::parse(u).ok())
            .filter_map(|u| u.host_str().map(str::to_string))
            .collect()
    });

    let out: Vec<Value> = cookies
        .iter()
        .filter_map(|cookie| {
            let name = cookie.get("name")?.as_str()?;
            let value = cookie
                .get("value")
                .and_then(|v| v.get("value"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let domain = cookie.get("domain").and_then(Value::as_str).unwrap_or_default();
            if let Some(ref domains) = domains {
                let matches = domains
                    .iter()
                    .any(|d| d == domain || domain.trim_start_matches('.') == d);
                if !matches {
                    return None;
                }
            }
            Some(json!({
                "name": name,
                "value": value,
                "domain": domain,
                "path": cookie.get("path").cloned().unwrap_or(json!("/")),
                "secure": cookie.get("secure").cloned().unwrap_or(json!(false)),
                "httpOnly": cookie.get("httpOnly").cloned().unwrap_or(json!(false)),
            }))
        })
        .collect();
    Ok(Value::Array(out))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetCookiesParams {
    pub cookies: Vec<CookieParam>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CookieParam {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

pub(crate) async fn set_cookies(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: SetCookiesParams = params(args)?;
    for cookie in &p.cookies {
        let domain = match (&cookie.domain, &cookie.url) {
            (Some(domain), _) => domain.clone(),
            (None, Some(raw)) => url::Url::parse(raw)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .ok_or_else(|| {
                    EngineError::invalid(format!("cookie {:?} has no usable url", cookie.name))
                })?,
            (None, None) => {
                return Err(EngineError::invalid(format!(
                    "cookie {:?} needs a domain or url",
                    cookie.name
                )))
            }
        };

        ctx.live
            .send(
                "storage.setCookie",
                json!({
                    "cookie": {
                        "name": cookie.name,
                        "value": { "type": "string", "value": cookie.value },
                        "domain": domain,
                        "path": cookie.path.clone().unwrap_or_else(|| "/".to_string()),
                    }
                }),
            )
            .await?;
    }
    Ok(json!({ "set": p.cookies.len() }))
}

pub(crate) async fn clear_cookies(ctx: &OpCtx) -> Result<Value> {
    ctx.live.send("storage.deleteCookies", json!({})).await?;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_actions_deserialize_externally_tagged() {
        let p: RouteParams = params(json!({
            "pattern": "**/api/users",
            "action": { "fulfill": { "status": 200, "body": "{\"users\":[\"M\"]}" } }
        }))
        .unwrap();
        match p.action {
            Some(RouteAction::Fulfill { status, body, .. }) => {
                assert_eq!(status, 200);
                assert!(body.contains("users"));
            }
            other => panic!("expected fulfill, got {other:?}"),
        }
    }

    #[test]
    fn headers_flatten_lowercase() {
        let headers = json!([
            { "name": "Content-Type", "value": { "type": "string", "value": "text/html" } }
        ]);
        let flat = flatten_headers(Some(&headers));
        assert_eq!(flat["content-type"], "text/html");
    }
}
