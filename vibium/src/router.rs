//! Fan-out of BiDi events to the session state they act on.
//!
//! The router runs on its own task and handles events synchronously in
//! arrival order; work that must not block it (answering prompts, resolving
//! intercepted requests) is spawned off. A failing handler is logged and
//! never stops the router.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{select_all, StreamExt};
use serde_json::{json, Value};
use vibium_bidi::EventMessage;

use crate::error::{EngineError, Result};
use crate::page::{DialogAction, RouteAction};
use crate::session::{Download, ExposedCall, Live};

/// Events the router needs; waiters (`wait-for-load`, `wait-for-response`)
/// register their own scoped listeners instead.
const ROUTED_EVENTS: &[&str] = &[
    "browsingContext.contextCreated",
    "browsingContext.contextDestroyed",
    "browsingContext.navigationStarted",
    "browsingContext.fragmentNavigated",
    "browsingContext.domContentLoaded",
    "browsingContext.load",
    "browsingContext.userPromptOpened",
    "browsingContext.downloadWillBegin",
    "network.beforeRequestSent",
    "script.message",
    "log.entryAdded",
];

pub(crate) async fn spawn(live: Arc<Live>) -> Result<()> {
    let mut streams = Vec::with_capacity(ROUTED_EVENTS.len());
    for method in ROUTED_EVENTS {
        let stream = live
            .client()
            .listen(*method, None)
            .await
            .map_err(EngineError::from)?;
        streams.push(stream);
    }

    let mut merged = select_all(streams);
    tokio::spawn(async move {
        while let Some(event) = merged.next().await {
            if let Err(err) = route_event(&live, &event) {
                tracing::warn!(method = %event.method, "event handler failed: {err}");
            }
        }
        tracing::debug!("event router stopped");
    });
    Ok(())
}

fn route_event(live: &Arc<Live>, event: &EventMessage) -> Result<()> {
    if let Ok(mut guard) = live.tracer.try_lock() {
        if let Some(tracer) = guard.as_mut() {
            tracer.record_bidi_event(&event.method, &event.params);
        }
    }

    let params = &event.params;
    match event.method.as_str() {
        "browsingContext.contextCreated" => {
            // only top-level contexts become pages; frames stay internal
            if params.get("parent").and_then(Value::as_str).is_none() {
                if let Some(context) = params.get("context").and_then(Value::as_str) {
                    let url = params.get("url").and_then(Value::as_str).unwrap_or("about:blank");
                    live.register_page(context, url);
                }
            }
        }
        "browsingContext.contextDestroyed" => {
            if let Some(context) = params.get("context").and_then(Value::as_str) {
                live.remove_page(context);
            }
        }
        "browsingContext.navigationStarted"
        | "browsingContext.fragmentNavigated"
        | "browsingContext.domContentLoaded"
        | "browsingContext.load" => {
            if let (Some(context), Some(url)) = (
                params.get("context").and_then(Value::as_str),
                params.get("url").and_then(Value::as_str),
            ) {
                if let Some(page) = live.page_by_context(context) {
                    page.set_url(url);
                }
            }
        }
        "browsingContext.userPromptOpened" => on_user_prompt(live, params),
        "browsingContext.downloadWillBegin" => {
            let download = Download {
                url: params
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                suggested_filename: params
                    .get("suggestedFilename")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            live.downloads
                .lock()
                .expect("downloads poisoned")
                .push(download);
            live.download_notify.notify_waiters();
        }
        "network.beforeRequestSent" => on_before_request(live, params),
        "script.message" => {
            if let Some(name) = params
                .get("channel")
                .and_then(Value::as_str)
                .and_then(|c| c.strip_prefix("vibium:expose:"))
            {
                let args = params
                    .get("data")
                    .map(crate::values::remote_value_to_json)
                    .unwrap_or(Value::Null);
                live.exposed
                    .lock()
                    .expect("exposed poisoned")
                    .push(ExposedCall {
                        name: name.to_string(),
                        args,
                    });
            }
        }
        "log.entryAdded" => {
            let text = params.get("text").and_then(Value::as_str).unwrap_or_default();
            let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
            tracing::debug!(target: "vibium::console", level, "{text}");
        }
        other => {
            tracing::trace!(method = other, "unrouted event");
        }
    }
    Ok(())
}

/// The browser blocks the page until the prompt is resolved. A registered
/// handler answers immediately; otherwise a short grace window lets a racing
/// registration land before the prompt is dismissed automatically.
fn on_user_prompt(live: &Arc<Live>, params: &Value) {
    let Some(context) = params.get("context").and_then(Value::as_str) else {
        return;
    };
    let context = context.to_string();
    let action = live
        .page_by_context(&context)
        .and_then(|page| page.dialog_action());
    let live = Arc::clone(live);

    tokio::spawn(async move {
        let action = match action {
            Some(action) => action,
            None => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                live.page_by_context(&context)
                    .and_then(|page| page.dialog_action())
                    .unwrap_or(DialogAction::Dismiss)
            }
        };
        let (accept, text) = match action {
            DialogAction::Accept { text } => (true, text),
            DialogAction::Dismiss => (false, None),
        };
        let mut prompt = json!({ "context": context, "accept": accept });
        if let Some(text) = text {
            prompt["userText"] = json!(text);
        }
        if let Err(err) = live.send("browsingContext.handleUserPrompt", prompt).await {
            tracing::debug!("handleUserPrompt failed: {err}");
        }
    });
}

/// Intercepted requests match the page's route list in insertion order;
/// without a match the request continues untouched.
fn on_before_request(live: &Arc<Live>, params: &Value) {
    if !params
        .get("isBlocked")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return;
    }
    let Some(request_id) = params
        .get("request")
        .and_then(|r| r.get("request"))
        .and_then(Value::as_str)
    else {
        return;
    };
    let url = params
        .get("request")
        .and_then(|r| r.get("url"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let action = params
        .get("context")
        .and_then(Value::as_str)
        .and_then(|context| live.page_by_context(context))
        .and_then(|page| page.match_route(url));

    let request_id = request_id.to_string();
    let live = Arc::clone(live);
    tokio::spawn(async move {
        let outcome = match action {
            Some(RouteAction::Fulfill {
                status,
                headers,
                body,
            }) => {
                live.send(
                    "network.provideResponse",
                    json!({
                        "request": request_id,
                        "statusCode": status,
                        "headers": encode_headers(&headers),
                        "body": { "type": "string", "value": body },
                    }),
                )
                .await
            }
            Some(RouteAction::Continue { headers }) => {
                let mut cont = json!({ "request": request_id });
                if let Some(headers) = headers {
                    cont["headers"] = Value::Array(encode_headers(&headers));
                }
                live.send("network.continueRequest", cont).await
            }
            Some(RouteAction::Abort { .. }) => {
                live.send("network.failRequest", json!({ "request": request_id }))
                    .await
            }
            None => {
                live.send("network.continueRequest", json!({ "request": request_id }))
                    .await
            }
        };
        if let Err(err) = outcome {
            tracing::debug!("intercepted request resolution failed: {err}");
        }
    });
}

fn encode_headers(headers: &[(String, String)]) -> Vec<Value> {
    headers
        .iter()
        .map(|(name, value)| {
            json!({ "name": name, "value": { "type": "string", "value": value } })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_encode_as_bidi_pairs() {
        let encoded = encode_headers(&[("content-type".into(), "application/json".into())]);
        assert_eq!(encoded[0]["name"], "content-type");
        assert_eq!(encoded[0]["value"]["type"], "string");
        assert_eq!(encoded[0]["value"]["value"], "application/json");
    }
}
