//! Element finding with auto-wait.
//!
//! A selector is either a raw CSS/XPath string or a semantic record; the
//! recognized semantic keys combine conjunctively and unknown keys are
//! rejected. Finding polls the injected predicate at a bounded cadence until
//! a match exists or the timeout elapses.

use std::time::Instant;

use futures_timer::Delay;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::engine::{params, OpCtx, POLL_INTERVAL};
use crate::error::{EngineError, Result};
use crate::handles::{self, HandleEntry};
use crate::js;
use crate::page::Page;
use crate::session::Live;
use crate::values;

/// The semantic selector record. All keys are optional but at least one must
/// be present; combinations are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FindParams {
    /// Raw selector: CSS, or XPath when it starts with `/` or `(`.
    pub selector: Option<String>,
    pub css: Option<String>,
    pub role: Option<String>,
    pub text: Option<String>,
    pub label: Option<String>,
    pub placeholder: Option<String>,
    pub alt: Option<String>,
    pub title: Option<String>,
    pub testid: Option<String>,
    pub xpath: Option<String>,
    pub near: Option<String>,
}

impl FindParams {
    pub fn from_selector(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            ..Default::default()
        }
    }

    /// The JSON spec embedded into the finder predicate.
    pub fn spec(&self) -> Result<Value> {
        let mut spec = Map::new();
        if let Some(ref sel) = self.selector {
            if sel.starts_with('/') || sel.starts_with('(') {
                spec.insert("xpath".into(), json!(sel));
            } else {
                spec.insert("css".into(), json!(sel));
            }
        }
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                spec.insert(key.to_string(), json!(v));
            }
        };
        put("css", &self.css);
        put("role", &self.role);
        put("text", &self.text);
        put("label", &self.label);
        put("placeholder", &self.placeholder);
        put("alt", &self.alt);
        put("title", &self.title);
        put("testid", &self.testid);
        put("xpath", &self.xpath);
        put("near", &self.near);

        if spec.is_empty() {
            return Err(EngineError::invalid(
                "find needs a selector or at least one of role/text/label/placeholder/alt/title/testid/xpath/near",
            ));
        }
        Ok(Value::Object(spec))
    }

    /// Human readable form for error messages.
    pub fn describe(&self) -> String {
        self.spec()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "<empty>".to_string())
    }
}

/// Poll the page with the find predicate until at least one element matches
/// or the deadline elapses; returns the matching `sharedId`s (possibly empty).
pub(crate) async fn poll_for_matches(
    ctx: &OpCtx,
    page: &Page,
    spec: &Value,
) -> Result<Vec<String>> {
    let source = js::finder_source(spec);
    let start = Instant::now();
    loop {
        let result = ctx
            .live
            .call_function(page.context(), &source, json!([]), false, "none")
            .await?;
        let ids = values::shared_ids_of_array(&result)?;
        if !ids.is_empty() {
            return Ok(ids);
        }
        if start.elapsed() + POLL_INTERVAL >= ctx.timeout {
            return Ok(Vec::new());
        }
        Delay::new(POLL_INTERVAL).await;
    }
}

/// `{tag, text, box}` summary of one element.
pub(crate) async fn describe_element(live: &Live, page: &Page, shared_id: &str) -> Result<Value> {
    live.eval_json(
        page.context(),
        js::DESCRIBE_ELEMENT,
        json!([{ "sharedId": shared_id }]),
    )
    .await
}

fn record_matches(page: &Page, spec: &Value, ids: &[String]) {
    let entries = ids
        .iter()
        .enumerate()
        .map(|(index, id)| HandleEntry {
            shared_id: Some(id.clone()),
            spec: spec.clone(),
            index,
        })
        .collect();
    page.handles.replace_all(entries, page.url());
}

async fn found_entry(
    ctx: &OpCtx,
    page: &Page,
    shared_id: &str,
    index: usize,
) -> Result<Value> {
    let mut described = describe_element(&ctx.live, page, shared_id).await?;
    if let Some(obj) = described.as_object_mut() {
        obj.insert("ref".into(), json!(handles::token_for(index)));
    }
    Ok(described)
}

/// `find`: first match with auto-wait; replaces the page's refmap.
pub(crate) async fn find(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: FindParams = params(args)?;
    let spec = p.spec()?;
    let page = ctx.live.active_page()?;

    let ids = poll_for_matches(ctx, &page, &spec).await?;
    if ids.is_empty() {
        return Err(EngineError::ElementNotFound {
            selector: p.describe(),
            waited_ms: ctx.timeout.as_millis() as u64,
        });
    }
    record_matches(&page, &spec, &ids);
    found_entry(ctx, &page, &ids[0], 0).await
}

/// `find-all`: every match after auto-wait; an empty page yields `[]`.
pub(crate) async fn find_all(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: FindParams = params(args)?;
    let spec = p.spec()?;
    let page = ctx.live.active_page()?;

    let ids = poll_for_matches(ctx, &page, &spec).await?;
    record_matches(&page, &spec, &ids);

    let mut out = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        out.push(found_entry(ctx, &page, id, index).await?);
    }
    Ok(Value::Array(out))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FindByRoleParams {
    pub role: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `find-by-role`: role plus accessible-name filter.
pub(crate) async fn find_by_role(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: FindByRoleParams = params(args)?;
    let find_params = FindParams {
        role: Some(p.role),
        text: p.name,
        ..Default::default()
    };
    find(ctx, serde_json::to_value(find_params)?).await
}

/// `map`: like `find-all`, for surveying a page region.
pub(crate) async fn map(ctx: &OpCtx, args: Value) -> Result<Value> {
    find_all(ctx, args).await
}

/// Resolution outcome of a click/type target.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedElement {
    pub shared_id: String,
    /// Set when the target was a `@eN` token; enables the stale retry.
    pub token: Option<String>,
}

/// Resolve an action target: a `@eN` ref or a raw selector (found with
/// auto-wait).
pub(crate) async fn resolve_target(
    ctx: &OpCtx,
    page: &Page,
    target: &str,
) -> Result<ResolvedElement> {
    if handles::is_token(target) {
        let (entry, _) = page.handles.lookup(target)?;
        if let Some(shared_id) = entry.shared_id {
            return Ok(ResolvedElement {
                shared_id,
                token: Some(target.to_string()),
            });
        }
        let shared_id = refresh_token(ctx, page, target).await?;
        return Ok(ResolvedElement {
            shared_id,
            token: Some(target.to_string()),
        });
    }

    let spec = FindParams::from_selector(target).spec()?;
    let ids = poll_for_matches(ctx, page, &spec).await?;
    match ids.into_iter().next() {
        Some(shared_id) => Ok(ResolvedElement {
            shared_id,
            token: None,
        }),
        None => Err(EngineError::ElementNotFound {
            selector: target.to_string(),
            waited_ms: ctx.timeout.as_millis() as u64,
        }),
    }
}

/// Re-resolve a token through its fallback locator. Only legal while the
/// page URL is unchanged since the handle was captured; otherwise the handle
/// is stale.
pub(crate) async fn refresh_token(ctx: &OpCtx, page: &Page, token: &str) -> Result<String> {
    let (entry, captured_url) = page.handles.lookup(token)?;
    if page.url() != captured_url {
        return Err(EngineError::StaleHandle {
            handle: token.to_string(),
        });
    }

    let source = js::finder_source(&entry.spec);
    let result = ctx
        .live
        .call_function(page.context(), &source, json!([]), false, "none")
        .await?;
    let ids = values::shared_ids_of_array(&result)?;
    match ids.get(entry.index) {
        Some(shared_id) => {
            page.handles.update_shared_id(token, shared_id.clone());
            Ok(shared_id.clone())
        }
        None => Err(EngineError::StaleHandle {
            handle: token.to_string(),
        }),
    }
}

/// Whether an error is the browser telling us a `sharedId` no longer
/// resolves.
pub(crate) fn is_no_such_node(err: &EngineError) -> bool {
    matches!(err, EngineError::Protocol { message } if message.starts_with("no such node"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_strings_split_into_css_and_xpath() {
        let spec = FindParams::from_selector("a.nav").spec().unwrap();
        assert_eq!(spec["css"], "a.nav");
        let spec = FindParams::from_selector("//a[@href]").spec().unwrap();
        assert_eq!(spec["xpath"], "//a[@href]");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = params::<FindParams>(json!({ "rolle": "button" })).unwrap_err();
        assert_eq!(err.code(), crate::error::codes::INVALID_PARAMS);
    }

    #[test]
    fn empty_spec_is_rejected() {
        assert!(FindParams::default().spec().is_err());
    }

    #[test]
    fn semantic_keys_combine() {
        let p: FindParams = params(json!({ "role": "button", "text": "Save" })).unwrap();
        let spec = p.spec().unwrap();
        assert_eq!(spec["role"], "button");
        assert_eq!(spec["text"], "Save");
    }
}
