//! Scripting operations: evaluation and injected page extensions.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::{EngineError, Result};
use crate::values;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalParams {
    pub expr: String,
}

/// Whether the expression already is a callable function literal.
fn is_likely_function(expr: &str) -> bool {
    let trimmed = expr.trim_start();
    if trimmed.starts_with("function") || trimmed.starts_with("async function") {
        return true;
    }
    // an arrow whose head contains only parameter-ish characters
    match trimmed.split_once("=>") {
        Some((head, _)) => head
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '(' | ')' | ',' | '_' | '$' | ' ' | '\t')),
        None => false,
    }
}

/// Wrap an expression so it can travel as a `script.callFunction`
/// declaration.
fn as_function_declaration(expr: &str) -> String {
    if is_likely_function(expr) {
        expr.to_string()
    } else {
        format!("() => ({expr})")
    }
}

/// `eval`: run the expression and return its deserialized value. Promises
/// are awaited; thrown errors surface as `ScriptException`.
pub(crate) async fn eval(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: EvalParams = params(args)?;
    let page = ctx.live.active_page()?;
    let result = ctx
        .live
        .call_function(
            page.context(),
            &as_function_declaration(&p.expr),
            json!([]),
            true,
            "root",
        )
        .await?;
    values::unwrap_evaluate_result(&result)
}

/// `eval-handle`: like `eval` but returns the opaque remote handle instead
/// of a value.
pub(crate) async fn eval_handle(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: EvalParams = params(args)?;
    let page = ctx.live.active_page()?;
    let result = ctx
        .live
        .call_function(
            page.context(),
            &as_function_declaration(&p.expr),
            json!([]),
            true,
            "root",
        )
        .await?;
    let remote = values::unwrap_evaluate_remote(&result)?;
    let handle = remote
        .get("handle")
        .or_else(|| remote.get("sharedId"))
        .cloned()
        .ok_or_else(|| EngineError::protocol("evaluation produced no handle"))?;
    Ok(json!({
        "handle": handle,
        "type": remote.get("type").cloned().unwrap_or(Value::Null),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddScriptParams {
    pub source: String,
}

/// `add-script`: run in every future context of the session, and in the
/// current page right away.
pub(crate) async fn add_script(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: AddScriptParams = params(args)?;
    let declaration = if is_likely_function(&p.source) {
        p.source.clone()
    } else {
        format!("() => {{ {} }}", p.source)
    };

    let added = ctx
        .live
        .send(
            "script.addPreloadScript",
            json!({ "functionDeclaration": declaration }),
        )
        .await?;

    let page = ctx.live.active_page()?;
    let _ = ctx
        .live
        .call_function(page.context(), &declaration, json!([]), false, "none")
        .await;

    Ok(json!({ "script": added.get("script").cloned().unwrap_or(Value::Null) }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddStyleParams {
    pub css: String,
}

/// `add-style`: a stylesheet injected into every context.
pub(crate) async fn add_style(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: AddStyleParams = params(args)?;
    let css = serde_json::to_string(&p.css)?;
    let declaration = format!(
        r#"() => {{
  const apply = () => {{
    const style = document.createElement('style');
    style.textContent = {css};
    (document.head || document.documentElement).appendChild(style);
  }};
  if (document.readyState === 'loading') {{
    document.addEventListener('DOMContentLoaded', apply, {{ once: true }});
  }} else {{
    apply();
  }}
}}"#
    );

    let added = ctx
        .live
        .send(
            "script.addPreloadScript",
            json!({ "functionDeclaration": declaration }),
        )
        .await?;

    let page = ctx.live.active_page()?;
    let _ = ctx
        .live
        .call_function(page.context(), &declaration, json!([]), false, "none")
        .await;

    Ok(json!({ "script": added.get("script").cloned().unwrap_or(Value::Null) }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposeParams {
    pub name: String,
}

/// `expose`: install `window.<name>` in every context. Invocations travel
/// back over a script channel and are recorded on the session; the JSON-RPC
/// surface has no way to call back into the client, so recording is the
/// observable contract.
pub(crate) async fn expose(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: ExposeParams = params(args)?;
    if p.name.is_empty() || !p.name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
        return Err(EngineError::invalid(format!(
            "{:?} is not a valid binding name",
            p.name
        )));
    }

    let name = serde_json::to_string(&p.name)?;
    let declaration = format!(
        "(channel) => {{ globalThis[{name}] = (...args) => {{ channel(args); }}; }}"
    );
    let channel = json!([{
        "type": "channel",
        "value": { "channel": format!("vibium:expose:{}", p.name) },
    }]);

    ctx.live
        .send(
            "script.addPreloadScript",
            json!({ "functionDeclaration": declaration, "arguments": channel }),
        )
        .await?;

    let page = ctx.live.active_page()?;
    let _ = ctx
        .live
        .call_function(page.context(), &declaration, channel, false, "none")
        .await;

    Ok(json!({ "exposed": p.name }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expressions_get_wrapped() {
        assert_eq!(as_function_declaration("1 + 1"), "() => (1 + 1)");
        assert_eq!(
            as_function_declaration("document.title"),
            "() => (document.title)"
        );
    }

    #[test]
    fn function_literals_pass_through() {
        assert!(is_likely_function("() => 42"));
        assert!(is_likely_function("function f() { return 1; }"));
        assert!(is_likely_function("(a, b) => a + b"));
        // a comparison is not an arrow head
        assert!(!is_likely_function("fetch('/x').then(r => r.json())"));
    }
}
