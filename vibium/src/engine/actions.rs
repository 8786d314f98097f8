//! Action verbs: pointer and key input plus the element getters.
//!
//! Every verb accepts a raw selector or a `@eN` ref. Before any synthetic
//! input is dispatched the element must be attached, visible, enabled and
//! positionally stable over two consecutive polls; the editing verbs
//! additionally require an editable target.

use std::time::Instant;

use futures_timer::Delay;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::find::{self, ResolvedElement};
use crate::engine::keys;
use crate::engine::{params, OpCtx, POLL_INTERVAL};
use crate::error::{EngineError, Result};
use crate::js;
use crate::page::Page;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetParams {
    pub target: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetTextParams {
    pub target: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PressParams {
    /// Focus this element first; otherwise the combo goes to the focused one.
    #[serde(default)]
    pub target: Option<String>,
    pub keys: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectParams {
    pub target: String,
    pub values: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DragParams {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttrParams {
    pub target: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchEventParams {
    pub target: String,
    pub event: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetFilesParams {
    pub target: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub(crate) struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Actionability {
    pub attached: bool,
    pub visible: bool,
    pub disabled: bool,
    pub editable: bool,
    pub rect: Rect,
}

impl Rect {
    fn centroid(&self) -> (i64, i64) {
        (
            (self.x + self.width / 2.0).round() as i64,
            (self.y + self.height / 2.0).round() as i64,
        )
    }

    fn roughly_equals(&self, other: &Rect) -> bool {
        (self.x - other.x).abs() < 0.5
            && (self.y - other.y).abs() < 0.5
            && (self.width - other.width).abs() < 0.5
            && (self.height - other.height).abs() < 0.5
    }
}

// --- element plumbing ----------------------------------------------------

/// Evaluate a function against the element, retrying once through the
/// fallback locator when the captured `sharedId` no longer resolves.
pub(crate) async fn call_element_json(
    ctx: &OpCtx,
    page: &Page,
    el: &mut ResolvedElement,
    declaration: &str,
    extra_args: Vec<Value>,
) -> Result<Value> {
    let build_args = |shared_id: &str| {
        let mut args = vec![json!({ "sharedId": shared_id })];
        args.extend(extra_args.iter().cloned());
        Value::Array(args)
    };

    match ctx
        .live
        .eval_json(page.context(), declaration, build_args(&el.shared_id))
        .await
    {
        Err(err) if find::is_no_such_node(&err) && el.token.is_some() => {
            let token = el.token.clone().expect("token checked above");
            el.shared_id = find::refresh_token(ctx, page, &token).await?;
            ctx.live
                .eval_json(page.context(), declaration, build_args(&el.shared_id))
                .await
        }
        other => other,
    }
}

async fn probe(ctx: &OpCtx, page: &Page, el: &mut ResolvedElement) -> Result<Actionability> {
    let raw = call_element_json(ctx, page, el, js::ACTIONABILITY_PROBE, Vec::new()).await?;
    serde_json::from_value(raw)
        .map_err(|err| EngineError::protocol(format!("malformed actionability probe: {err}")))
}

/// Wait until the element is actionable and positionally stable for two
/// consecutive polls; returns the settled bounding rect.
pub(crate) async fn wait_actionable(
    ctx: &OpCtx,
    page: &Page,
    el: &mut ResolvedElement,
    verb: &str,
    need_editable: bool,
) -> Result<Rect> {
    let start = Instant::now();
    let mut previous: Option<Rect> = None;

    loop {
        let state = probe(ctx, page, el).await?;
        let ready = state.attached
            && state.visible
            && !state.disabled
            && (!need_editable || state.editable);

        if ready {
            if let Some(prev) = previous {
                if prev.roughly_equals(&state.rect) {
                    return Ok(state.rect);
                }
            }
            previous = Some(state.rect);
        } else {
            previous = None;
        }

        if start.elapsed() + POLL_INTERVAL >= ctx.timeout {
            return Err(EngineError::Timeout {
                tool: format!("{verb}: element never became actionable"),
                timeout_ms: ctx.timeout.as_millis() as u64,
            });
        }
        Delay::new(POLL_INTERVAL).await;
    }
}

async fn resolve(ctx: &OpCtx, target: &str) -> Result<(std::sync::Arc<Page>, ResolvedElement)> {
    let page = ctx.live.active_page()?;
    let el = find::resolve_target(ctx, &page, target).await?;
    Ok((page, el))
}

// --- input dispatch ------------------------------------------------------

async fn perform_pointer(
    ctx: &OpCtx,
    context: &str,
    pointer_type: &str,
    actions: Vec<Value>,
) -> Result<()> {
    ctx.live
        .send(
            "input.performActions",
            json!({
                "context": context,
                "actions": [{
                    "type": "pointer",
                    "id": "mouse",
                    "parameters": { "pointerType": pointer_type },
                    "actions": actions,
                }],
            }),
        )
        .await?;
    Ok(())
}

async fn perform_keys(ctx: &OpCtx, context: &str, actions: Vec<Value>) -> Result<()> {
    ctx.live
        .send(
            "input.performActions",
            json!({
                "context": context,
                "actions": [{
                    "type": "key",
                    "id": "keyboard",
                    "actions": actions,
                }],
            }),
        )
        .await?;
    Ok(())
}

fn pointer_move(x: i64, y: i64) -> Value {
    json!({ "type": "pointerMove", "x": x, "y": y, "duration": 0 })
}

fn pointer_down() -> Value {
    json!({ "type": "pointerDown", "button": 0 })
}

fn pointer_up() -> Value {
    json!({ "type": "pointerUp", "button": 0 })
}

fn key_down(key: char) -> Value {
    json!({ "type": "keyDown", "value": key.to_string() })
}

fn key_up(key: char) -> Value {
    json!({ "type": "keyUp", "value": key.to_string() })
}

fn local_string(s: &str) -> Value {
    json!({ "type": "string", "value": s })
}

fn local_string_array(values: &[String]) -> Value {
    json!({
        "type": "array",
        "value": values.iter().map(|v| local_string(v)).collect::<Vec<_>>(),
    })
}

const SCROLL_INTO_VIEW_JS: &str =
    "(el) => el.scrollIntoView({ block: 'center', inline: 'center', behavior: 'instant' })";

const FOCUS_JS: &str = "(el) => el.focus()";

const FILL_JS: &str = r#"(el, text) => {
  el.focus();
  const tag = el.tagName;
  if (tag === 'INPUT' || tag === 'TEXTAREA') {
    const proto = tag === 'TEXTAREA' ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
    const desc = Object.getOwnPropertyDescriptor(proto, 'value');
    if (desc && desc.set) { desc.set.call(el, text); } else { el.value = text; }
  } else if (el.isContentEditable) {
    el.textContent = text;
  } else {
    throw new Error('element is not editable');
  }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
}"#;

const SELECT_JS: &str = r#"(el, values) => {
  if (el.tagName !== 'SELECT') throw new Error('select target must be a <select> element');
  let done = false;
  for (const opt of Array.from(el.options)) {
    const match = values.includes(opt.value) || values.includes(opt.label)
      || values.includes((opt.textContent || '').trim());
    if (el.multiple) {
      opt.selected = match;
    } else if (match && !done) {
      el.selectedIndex = opt.index;
      done = true;
    }
  }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return Array.from(el.selectedOptions).map((o) => o.value);
}"#;

// --- verbs ----------------------------------------------------------------

async fn click_resolved(
    ctx: &OpCtx,
    page: &Page,
    el: &mut ResolvedElement,
    verb: &str,
    clicks: usize,
) -> Result<Value> {
    let _ = call_element_json(ctx, page, el, SCROLL_INTO_VIEW_JS, Vec::new()).await;
    let rect = wait_actionable(ctx, page, el, verb, false).await?;
    let (x, y) = rect.centroid();

    let mut actions = vec![pointer_move(x, y)];
    for _ in 0..clicks {
        actions.push(pointer_down());
        actions.push(pointer_up());
    }
    perform_pointer(ctx, page.context(), "mouse", actions).await?;
    Ok(Value::Null)
}

pub(crate) async fn click(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    click_resolved(ctx, &page, &mut el, "click", 1).await
}

pub(crate) async fn dblclick(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    click_resolved(ctx, &page, &mut el, "dblclick", 2).await
}

pub(crate) async fn hover(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    let _ = call_element_json(ctx, &page, &mut el, SCROLL_INTO_VIEW_JS, Vec::new()).await;
    let rect = wait_actionable(ctx, &page, &mut el, "hover", false).await?;
    let (x, y) = rect.centroid();
    perform_pointer(ctx, page.context(), "mouse", vec![pointer_move(x, y)]).await?;
    Ok(Value::Null)
}

pub(crate) async fn tap(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    let _ = call_element_json(ctx, &page, &mut el, SCROLL_INTO_VIEW_JS, Vec::new()).await;
    let rect = wait_actionable(ctx, &page, &mut el, "tap", false).await?;
    let (x, y) = rect.centroid();
    perform_pointer(
        ctx,
        page.context(),
        "touch",
        vec![pointer_move(x, y), pointer_down(), pointer_up()],
    )
    .await?;
    Ok(Value::Null)
}

/// Expand text into per-codepoint keyDown/keyUp pairs.
pub(crate) async fn type_text(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetTextParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    wait_actionable(ctx, &page, &mut el, "type", true).await?;
    call_element_json(ctx, &page, &mut el, FOCUS_JS, Vec::new()).await?;

    let mut actions = Vec::with_capacity(p.text.chars().count() * 2);
    for c in p.text.chars() {
        actions.push(key_down(c));
        actions.push(key_up(c));
    }
    perform_keys(ctx, page.context(), actions).await?;
    Ok(Value::Null)
}

/// Replace the element's value in one step.
pub(crate) async fn fill(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetTextParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    wait_actionable(ctx, &page, &mut el, "fill", true).await?;
    call_element_json(ctx, &page, &mut el, FILL_JS, vec![local_string(&p.text)]).await?;
    Ok(Value::Null)
}

pub(crate) async fn clear(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    wait_actionable(ctx, &page, &mut el, "clear", true).await?;
    call_element_json(ctx, &page, &mut el, FILL_JS, vec![local_string("")]).await?;
    Ok(Value::Null)
}

/// `A+B+C`: modifier downs, main key down/up, modifier ups in reverse.
pub(crate) async fn press(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: PressParams = params(args)?;
    let page = ctx.live.active_page()?;

    if let Some(ref target) = p.target {
        let mut el = find::resolve_target(ctx, &page, target).await?;
        wait_actionable(ctx, &page, &mut el, "press", true).await?;
        call_element_json(ctx, &page, &mut el, FOCUS_JS, Vec::new()).await?;
    }

    let (modifiers, main) = keys::parse_chord(&p.keys)?;
    perform_keys(ctx, page.context(), chord_actions(&modifiers, main)).await?;
    Ok(Value::Null)
}

fn chord_actions(modifiers: &[char], main: char) -> Vec<Value> {
    let mut actions = Vec::with_capacity(modifiers.len() * 2 + 2);
    for m in modifiers {
        actions.push(key_down(*m));
    }
    actions.push(key_down(main));
    actions.push(key_up(main));
    for m in modifiers.iter().rev() {
        actions.push(key_up(*m));
    }
    actions
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeysParams {
    /// Whitespace separated chords, e.g. `"Control+a Delete"`.
    pub keys: String,
}

pub(crate) async fn key_sequence(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: KeysParams = params(args)?;
    let page = ctx.live.active_page()?;

    let mut actions = Vec::new();
    for chord in p.keys.split_whitespace() {
        let (modifiers, main) = keys::parse_chord(chord)?;
        actions.extend(chord_actions(&modifiers, main));
    }
    if actions.is_empty() {
        return Err(EngineError::invalid("keys requires at least one chord"));
    }
    perform_keys(ctx, page.context(), actions).await?;
    Ok(Value::Null)
}

async fn set_checked(ctx: &OpCtx, args: Value, desired: bool, verb: &str) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    let current = call_element_json(ctx, &page, &mut el, "(el) => !!el.checked", Vec::new()).await?;
    if current.as_bool() == Some(desired) {
        return Ok(Value::Null);
    }
    click_resolved(ctx, &page, &mut el, verb, 1).await
}

pub(crate) async fn check(ctx: &OpCtx, args: Value) -> Result<Value> {
    set_checked(ctx, args, true, "check").await
}

pub(crate) async fn uncheck(ctx: &OpCtx, args: Value) -> Result<Value> {
    set_checked(ctx, args, false, "uncheck").await
}

pub(crate) async fn select_option(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: SelectParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    wait_actionable(ctx, &page, &mut el, "select", false).await?;
    call_element_json(
        ctx,
        &page,
        &mut el,
        SELECT_JS,
        vec![local_string_array(&p.values)],
    )
    .await
}

pub(crate) async fn drag_to(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: DragParams = params(args)?;
    let page = ctx.live.active_page()?;
    let mut source = find::resolve_target(ctx, &page, &p.source).await?;
    let mut target = find::resolve_target(ctx, &page, &p.target).await?;

    let _ = call_element_json(ctx, &page, &mut source, SCROLL_INTO_VIEW_JS, Vec::new()).await;
    let from = wait_actionable(ctx, &page, &mut source, "drag", false).await?;
    let to = wait_actionable(ctx, &page, &mut target, "drag", false).await?;
    let (fx, fy) = from.centroid();
    let (tx, ty) = to.centroid();

    perform_pointer(
        ctx,
        page.context(),
        "mouse",
        vec![
            pointer_move(fx, fy),
            pointer_down(),
            pointer_move((fx + tx) / 2, (fy + ty) / 2),
            pointer_move(tx, ty),
            pointer_up(),
        ],
    )
    .await?;
    Ok(Value::Null)
}

pub(crate) async fn scroll_into_view(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(ctx, &page, &mut el, SCROLL_INTO_VIEW_JS, Vec::new()).await?;
    Ok(Value::Null)
}

pub(crate) async fn dispatch_event(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: DispatchEventParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(
        ctx,
        &page,
        &mut el,
        "(el, type) => el.dispatchEvent(new Event(type, { bubbles: true, cancelable: true }))",
        vec![local_string(&p.event)],
    )
    .await?;
    Ok(Value::Null)
}

/// `input[type=file]` is frequently hidden behind a styled wrapper, so this
/// verb deliberately skips the visibility check.
pub(crate) async fn set_files(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: SetFilesParams = params(args)?;
    let (page, el) = resolve(ctx, &p.target).await?;
    ctx.live
        .send(
            "input.setFiles",
            json!({
                "context": page.context(),
                "element": { "sharedId": el.shared_id },
                "files": p.files,
            }),
        )
        .await?;
    Ok(Value::Null)
}

// --- getters --------------------------------------------------------------

/// Visibility never waits: a missing element is simply not visible.
pub(crate) async fn is_visible(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let page = ctx.live.active_page()?;

    let shared_id = if crate::handles::is_token(&p.target) {
        match page.handles.lookup(&p.target) {
            Ok((entry, _)) => entry.shared_id,
            Err(_) => None,
        }
    } else {
        let spec = find::FindParams::from_selector(&p.target).spec()?;
        let result = ctx
            .live
            .call_function(page.context(), &js::finder_source(&spec), json!([]), false, "none")
            .await?;
        crate::values::shared_ids_of_array(&result)?.into_iter().next()
    };

    let Some(shared_id) = shared_id else {
        return Ok(json!(false));
    };
    let mut el = ResolvedElement {
        shared_id,
        token: None,
    };
    match probe(ctx, &page, &mut el).await {
        Ok(state) => Ok(json!(state.attached && state.visible)),
        Err(err) if find::is_no_such_node(&err) => Ok(json!(false)),
        Err(err) => Err(err),
    }
}

pub(crate) async fn attr(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: AttrParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(
        ctx,
        &page,
        &mut el,
        "(el, name) => el.getAttribute(name)",
        vec![local_string(&p.name)],
    )
    .await
}

pub(crate) async fn value(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(ctx, &page, &mut el, "(el) => el.value", Vec::new()).await
}

pub(crate) async fn text(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(
        ctx,
        &page,
        &mut el,
        "(el) => el.innerText !== undefined ? el.innerText : el.textContent",
        Vec::new(),
    )
    .await
}

pub(crate) async fn html(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TargetParams = params(args)?;
    let (page, mut el) = resolve(ctx, &p.target).await?;
    call_element_json(ctx, &page, &mut el, "(el) => el.outerHTML", Vec::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chord_actions_unwind_modifiers_in_reverse() {
        let actions = chord_actions(&['\u{E009}', '\u{E008}'], 'a');
        let kinds: Vec<(String, String)> = actions
            .iter()
            .map(|a| {
                (
                    a["type"].as_str().unwrap().to_string(),
                    a["value"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(kinds[0], ("keyDown".into(), "\u{E009}".into()));
        assert_eq!(kinds[1], ("keyDown".into(), "\u{E008}".into()));
        assert_eq!(kinds[2], ("keyDown".into(), "a".into()));
        assert_eq!(kinds[3], ("keyUp".into(), "a".into()));
        assert_eq!(kinds[4], ("keyUp".into(), "\u{E008}".into()));
        assert_eq!(kinds[5], ("keyUp".into(), "\u{E009}".into()));
    }

    #[test]
    fn rect_stability_uses_a_half_pixel_band() {
        let a = Rect {
            x: 10.0,
            y: 10.0,
            width: 100.0,
            height: 20.0,
        };
        let b = Rect { x: 10.3, ..a };
        let c = Rect { x: 11.0, ..a };
        assert!(a.roughly_equals(&b));
        assert!(!a.roughly_equals(&c));
    }

    #[test]
    fn unknown_action_params_are_rejected() {
        assert!(params::<TargetParams>(json!({ "target": "#x", "force": true })).is_err());
    }
}
