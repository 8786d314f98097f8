//! Dialog handling registration.
//!
//! The browser blocks the page on an open prompt, so agents must never be
//! able to leave one unacknowledged: without a registered action the router
//! dismisses prompts automatically (see [`crate::router`]).

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::Result;
use crate::page::DialogAction;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "lowercase")]
enum Mode {
    Accept,
    Dismiss,
    /// Return to the default auto-dismiss behavior.
    Auto,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnDialogParams {
    action: Mode,
    /// Prompt text supplied on accept.
    #[serde(default)]
    text: Option<String>,
}

pub(crate) async fn on_dialog(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: OnDialogParams = params(args)?;
    let page = ctx.live.active_page()?;

    let action = match p.action {
        Mode::Accept => Some(DialogAction::Accept { text: p.text }),
        Mode::Dismiss => Some(DialogAction::Dismiss),
        Mode::Auto => None,
    };
    page.set_dialog_action(action.clone());
    Ok(json!({ "handler": action.is_some() }))
}
