//! Accessibility tree snapshots.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::Result;
use crate::js;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct A11yTreeParams {
    /// CSS selector scoping the snapshot; defaults to the whole body.
    #[serde(default)]
    pub root: Option<String>,
    /// Include nodes the default filter would hide (role "generic" with an
    /// empty name and value).
    #[serde(default)]
    pub everything: bool,
}

pub(crate) async fn tree(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: A11yTreeParams = params(args)?;
    let page = ctx.live.active_page()?;

    let root = match p.root {
        Some(sel) => json!({ "type": "string", "value": sel }),
        None => json!({ "type": "null" }),
    };
    let everything = json!({ "type": "boolean", "value": p.everything });

    ctx.live
        .eval_json(page.context(), js::A11Y_TREE, json!([root, everything]))
        .await
}
