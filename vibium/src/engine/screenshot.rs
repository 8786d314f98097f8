//! Screenshots and PDF export.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::{EngineError, Result};

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScreenshotParams {
    #[serde(default, rename = "fullPage", alias = "full_page")]
    pub full_page: bool,
    #[serde(default)]
    pub clip: Option<Clip>,
    /// Explicit output file; otherwise the configured screenshot dir is
    /// used when present.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Clip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

pub(crate) async fn screenshot(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: ScreenshotParams = params(args)?;
    let page = ctx.live.active_page()?;

    let mut cmd = json!({
        "context": page.context(),
        "origin": if p.full_page { "document" } else { "viewport" },
        "format": { "type": "image/png" },
    });
    if let Some(clip) = p.clip {
        cmd["clip"] = json!({
            "type": "box",
            "x": clip.x,
            "y": clip.y,
            "width": clip.width,
            "height": clip.height,
        });
    }

    let captured = ctx
        .live
        .send_with_timeout("browsingContext.captureScreenshot", cmd, ctx.timeout)
        .await?;
    let data = captured
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::protocol("captureScreenshot returned no data"))?;

    match output_path(ctx, p.path, "png") {
        Some(path) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|err| EngineError::protocol(format!("invalid screenshot payload: {err}")))?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await?;
            Ok(json!({ "path": path }))
        }
        None => Ok(json!({ "data": data })),
    }
}

/// PDF export requires a headless browser.
pub(crate) async fn pdf(ctx: &OpCtx) -> Result<Value> {
    if !ctx.live.config().headless {
        return Err(EngineError::NotSupported {
            what: "pdf in headful mode".to_string(),
        });
    }
    let page = ctx.live.active_page()?;
    let printed = ctx
        .live
        .send_with_timeout(
            "browsingContext.print",
            json!({ "context": page.context() }),
            ctx.timeout,
        )
        .await?;
    let data = printed
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::protocol("print returned no data"))?;

    match output_path(ctx, None, "pdf") {
        Some(path) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|err| EngineError::protocol(format!("invalid pdf payload: {err}")))?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, bytes).await?;
            Ok(json!({ "path": path }))
        }
        None => Ok(json!({ "data": data })),
    }
}

fn output_path(ctx: &OpCtx, explicit: Option<PathBuf>, ext: &str) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }
    let dir = ctx.live.config().screenshot_dir.clone()?;
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Some(dir.join(format!("vibium-{stamp}.{ext}")))
}
