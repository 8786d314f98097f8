//! Virtual clock control.
//!
//! The shim itself lives in the page ([`crate::js::clock_shim_source`]); the
//! engine mirrors the virtual time where it is well defined so the preload
//! script reinstalled after a navigation carries the frozen time forward.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{params, OpCtx};
use crate::error::{EngineError, Result};
use crate::js;
use crate::session::ClockState;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InstallParams {
    /// Epoch milliseconds or an RFC 3339 timestamp.
    #[serde(default)]
    pub time: Option<Value>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvanceParams {
    pub ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeParams {
    pub time: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimezoneParams {
    pub timezone: String,
}

fn parse_time(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| EngineError::invalid("time must be integral epoch milliseconds")),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|err| EngineError::invalid(format!("unparseable time {s:?}: {err}"))),
        _ => Err(EngineError::invalid(
            "time must be epoch milliseconds or an RFC 3339 string",
        )),
    }
}

fn shim_config(state: &ClockState) -> Value {
    let mut config = serde_json::Map::new();
    if let Some(time) = state.time {
        config.insert("time".into(), json!(time));
    }
    if let Some(ref tz) = state.timezone {
        config.insert("tz".into(), json!(tz));
    }
    Value::Object(config)
}

/// Reinstall the preload with the current mirrored state so navigations keep
/// the virtual time.
async fn sync_preload(ctx: &OpCtx, state: &mut ClockState) -> Result<()> {
    if let Some(old) = state.preload_id.take() {
        if let Err(err) = ctx
            .live
            .send("script.removePreloadScript", json!({ "script": old }))
            .await
        {
            tracing::debug!("removing clock preload failed: {err}");
        }
    }
    let added = ctx
        .live
        .send(
            "script.addPreloadScript",
            json!({ "functionDeclaration": js::clock_shim_source(&shim_config(state)) }),
        )
        .await?;
    state.preload_id = added
        .get("script")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(())
}

/// Run a shim method in the current page.
async fn call_shim(ctx: &OpCtx, call: &str) -> Result<Value> {
    let page = ctx.live.active_page()?;
    ctx.live
        .eval_json(
            page.context(),
            &format!("() => globalThis.__vibium_clock__.{call}"),
            json!([]),
        )
        .await
}

async fn ensure_installed(ctx: &OpCtx) -> Result<()> {
    let installed = ctx.live.clock.lock().await.installed;
    if installed {
        // the shim self-reinstalls via preload; make sure this document has
        // it in case it predates the install
        let state = ctx.live.clock.lock().await.clone();
        let page = ctx.live.active_page()?;
        let _ = ctx
            .live
            .call_function(
                page.context(),
                &js::clock_shim_source(&shim_config(&state)),
                json!([]),
                false,
                "none",
            )
            .await;
        Ok(())
    } else {
        Err(EngineError::invalid(
            "clock is not installed; call clock-install first",
        ))
    }
}

pub(crate) async fn install(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: InstallParams = params(args)?;
    let time = p.time.as_ref().map(parse_time).transpose()?;

    let mut state = ctx.live.clock.lock().await;
    state.installed = true;
    state.time = time;
    state.timezone = p.timezone;
    sync_preload(ctx, &mut state).await?;

    // apply to the current document as well
    let page = ctx.live.active_page()?;
    ctx.live
        .call_function(
            page.context(),
            &js::clock_shim_source(&shim_config(&state)),
            json!([]),
            false,
            "none",
        )
        .await?;

    Ok(json!({ "installed": true, "time": state.time, "timezone": state.timezone }))
}

/// Advance virtual time, firing due timers once.
pub(crate) async fn fast_forward(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: AdvanceParams = params(args)?;
    ensure_installed(ctx).await?;
    call_shim(ctx, &format!("fastForward({})", p.ms)).await?;

    let mut state = ctx.live.clock.lock().await;
    if let Some(time) = state.time.as_mut() {
        *time += p.ms;
    }
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "time": state.time }))
}

/// Advance in small steps, firing every timer including ones scheduled
/// while stepping.
pub(crate) async fn run_for(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: AdvanceParams = params(args)?;
    ensure_installed(ctx).await?;
    call_shim(ctx, &format!("runFor({})", p.ms)).await?;

    let mut state = ctx.live.clock.lock().await;
    if let Some(time) = state.time.as_mut() {
        *time += p.ms;
    }
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "time": state.time }))
}

pub(crate) async fn pause_at(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TimeParams = params(args)?;
    let time = parse_time(&p.time)?;
    ensure_installed(ctx).await?;
    call_shim(ctx, &format!("pauseAt({time})")).await?;

    let mut state = ctx.live.clock.lock().await;
    state.time = Some(time);
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "time": time }))
}

/// Let virtual time follow the wall clock from its current value.
pub(crate) async fn resume(ctx: &OpCtx) -> Result<Value> {
    ensure_installed(ctx).await?;
    call_shim(ctx, "resume()").await?;

    let mut state = ctx.live.clock.lock().await;
    // from here on the virtual value tracks the wall clock and is no longer
    // mirrorable
    state.time = None;
    sync_preload(ctx, &mut state).await?;
    Ok(Value::Null)
}

pub(crate) async fn set_fixed_time(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TimeParams = params(args)?;
    let time = parse_time(&p.time)?;
    ensure_installed(ctx).await?;
    call_shim(ctx, &format!("setFixedTime({time})")).await?;

    let mut state = ctx.live.clock.lock().await;
    state.time = Some(time);
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "time": time }))
}

/// Move `Date.now` without firing timers.
pub(crate) async fn set_system_time(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TimeParams = params(args)?;
    let time = parse_time(&p.time)?;
    ensure_installed(ctx).await?;
    call_shim(ctx, &format!("setSystemTime({time})")).await?;

    let mut state = ctx.live.clock.lock().await;
    state.time = Some(time);
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "time": time }))
}

pub(crate) async fn set_timezone(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: TimezoneParams = params(args)?;
    ensure_installed(ctx).await?;
    let tz = serde_json::to_string(&p.timezone)?;
    call_shim(ctx, &format!("setTimezone({tz})")).await?;

    let mut state = ctx.live.clock.lock().await;
    state.timezone = Some(p.timezone.clone());
    sync_preload(ctx, &mut state).await?;
    Ok(json!({ "timezone": p.timezone }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn times_parse_from_epoch_and_rfc3339() {
        assert_eq!(parse_time(&json!(1735689600000i64)).unwrap(), 1735689600000);
        assert_eq!(
            parse_time(&json!("2025-01-01T00:00:00Z")).unwrap(),
            1735689600000
        );
        assert!(parse_time(&json!("yesterday")).is_err());
        assert!(parse_time(&json!(true)).is_err());
    }
}
