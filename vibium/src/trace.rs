//! Trace recording: an event log plus deduplicated screencast frames and
//! DOM snapshots, emitted as a zip with a fixed internal layout
//! (`trace.ndjson`, `resources/`, `snapshots/`, `screencast/`).

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use hashbrown::HashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use zip::write::FileOptions;

use crate::engine::{params, OpCtx};
use crate::error::{EngineError, Result};
use crate::js;
use crate::session::Live;

/// Screencast cadence ceiling.
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TraceOptions {
    #[serde(default)]
    pub screenshots: bool,
    #[serde(default)]
    pub snapshots: bool,
    #[serde(default)]
    pub sources: bool,
    #[serde(default)]
    pub bidi: bool,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug)]
struct TraceShared {
    started: Instant,
    events: StdMutex<Vec<Value>>,
    /// Deduplicated binary blobs keyed by their SHA-256.
    frames: StdMutex<HashMap<String, Vec<u8>>>,
    last_frame: StdMutex<Option<String>>,
}

impl TraceShared {
    fn push(&self, mut event: Value) {
        if let Some(obj) = event.as_object_mut() {
            obj.insert("ts".into(), json!(self.started.elapsed().as_millis() as u64));
        }
        self.events.lock().expect("trace events poisoned").push(event);
    }

    /// Store a frame, replacing identical consecutive frames by a reference
    /// to the first occurrence.
    fn push_frame(&self, bytes: Vec<u8>) {
        let sha = hex_sha(&bytes);
        let mut last = self.last_frame.lock().expect("trace frame poisoned");
        let repeated = last.as_deref() == Some(sha.as_str());
        *last = Some(sha.clone());
        drop(last);

        if !repeated {
            self.frames
                .lock()
                .expect("trace frames poisoned")
                .entry(sha.clone())
                .or_insert(bytes);
        }
        self.push(json!({
            "type": "screencast-frame",
            "ref": frame_name(&sha),
            "repeated": repeated,
        }));
    }
}

fn hex_sha(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn frame_name(sha: &str) -> String {
    format!("screencast/{}.png", &sha[..16])
}

/// A running trace.
#[derive(Debug)]
pub struct Tracer {
    name: String,
    options: TraceOptions,
    shared: Arc<TraceShared>,
    screencast: Option<tokio::task::JoinHandle<()>>,
    group_depth: usize,
}

impl Tracer {
    fn new(name: String, options: TraceOptions, live: Arc<Live>) -> Self {
        let shared = Arc::new(TraceShared {
            started: Instant::now(),
            events: StdMutex::new(Vec::new()),
            frames: StdMutex::new(HashMap::new()),
            last_frame: StdMutex::new(None),
        });
        shared.push(json!({ "type": "trace-start", "name": name }));

        let screencast = options.screenshots.then(|| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(FRAME_INTERVAL).await;
                    let Ok(page) = live.active_page() else { continue };
                    // capture through the raw client so the frames do not
                    // recursively show up in the bidi event log
                    let Ok(fut) = live.client().send(
                        "browsingContext.captureScreenshot",
                        json!({
                            "context": page.context(),
                            "origin": "viewport",
                            "format": { "type": "image/png" },
                        }),
                    ) else {
                        break;
                    };
                    match fut.await {
                        Ok(captured) => {
                            if let Some(data) = captured.get("data").and_then(Value::as_str) {
                                if let Ok(bytes) =
                                    base64::engine::general_purpose::STANDARD.decode(data)
                                {
                                    shared.push_frame(bytes);
                                }
                            }
                        }
                        Err(err) => {
                            tracing::debug!("screencast frame failed: {err}");
                        }
                    }
                }
            })
        });

        Self {
            name,
            options,
            shared,
            screencast,
            group_depth: 0,
        }
    }

    pub(crate) fn record_bidi_command(&mut self, method: &str, params: &Value) {
        if self.options.bidi {
            self.shared.push(json!({
                "type": "bidi",
                "dir": "send",
                "method": method,
                "params": params,
            }));
        }
    }

    pub(crate) fn record_bidi_event(&mut self, method: &str, params: &Value) {
        if self.options.bidi {
            self.shared.push(json!({
                "type": "bidi",
                "dir": "event",
                "method": method,
                "params": params,
            }));
        }
    }

    /// Stop the screencast task without emitting an archive.
    pub(crate) fn abort(&mut self) {
        if let Some(task) = self.screencast.take() {
            task.abort();
        }
    }
}

/// `tracing-start`.
pub(crate) async fn start(ctx: &OpCtx, args: Value) -> Result<Value> {
    let options: TraceOptions = params(args)?;

    // mirror page websocket traffic into the trace from here on
    if let Err(err) = ctx
        .live
        .send(
            "script.addPreloadScript",
            json!({ "functionDeclaration": js::WEBSOCKET_MIRROR }),
        )
        .await
    {
        tracing::debug!("websocket mirror preload rejected: {err}");
    }
    if let Ok(page) = ctx.live.active_page() {
        let _ = ctx
            .live
            .call_function(page.context(), js::WEBSOCKET_MIRROR, json!([]), false, "none")
            .await;
    }

    let mut guard = ctx.live.tracer.lock().await;
    if guard.is_some() {
        return Err(EngineError::invalid("tracing is already running"));
    }
    let name = options.name.clone().unwrap_or_else(|| "trace".to_string());
    *guard = Some(Tracer::new(name, options, Arc::clone(&ctx.live)));
    Ok(json!({ "tracing": true }))
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StopParams {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// `tracing-stop`: finish recording and emit the archive.
pub(crate) async fn stop(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: StopParams = params(args)?;
    let tracer = ctx
        .live
        .tracer
        .lock()
        .await
        .take()
        .ok_or_else(|| EngineError::invalid("tracing is not running"))?;
    finish(ctx, tracer, p.path).await
}

/// `tracing-stop-chunk`: emit the archive for everything recorded so far
/// and keep recording into a fresh chunk.
pub(crate) async fn stop_chunk(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: StopParams = params(args)?;
    let mut guard = ctx.live.tracer.lock().await;
    let tracer = guard
        .take()
        .ok_or_else(|| EngineError::invalid("tracing is not running"))?;
    let options = tracer.options.clone();
    let name = tracer.name.clone();
    *guard = Some(Tracer::new(name, options, Arc::clone(&ctx.live)));
    drop(guard);
    finish(ctx, tracer, p.path).await
}

async fn finish(ctx: &OpCtx, mut tracer: Tracer, path: Option<PathBuf>) -> Result<Value> {
    tracer.abort();

    let mut snapshots = Vec::new();
    if tracer.options.snapshots {
        for (index, page) in ctx.live.pages_snapshot().iter().enumerate() {
            match ctx
                .live
                .eval_json(page.context(), js::OUTER_HTML, json!([]))
                .await
            {
                Ok(Value::String(html)) => snapshots.push((format!("page-{index}.html"), html)),
                Ok(_) => {}
                Err(err) => tracing::debug!("snapshot failed: {err}"),
            }
        }
    }
    // drain the page-side websocket mirror into the event log
    if let Ok(page) = ctx.live.active_page() {
        if let Ok(Value::Array(frames)) = ctx
            .live
            .eval_json(
                page.context(),
                "() => globalThis.__vibium_ws_frames__ || []",
                json!([]),
            )
            .await
        {
            for frame in frames {
                tracer.shared.push(json!({ "type": "ws-frame", "frame": frame }));
            }
        }
    }
    tracer.shared.push(json!({ "type": "trace-end" }));

    let path = path.unwrap_or_else(|| {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = ctx
            .live
            .config()
            .screenshot_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        dir.join(format!("{}-{stamp}.zip", tracer.name))
    });

    let bytes = build_archive(&tracer, &snapshots)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(&path, bytes).await?;

    let events = tracer.shared.events.lock().expect("trace events poisoned").len();
    Ok(json!({ "path": path, "events": events }))
}

fn build_archive(tracer: &Tracer, snapshots: &[(String, String)]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        let zip_err = |err: zip::result::ZipError| EngineError::protocol(err.to_string());

        zip.start_file("trace.ndjson", options).map_err(zip_err)?;
        for event in tracer.shared.events.lock().expect("trace events poisoned").iter() {
            let line = serde_json::to_string(event)?;
            zip.write_all(line.as_bytes())?;
            zip.write_all(b"\n")?;
        }

        // resources/ holds non-frame blobs; frames live under screencast/
        zip.add_directory("resources/", options).map_err(zip_err)?;

        for (sha, bytes) in tracer.shared.frames.lock().expect("trace frames poisoned").iter() {
            zip.start_file(frame_name(sha), options).map_err(zip_err)?;
            zip.write_all(bytes)?;
        }

        for (name, html) in snapshots {
            zip.start_file(format!("snapshots/{name}"), options)
                .map_err(zip_err)?;
            zip.write_all(html.as_bytes())?;
        }

        zip.finish().map_err(zip_err)?;
    }
    Ok(cursor.into_inner())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupParams {
    pub name: String,
}

/// `tracing-start-group`: a labelled span nested in source order.
pub(crate) async fn start_group(ctx: &OpCtx, args: Value) -> Result<Value> {
    let p: GroupParams = params(args)?;
    let mut guard = ctx.live.tracer.lock().await;
    let tracer = guard
        .as_mut()
        .ok_or_else(|| EngineError::invalid("tracing is not running"))?;
    tracer.group_depth += 1;
    let depth = tracer.group_depth;
    tracer
        .shared
        .push(json!({ "type": "group-start", "name": p.name, "depth": depth }));
    Ok(Value::Null)
}

pub(crate) async fn stop_group(ctx: &OpCtx) -> Result<Value> {
    let mut guard = ctx.live.tracer.lock().await;
    let tracer = guard
        .as_mut()
        .ok_or_else(|| EngineError::invalid("tracing is not running"))?;
    if tracer.group_depth == 0 {
        return Err(EngineError::invalid("no open trace group"));
    }
    let depth = tracer.group_depth;
    tracer.group_depth -= 1;
    tracer.shared.push(json!({ "type": "group-end", "depth": depth }));
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_consecutive_frames_are_stored_once() {
        let shared = TraceShared {
            started: Instant::now(),
            events: StdMutex::new(Vec::new()),
            frames: StdMutex::new(HashMap::new()),
            last_frame: StdMutex::new(None),
        };
        shared.push_frame(vec![1, 2, 3]);
        shared.push_frame(vec![1, 2, 3]);
        shared.push_frame(vec![4, 5, 6]);

        assert_eq!(shared.frames.lock().unwrap().len(), 2);
        let events = shared.events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["repeated"], false);
        assert_eq!(events[1]["repeated"], true);
        assert_eq!(events[0]["ref"], events[1]["ref"]);
    }

    #[test]
    fn frame_names_use_the_sha_prefix() {
        let sha = hex_sha(b"png-bytes");
        let name = frame_name(&sha);
        assert!(name.starts_with("screencast/"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "screencast/".len() + 16 + ".png".len());
    }
}
