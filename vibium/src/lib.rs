//! Vibium browser control daemon.
//!
//! A long-lived process owning a single WebDriver BiDi connection to a
//! browser, multiplexing high-level automation commands issued concurrently
//! by short-lived CLI invocations, MCP transports and client libraries.
//!
//! The layers, bottom up:
//! - [`vibium_bidi`] speaks the protocol: one websocket, request/response
//!   correlation, event fan-out.
//! - [`session`] owns the browser lifecycle (launched or connected), the
//!   pages and crash recovery; [`router`] feeds BiDi events into it.
//! - [`engine`] implements the named operations (`find` with auto-wait,
//!   actionability-checked input verbs, interception, clock fakes, traces).
//! - [`daemon`] is the local-socket JSON-RPC transport plus the stdio and
//!   HTTP bridges.
//!
//! # Example (in-process, `--oneshot` style)
//! ```no_run
//! use std::sync::Arc;
//! use vibium::configuration::Configuration;
//! use vibium::engine::Engine;
//! use vibium::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Arc::new(Session::new(Configuration::from_env()));
//!     let engine = Engine::new(session);
//!     engine
//!         .dispatch("go", serde_json::json!({ "url": "https://example.com" }))
//!         .await?;
//!     let title = engine.dispatch("title", serde_json::json!({})).await?;
//!     println!("{title}");
//!     Ok(())
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod configuration;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod glob;
pub mod handles;
pub(crate) mod js;
pub mod page;
pub(crate) mod router;
pub mod session;
pub mod trace;
pub(crate) mod values;

pub use crate::configuration::Configuration;
pub use crate::engine::Engine;
pub use crate::error::{EngineError, Result};
pub use crate::session::Session;
