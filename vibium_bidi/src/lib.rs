//! A client for the [WebDriver BiDi](https://w3c.github.io/webdriver-bidi/)
//! protocol.
//!
//! This crate launches (or connects to) a BiDi capable browser supervisor
//! and multiplexes commands issued concurrently by many callers over the
//! single websocket: request/response correlation by call id, event fan-out
//! to registered listeners, keep-alive and liveness of the socket.
//!
//! # Example
//! ```no_run
//! use futures::StreamExt;
//! use vibium_bidi::{Browser, BrowserConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (mut browser, mut handler) =
//!         Browser::launch(BrowserConfig::default()).await?;
//!
//!     let handle = tokio::task::spawn(async move {
//!         while let Some(res) = handler.next().await {
//!             if res.is_err() {
//!                 break;
//!             }
//!         }
//!     });
//!
//!     browser
//!         .new_session(serde_json::json!({
//!             "alwaysMatch": { "acceptInsecureCerts": true }
//!         }))
//!         .await?;
//!     let client = browser.client();
//!     let tree = client
//!         .send("browsingContext.getTree", serde_json::json!({}))?
//!         .await?;
//!     println!("{tree}");
//!
//!     browser.close().await?;
//!     let _ = handle.await;
//!     Ok(())
//! }
//! ```
//!
//! Unlike the Chrome DevTools protocol there is no generated command layer:
//! BiDi methods are flat strings with JSON params, so [`BidiClient::send`]
//! takes the method name and a [`serde_json::Value`] and resolves to the raw
//! result payload.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod browser;
pub(crate) mod client;
pub(crate) mod cmd;
pub mod conn;
pub mod error;
pub mod handler;
pub(crate) mod job;
pub mod listeners;
pub mod types;

pub use crate::browser::{Browser, BrowserConfig, BrowserConfigBuilder};
pub use crate::client::{BidiClient, CommandFuture};
pub use crate::conn::{Connection, ConnectionConfig};
pub use crate::error::{BidiError, Result};
pub use crate::handler::{Handler, HandlerConfig};
pub use crate::listeners::EventStream;
pub use crate::types::{CallId, ErrorObject, EventMessage, Message, MethodId};
