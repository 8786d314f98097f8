//! A single top-level browsing context and the per page state scoped to it.

use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::glob::UrlPattern;
use crate::handles::HandleRegistry;

/// What an intercepted request matching a route should do.
///
/// The daemon surface is JSON-RPC, so handlers are declarative actions
/// recorded with the pattern rather than callbacks. A route without an
/// action continues the request untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Fulfill {
        #[serde(default = "default_status")]
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body: String,
    },
    Continue {
        #[serde(default)]
        headers: Option<Vec<(String, String)>>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
}

fn default_status() -> u16 {
    200
}

/// A pattern-bound interceptor; first match in insertion order wins.
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: UrlPattern,
    pub action: RouteAction,
}

/// How a registered dialog handler resolves user prompts on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogAction {
    Accept {
        #[serde(default)]
        text: Option<String>,
    },
    Dismiss,
}

/// One top-level browsing context.
///
/// Ownership is a tree: the session owns its pages, a page owns its handle
/// registry and route list. Anything pointing back at a page does so through
/// the context id, never an owning pointer.
#[derive(Debug)]
pub struct Page {
    context: String,
    /// Last URL observed through navigation events.
    url: RwLock<String>,
    pub(crate) handles: HandleRegistry,
    pub(crate) routes: Mutex<Vec<Route>>,
    pub(crate) dialog_action: Mutex<Option<DialogAction>>,
}

impl Page {
    pub fn new(context: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            url: RwLock::new(url.into()),
            handles: HandleRegistry::default(),
            routes: Mutex::new(Vec::new()),
            dialog_action: Mutex::new(None),
        }
    }

    /// The BiDi browsing context id.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// The URL as last observed; authoritative lookups evaluate in the page.
    pub fn url(&self) -> String {
        self.url.read().expect("page url poisoned").clone()
    }

    pub(crate) fn set_url(&self, url: impl Into<String>) {
        *self.url.write().expect("page url poisoned") = url.into();
    }

    /// First route matching the URL, in insertion order.
    pub(crate) fn match_route(&self, url: &str) -> Option<RouteAction> {
        let routes = self.routes.lock().expect("routes poisoned");
        routes
            .iter()
            .find(|route| route.pattern.matches(url))
            .map(|route| route.action.clone())
    }

    pub(crate) fn push_route(&self, route: Route) {
        self.routes.lock().expect("routes poisoned").push(route);
    }

    /// Remove routes with this exact pattern; returns how many remain.
    pub(crate) fn remove_routes(&self, pattern: &str) -> usize {
        let mut routes = self.routes.lock().expect("routes poisoned");
        routes.retain(|route| route.pattern.as_str() != pattern);
        routes.len()
    }

    pub(crate) fn route_count(&self) -> usize {
        self.routes.lock().expect("routes poisoned").len()
    }

    pub(crate) fn dialog_action(&self) -> Option<DialogAction> {
        self.dialog_action
            .lock()
            .expect("dialog action poisoned")
            .clone()
    }

    pub(crate) fn set_dialog_action(&self, action: Option<DialogAction>) {
        *self.dialog_action.lock().expect("dialog action poisoned") = action;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glob::UrlPattern;

    #[test]
    fn first_matching_route_wins() {
        let page = Page::new("ctx", "https://example.com/");
        page.push_route(Route {
            pattern: UrlPattern::parse("**/api/**").unwrap(),
            action: RouteAction::Abort { reason: None },
        });
        page.push_route(Route {
            pattern: UrlPattern::parse("**/api/users").unwrap(),
            action: RouteAction::Fulfill {
                status: 200,
                headers: vec![],
                body: "{}".into(),
            },
        });

        match page.match_route("https://example.com/api/users") {
            Some(RouteAction::Abort { .. }) => {}
            other => panic!("expected the earlier route to win, got {other:?}"),
        }
    }

    #[test]
    fn unroute_removes_by_pattern() {
        let page = Page::new("ctx", "https://example.com/");
        page.push_route(Route {
            pattern: UrlPattern::parse("**/a").unwrap(),
            action: RouteAction::Continue { headers: None },
        });
        page.push_route(Route {
            pattern: UrlPattern::parse("**/b").unwrap(),
            action: RouteAction::Continue { headers: None },
        });
        assert_eq!(page.remove_routes("**/a"), 1);
        assert!(page.match_route("https://x/a").is_none());
        assert!(page.match_route("https://x/b").is_some());
    }
}
