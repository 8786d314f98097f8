use clap::{Args, Subcommand};
use serde_json::{json, Map, Value};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// MCP server over stdio, bridged to the daemon socket.
    Mcp {
        /// Only attach to an already running daemon, never start one.
        #[arg(long)]
        connect: bool,
    },
    /// HTTP bridge to the daemon socket.
    Http {
        #[arg(long, default_value_t = 9223)]
        port: u16,
    },
    /// Point the daemon at a remote BiDi endpoint.
    Connect { url: String },
    /// Drop the remote endpoint association (stops the daemon).
    Disconnect,

    /// Navigate the active tab.
    Go { url: String },
    Back,
    Forward,
    Reload,
    /// Print the current URL.
    Url,
    /// Print the document title.
    Title,
    /// Print the full page HTML.
    Content,

    /// Find the first matching element and record it as @e1.
    Find(SelectorArgs),
    /// Find every matching element, recording @e1..@eN.
    FindAll(SelectorArgs),
    /// Find by ARIA role, optionally filtered by accessible name.
    FindByRole {
        role: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Survey matching elements (alias of find-all).
    Map(SelectorArgs),

    /// Click an element (selector or @eN ref).
    Click { target: String },
    /// Type text into an element, one key event per character.
    Type { target: String, text: String },
    /// Replace an element's value in one step.
    Fill { target: String, text: String },
    /// Press a key or combo, e.g. Enter or Control+a.
    Press { keys: String },
    /// Press a whitespace-separated sequence of keys/combos.
    Keys { keys: String },
    Check { target: String },
    Uncheck { target: String },
    /// Select option(s) of a <select> by value or label.
    Select {
        target: String,
        values: Vec<String>,
    },
    Hover { target: String },
    ScrollIntoView { target: String },

    /// Wait for the load event.
    WaitForLoad,
    /// Wait until the URL matches a glob pattern.
    WaitForUrl { pattern: String },
    /// Sleep for the given number of milliseconds.
    Sleep { ms: u64 },

    IsVisible { target: String },
    /// Print an attribute value.
    Attr { target: String, name: String },
    /// Print an input's value.
    Value { target: String },
    /// Print the element's inner text.
    Text { target: String },
    /// Print the element's outer HTML.
    Html { target: String },

    /// Evaluate a JavaScript expression in the page.
    Eval { expr: String },
    /// Capture a screenshot.
    Screenshot {
        #[arg(long)]
        full_page: bool,
        #[arg(long)]
        path: Option<String>,
    },
    /// Print the accessibility tree.
    A11yTree {
        #[arg(long)]
        root: Option<String>,
        /// Include nodes the default filter hides.
        #[arg(long)]
        everything: bool,
    },

    /// List open tabs.
    Tabs,
    /// Open a new tab.
    TabNew { url: Option<String> },
    /// Switch to a tab by index or context id.
    TabSwitch { tab: String },
    /// Close a tab (the active one by default).
    TabClose { tab: Option<String> },
    /// Resize the browser window.
    SetWindow { width: u32, height: u32 },

    /// Close the browser and reset the session.
    Quit,
}

#[derive(Debug, Args)]
pub struct SelectorArgs {
    /// CSS selector (or XPath when it starts with `/`).
    pub selector: Option<String>,
    #[arg(long)]
    pub role: Option<String>,
    #[arg(long)]
    pub text: Option<String>,
    /// Accessible name (aria-label, aria-labelledby, <label for>).
    #[arg(long)]
    pub label: Option<String>,
    #[arg(long)]
    pub placeholder: Option<String>,
    #[arg(long)]
    pub alt: Option<String>,
    #[arg(long)]
    pub title: Option<String>,
    /// data-testid value.
    #[arg(long)]
    pub testid: Option<String>,
    #[arg(long)]
    pub xpath: Option<String>,
    /// CSS selector of an element the match must be near.
    #[arg(long)]
    pub near: Option<String>,
}

impl SelectorArgs {
    fn into_args(self) -> Value {
        let mut args = Map::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                args.insert(key.to_string(), json!(v));
            }
        };
        put("selector", self.selector);
        put("role", self.role);
        put("text", self.text);
        put("label", self.label);
        put("placeholder", self.placeholder);
        put("alt", self.alt);
        put("title", self.title);
        put("testid", self.testid);
        put("xpath", self.xpath);
        put("near", self.near);
        Value::Object(args)
    }
}

#[derive(Debug, Subcommand)]
pub enum DaemonAction {
    /// Run the daemon in the foreground.
    Start {
        /// Attach to a remote BiDi endpoint instead of launching a browser.
        #[arg(long)]
        connect_url: Option<String>,
    },
    Stop,
    Status,
    Restart,
}

/// What a parsed subcommand asks the binary to do.
#[derive(Debug)]
pub enum Invocation {
    Daemon(DaemonAction),
    Mcp { connect: bool },
    Http { port: u16 },
    Connect { url: String },
    Disconnect,
    /// A Command-Engine tool call.
    Tool { name: &'static str, args: Value },
}

impl Commands {
    pub fn into_invocation(self) -> Invocation {
        use Commands::*;

        let tool = |name: &'static str, args: serde_json::Value| Invocation::Tool { name, args };
        match self {
            Daemon { action } => Invocation::Daemon(action),
            Mcp { connect } => Invocation::Mcp { connect },
            Http { port } => Invocation::Http { port },
            Connect { url } => Invocation::Connect { url },
            Disconnect => Invocation::Disconnect,

            Go { url } => tool("go", json!({ "url": url })),
            Back => tool("back", json!({})),
            Forward => tool("forward", json!({})),
            Reload => tool("reload", json!({})),
            Url => tool("url", json!({})),
            Title => tool("title", json!({})),
            Content => tool("content", json!({})),

            Find(selector) => tool("find", selector.into_args()),
            FindAll(selector) => tool("find-all", selector.into_args()),
            FindByRole { role, name } => {
                let mut args = json!({ "role": role });
                if let Some(name) = name {
                    args["name"] = json!(name);
                }
                tool("find-by-role", args)
            }
            Map(selector) => tool("map", selector.into_args()),

            Click { target } => tool("click", json!({ "target": target })),
            Type { target, text } => tool("type", json!({ "target": target, "text": text })),
            Fill { target, text } => tool("fill", json!({ "target": target, "text": text })),
            Press { keys } => tool("press", json!({ "keys": keys })),
            Keys { keys } => tool("keys", json!({ "keys": keys })),
            Check { target } => tool("check", json!({ "target": target })),
            Uncheck { target } => tool("uncheck", json!({ "target": target })),
            Select { target, values } => {
                tool("select", json!({ "target": target, "values": values }))
            }
            Hover { target } => tool("hover", json!({ "target": target })),
            ScrollIntoView { target } => tool("scroll-into-view", json!({ "target": target })),

            WaitForLoad => tool("wait-for-load", json!({})),
            WaitForUrl { pattern } => tool("wait-for-url", json!({ "pattern": pattern })),
            Sleep { ms } => tool("sleep", json!({ "ms": ms })),

            IsVisible { target } => tool("is-visible", json!({ "target": target })),
            Attr { target, name } => tool("attr", json!({ "target": target, "name": name })),
            Value { target } => tool("value", json!({ "target": target })),
            Text { target } => tool("text", json!({ "target": target })),
            Html { target } => tool("html", json!({ "target": target })),

            Eval { expr } => tool("eval", json!({ "expr": expr })),
            Screenshot { full_page, path } => {
                let mut args = json!({ "fullPage": full_page });
                if let Some(path) = path {
                    args["path"] = json!(path);
                }
                tool("screenshot", args)
            }
            A11yTree { root, everything } => {
                let mut args = json!({ "everything": everything });
                if let Some(root) = root {
                    args["root"] = json!(root);
                }
                tool("a11y-tree", args)
            }

            Tabs => tool("tabs", json!({})),
            TabNew { url } => {
                let mut args = json!({});
                if let Some(url) = url {
                    args["url"] = json!(url);
                }
                tool("tab-new", args)
            }
            TabSwitch { tab } => {
                let tab = match tab.parse::<u64>() {
                    Ok(index) => json!(index),
                    Err(_) => json!(tab),
                };
                tool("tab-switch", json!({ "tab": tab }))
            }
            TabClose { tab } => {
                let mut args = json!({});
                if let Some(tab) = tab {
                    args["tab"] = match tab.parse::<u64>() {
                        Ok(index) => json!(index),
                        Err(_) => json!(tab),
                    };
                }
                tool("tab-close", args)
            }
            SetWindow { width, height } => {
                tool("set-window", json!({ "width": width, "height": height }))
            }

            Quit => tool("quit", json!({})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_flags_become_semantic_args() {
        let args = SelectorArgs {
            selector: Some("a".into()),
            role: Some("link".into()),
            text: None,
            label: None,
            placeholder: None,
            alt: None,
            title: None,
            testid: None,
            xpath: None,
            near: None,
        }
        .into_args();
        assert_eq!(args, json!({ "selector": "a", "role": "link" }));
    }

    #[test]
    fn tab_switch_prefers_numeric_indexes() {
        let invocation = Commands::TabSwitch { tab: "2".into() }.into_invocation();
        match invocation {
            Invocation::Tool { name, args } => {
                assert_eq!(name, "tab-switch");
                assert_eq!(args["tab"], json!(2));
            }
            other => panic!("unexpected invocation {other:?}"),
        }
    }
}
