use clap::Parser;

use crate::options::sub_command::Commands;

/// Browser automation for agents, scripts and humans.
#[derive(Debug, Parser)]
#[command(name = "vibium", version, about, propagate_version = true)]
pub struct Cli {
    /// Emit a structured JSON envelope ({"ok":true,"result":…}).
    #[arg(long, global = true)]
    pub json: bool,

    /// Skip the daemon and run against a freshly launched in-process
    /// browser.
    #[arg(long, global = true)]
    pub oneshot: bool,

    /// Run the browser headless (the default).
    #[arg(long, global = true)]
    pub headless: bool,

    /// Run the browser with a visible window.
    #[arg(long, global = true, conflicts_with = "headless")]
    pub headed: bool,

    /// Per-command timeout in milliseconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Log progress to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}
