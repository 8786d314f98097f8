extern crate serde_json;
extern crate vibium;

pub mod options;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};

use vibium::configuration::Configuration;
use vibium::daemon::client::{ensure_daemon, DaemonClient};
use vibium::daemon::rpc::RpcError;
use vibium::daemon::{self, bridge};
use vibium::engine::Engine;
use vibium::session::Session;

use options::{Cli, DaemonAction, Invocation};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vibium=debug,vibium_bidi=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = Configuration::from_env();
    if cli.headless {
        config.headless = true;
    }
    if cli.headed {
        config.headless = false;
    }
    if cli.oneshot {
        config.oneshot = true;
    }
    if let Some(ms) = cli.timeout {
        config.default_timeout = Duration::from_millis(ms);
    }

    let json_output = cli.json;
    let outcome = run(cli, config).await;
    render(outcome, json_output)
}

/// Flags re-applied to an auto-started daemon so it matches the caller.
fn daemon_args(config: &Configuration) -> Vec<String> {
    let mut args = Vec::new();
    if !config.headless {
        args.push("--headed".to_string());
    }
    args
}

async fn run(cli: Cli, config: Configuration) -> Result<Value, RpcError> {
    match cli.command.into_invocation() {
        Invocation::Daemon(DaemonAction::Start { connect_url }) => {
            let mut config = config;
            if connect_url.is_some() {
                config.connect_url = connect_url;
            }
            daemon::run(config).await.map_err(engine_error)?;
            Ok(json!({ "stopped": true }))
        }
        Invocation::Daemon(DaemonAction::Stop) => {
            let mut client = DaemonClient::connect().await?;
            client.call("daemon/shutdown", json!({})).await
        }
        Invocation::Daemon(DaemonAction::Status) => match DaemonClient::connect().await {
            Ok(mut client) => client.call("daemon/status", json!({})).await,
            Err(_) => Ok(json!({ "running": false })),
        },
        Invocation::Daemon(DaemonAction::Restart) => {
            if let Ok(mut client) = DaemonClient::connect().await {
                let _ = client.call("daemon/shutdown", json!({})).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let mut client = ensure_daemon(&daemon_args(&config)).await?;
            client.call("daemon/status", json!({})).await
        }

        Invocation::Mcp { connect } => {
            if connect {
                // attach-only: never fork a daemon from under an MCP host
                DaemonClient::connect().await?;
            }
            bridge::stdio(&daemon_args(&config)).await.map_err(engine_error)?;
            Ok(Value::Null)
        }
        Invocation::Http { port } => {
            bridge::http(port, daemon_args(&config))
                .await
                .map_err(engine_error)?;
            Ok(Value::Null)
        }

        Invocation::Connect { url } => {
            if let Ok(mut client) = DaemonClient::connect().await {
                let _ = client.call("daemon/shutdown", json!({})).await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let mut args = daemon_args(&config);
            args.push("--connect-url".to_string());
            args.push(url);
            let mut client = ensure_daemon(&args).await?;
            client.call("daemon/status", json!({})).await
        }
        Invocation::Disconnect => match DaemonClient::connect().await {
            Ok(mut client) => client.call("daemon/shutdown", json!({})).await,
            Err(_) => Ok(json!({ "running": false })),
        },

        Invocation::Tool { name, mut args } => {
            if let (Some(obj), Some(ms)) = (args.as_object_mut(), cli.timeout) {
                obj.insert("timeout".to_string(), json!(ms));
            }
            if config.oneshot {
                let session = Arc::new(Session::new(config));
                let engine = Engine::new(Arc::clone(&session));
                let result = engine.dispatch(name, args).await.map_err(|err| engine_error(err));
                let _ = session.shutdown().await;
                result
            } else {
                let mut client = ensure_daemon(&daemon_args(&config)).await?;
                client.call_tool(name, args).await
            }
        }
    }
}

fn engine_error(err: vibium::EngineError) -> RpcError {
    RpcError {
        code: err.code(),
        message: err.to_string(),
        data: None,
    }
}

/// Print the outcome; exit 0 exactly when the call succeeded.
fn render(outcome: Result<Value, RpcError>, json_output: bool) -> ExitCode {
    match outcome {
        Ok(result) => {
            if json_output {
                println!("{}", json!({ "ok": true, "result": result }));
            } else {
                match &result {
                    Value::Null => println!("ok"),
                    Value::String(s) => println!("{s}"),
                    other => match serde_json::to_string_pretty(other) {
                        Ok(pretty) => println!("{pretty}"),
                        Err(_) => println!("{other}"),
                    },
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            if json_output {
                println!(
                    "{}",
                    json!({ "ok": false, "error": { "code": err.code, "message": err.message } })
                );
            } else {
                eprintln!("error ({}): {}", err.code, err.message);
            }
            ExitCode::FAILURE
        }
    }
}
