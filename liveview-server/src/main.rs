//! # Liveview
//!
//! Live view programming server: tracks source files, re-executes them on
//! change, and streams their display instructions to browser viewers over
//! SSE. Viewer input (button clicks, posted values) is relayed back to the
//! running worker process.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use liveview_core::{Dispatcher, HandlerRegistry, LineParser, Source, source};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use liveview_server::broker::EventBroker;
use liveview_server::routes::{self, AppState};
use liveview_server::targets;
use liveview_server::watch::{SourceWatcher, WatcherConfig};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "liveview")]
#[command(about = "Watches source files, re-runs them on change, and streams their output to the browser")]
struct Cli {
    /// Source files or glob patterns to track
    sources: Vec<String>,

    /// Shell command template for running a source; `${path}` is substituted,
    /// otherwise the path is appended
    #[arg(long, env = "LIVEVIEW_CMD", default_value = "java --enable-preview")]
    cmd: String,

    /// Also load sources from ./sources.json
    #[arg(short, long)]
    config: bool,

    /// Server port
    #[arg(short, long, env = "LIVEVIEW_PORT", default_value_t = 50001)]
    port: u16,

    /// Only re-run sources whose file name matches this glob
    #[arg(short = 'w', long)]
    watch_filter: Option<String>,

    /// Log level when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log: String,
}

const CONFIG_PATH: &str = "./sources.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    if cli.port == 0 {
        anyhow::bail!("invalid port: 0");
    }

    let sources = resolve_sources(&cli)?;
    if sources.is_empty() {
        anyhow::bail!("no sources to track; pass files, glob patterns, or --config");
    }
    info!(count = sources.len(), "sources resolved");

    let watch_filter = cli
        .watch_filter
        .as_deref()
        .map(glob::Pattern::new)
        .transpose()
        .context("invalid --watch-filter pattern")?;

    let broker = Arc::new(EventBroker::new(cli.port));
    let mut registry = HandlerRegistry::new();
    targets::register_builtin_handlers(&mut registry, &broker);
    let dispatcher = Dispatcher::new(Arc::new(registry));

    let watcher = Arc::new(SourceWatcher::new(
        sources,
        dispatcher.clone(),
        Arc::clone(&broker),
        WatcherConfig {
            watch_filter,
            ..WatcherConfig::default()
        },
    ));
    tokio::spawn(async move {
        if let Err(error) = watcher.run().await {
            error!(error = %format!("{error:#}"), "watcher failed");
        }
    });

    let shutdown = Arc::new(tokio::sync::Notify::new());
    tokio::spawn(run_console(
        dispatcher,
        Arc::clone(&broker),
        Arc::clone(&shutdown),
    ));

    let app = routes::create_app(AppState::new(Arc::clone(&broker)));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", cli.port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", cli.port))?;
    info!("open http://localhost:{}/ in your browser", cli.port);

    // returning from main drops the runtime, which cancels worker tasks and
    // kills their children
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{level},tower_http=warn")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn resolve_sources(cli: &Cli) -> anyhow::Result<Vec<Source>> {
    let mut sources = Vec::new();

    if cli.config {
        let config = PathBuf::from(CONFIG_PATH);
        sources.extend(
            source::load_config(&config)
                .with_context(|| format!("failed to load '{CONFIG_PATH}'"))?,
        );
    }

    for pattern in &cli.sources {
        let paths = source::expand_paths(pattern)
            .with_context(|| format!("invalid source '{pattern}'"))?;
        sources.extend(paths.into_iter().map(|path| Source::new(path, cli.cmd.clone())));
    }

    Ok(sources)
}

async fn shutdown_signal(shutdown: Arc<tokio::sync::Notify>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                warn!(%error, "failed to listen for shutdown signal");
            }
        }
        () = shutdown.notified() => {}
    }
}

/// Stdin console: `/`-prefixed server commands, anything else is dispatched
/// as a protocol instruction through a dedicated long-lived run.
async fn run_console(
    dispatcher: Dispatcher,
    broker: Arc<EventBroker>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut parser = LineParser::new();
    let mut run = dispatcher.begin_run();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read console input");
                break;
            }
        };

        let trimmed = line.trim();
        if let Some(command) = trimmed.strip_prefix('/') {
            match command.trim() {
                "exit" => {
                    println!("Exiting liveview...");
                    shutdown.notify_one();
                    return;
                }
                "help" => println!("Available commands: /exit, /help"),
                other => println!("Unknown command: /{other}. Type '/help' for available commands."),
            }
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        if let Some(instruction) = parser.push_line(&line)
            && let Some(captured) = dispatcher.execute(&mut run, instruction).await
        {
            broker.relay_to_worker(&captured.id, "console", &captured.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_with_sources(sources: Vec<String>) -> Cli {
        Cli {
            sources,
            cmd: "echo".to_string(),
            config: false,
            port: 50001,
            watch_filter: None,
            log: "info".to_string(),
        }
    }

    #[test]
    fn resolve_sources_expands_globs_with_the_default_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.java"), "").unwrap();
        std::fs::write(dir.path().join("b.java"), "").unwrap();

        let cli = cli_with_sources(vec![format!("{}/*.java", dir.path().display())]);
        let sources = resolve_sources(&cli).unwrap();

        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.command == "echo"));
    }

    #[test]
    fn resolve_sources_fails_on_missing_file() {
        let cli = cli_with_sources(vec!["/no/such/file.java".to_string()]);
        assert!(resolve_sources(&cli).is_err());
    }

    #[test]
    fn resolve_sources_is_empty_without_input() {
        let cli = cli_with_sources(Vec::new());
        assert!(resolve_sources(&cli).unwrap().is_empty());
    }
}
