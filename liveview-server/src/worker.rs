//! Worker process supervision.
//!
//! One worker run: spawn the source's shell command, merge its stdout and
//! stderr into a single line stream, feed every line through the protocol
//! codec and the dispatcher, and kill the process at the wall-clock deadline.
//! A failed run is logged and abandoned; it never takes the watcher down.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use liveview_core::{Dispatcher, EventType, LineParser, Source};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, error, info, warn};

use crate::broker::EventBroker;

/// Default wall-clock deadline for one worker run.
pub const WORKER_DEADLINE: Duration = Duration::from_secs(30);

/// Execute one run of `source` to completion, the deadline, or failure.
///
/// The child is spawned with `kill_on_drop`, so hitting the deadline (or the
/// run task being aborted by a superseding run) forcibly terminates it; no
/// orphans survive a superseded run.
pub async fn run_worker(
    source: Arc<Source>,
    dispatcher: Dispatcher,
    broker: Arc<EventBroker>,
    deadline: Duration,
) {
    let path = source.path.display().to_string();
    match tokio::time::timeout(deadline, drive_worker(&source, &dispatcher, &broker)).await {
        Ok(Ok(())) => info!(source = %path, "execution finished"),
        Ok(Err(error)) => error!(source = %path, error = %format!("{error:#}"), "worker run failed"),
        Err(_) => error!(source = %path, "timeout: worker process killed"),
    }
}

async fn drive_worker(
    source: &Source,
    dispatcher: &Dispatcher,
    broker: &EventBroker,
) -> anyhow::Result<()> {
    let command = source.shell_command();
    info!(source = %source.path.display(), %command, "executing source");

    // fresh per-run dispatch state, and a clean slate in every viewer
    let mut run = dispatcher.begin_run();
    broker.dispatch_to_viewers(EventType::Clear, "");

    let mut builder = tokio::process::Command::new("sh");
    builder
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = source.path.parent() {
        builder.current_dir(dir);
    }
    let mut child = builder.spawn().context("failed to spawn worker process")?;

    let stdout = child.stdout.take().context("worker stdout not captured")?;
    let stderr = child.stderr.take().context("worker stderr not captured")?;
    let mut lines = LinesStream::new(BufReader::new(stdout).lines())
        .merge(LinesStream::new(BufReader::new(stderr).lines()));

    let mut parser = LineParser::new();
    while let Some(line) = lines.next().await {
        let line = line.context("error reading worker output")?;
        debug!(worker = %line);
        let Some(instruction) = parser.push_line(&line) else {
            continue;
        };
        if let Some(captured) = dispatcher.execute(&mut run, instruction).await {
            broker.relay_to_worker(&captured.id, &source.path.to_string_lossy(), &captured.content);
        }
    }
    parser.finish();

    let status = child.wait().await.context("failed to await worker exit")?;
    if !status.success() {
        warn!(source = %source.path.display(), %status, "worker exited with failure");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveview_core::HandlerRegistry;
    use std::sync::Mutex;

    fn recording_setup() -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rendered);
        let mut registry = HandlerRegistry::new();
        registry.register_target("Echoed", move |_id: &str, content: &str| {
            sink.lock().unwrap().push(content.to_string());
        });
        (Dispatcher::new(Arc::new(registry)), rendered)
    }

    fn file_source(dir: &std::path::Path, command: &str) -> Arc<Source> {
        let path = dir.join("demo.txt");
        std::fs::write(&path, "").unwrap();
        Arc::new(Source::new(path, command))
    }

    #[tokio::test]
    async fn worker_output_is_dispatched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, rendered) = recording_setup();
        let broker = Arc::new(EventBroker::new(50001));
        // the worker ignores its path argument and emits two commands
        let source = file_source(
            dir.path(),
            "printf 'Echoed: one\\nEchoed: two\\n' ; true",
        );

        run_worker(source, dispatcher, broker, Duration::from_secs(5)).await;

        assert_eq!(rendered.lock().unwrap().as_slice(), ["one", "two"]);
    }

    #[tokio::test]
    async fn worker_exceeding_deadline_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, rendered) = recording_setup();
        let broker = Arc::new(EventBroker::new(50001));
        let source = file_source(dir.path(), "sleep 30 ; echo 'Echoed: late' #");

        let started = std::time::Instant::now();
        run_worker(source, dispatcher, broker, Duration::from_millis(200)).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(rendered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rendered) = recording_setup();
        let broker = Arc::new(EventBroker::new(50001));
        let source = file_source(dir.path(), "definitely-not-a-command-anywhere");

        // sh itself spawns; the command fails with a non-zero exit, which is
        // logged and contained
        run_worker(source, dispatcher, broker, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn stderr_lines_reach_the_codec() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, rendered) = recording_setup();
        let broker = Arc::new(EventBroker::new(50001));
        let source = file_source(dir.path(), "printf 'Echoed: from stderr\\n' 1>&2 ; true");

        run_worker(source, dispatcher, broker, Duration::from_secs(5)).await;

        assert_eq!(rendered.lock().unwrap().as_slice(), ["from stderr"]);
    }
}
