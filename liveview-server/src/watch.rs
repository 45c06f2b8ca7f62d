//! The source watcher.
//!
//! State machine per source: `idle -> scheduled -> running`. File-system
//! events are debounced (cancel-and-replace scheduling plus a last-seen map
//! that swallows duplicate events inside the window), matched against the
//! tracked sources, and turned into worker runs. A firing run supersedes the
//! previous run for that source: old child killed, worker channel evicted,
//! then the new process spawned. One failed run never terminates the watch
//! loop.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use liveview_core::{Dispatcher, Source};
use notify::{EventKind, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::EventBroker;
use crate::worker::{WORKER_DEADLINE, run_worker};

/// Quiet period after the last relevant change before a source re-runs.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub worker_deadline: Duration,
    /// Only file names matching this glob trigger re-runs; unset means any
    /// change to a tracked source path counts.
    pub watch_filter: Option<glob::Pattern>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_DELAY,
            worker_deadline: WORKER_DEADLINE,
            watch_filter: None,
        }
    }
}

/// Decides whether a change event schedules a run or falls inside the window
/// of one already accounted for.
#[derive(Debug)]
pub(crate) struct DebounceState {
    window: Duration,
    last_seen: HashMap<PathBuf, Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebounceDecision {
    Schedule,
    Ignore,
}

impl DebounceState {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    fn observe(&mut self, path: &Path, now: Instant) -> DebounceDecision {
        match self.last_seen.get(path) {
            Some(&previous) if now.duration_since(previous) < self.window => {
                DebounceDecision::Ignore
            }
            _ => {
                self.last_seen.insert(path.to_path_buf(), now);
                DebounceDecision::Schedule
            }
        }
    }
}

pub struct SourceWatcher {
    sources: Vec<Arc<Source>>,
    dispatcher: Dispatcher,
    broker: Arc<EventBroker>,
    config: WatcherConfig,
    debounce: Mutex<DebounceState>,
    /// Scheduled (not yet fired) re-runs, by source id.
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
    /// In-flight worker runs, by source id.
    runs: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for SourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceWatcher")
            .field("source_count", &self.sources.len())
            .field("pending", &self.pending.lock().len())
            .field("running", &self.runs.lock().len())
            .finish()
    }
}

impl SourceWatcher {
    pub fn new(
        sources: Vec<Source>,
        dispatcher: Dispatcher,
        broker: Arc<EventBroker>,
        config: WatcherConfig,
    ) -> Self {
        let debounce = Mutex::new(DebounceState::new(config.debounce));
        Self {
            sources: sources.into_iter().map(Arc::new).collect(),
            dispatcher,
            broker,
            config,
            debounce,
            pending: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Run every source once, then watch their directories until the event
    /// channel closes. Only watcher *setup* can fail; per-run failures are
    /// contained downstream.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        for source in &self.sources {
            info!(source = %source.path.display(), "running initial execution");
            self.clone().start_run(Arc::clone(source)).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
                // the watch thread outliving the receiver is fine; sends just fail
                let _ = tx.send(event);
            })
            .context("failed to initialize file watcher")?;

        for dir in self.watch_roots() {
            watcher
                .watch(&dir, RecursiveMode::Recursive)
                .with_context(|| format!("failed to watch '{}'", dir.display()))?;
            info!(dir = %dir.display(), "watching");
        }

        while let Some(event) = rx.recv().await {
            match event {
                Ok(event)
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) =>
                {
                    for path in &event.paths {
                        self.handle_change(path);
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "file watch error"),
            }
        }
        Ok(())
    }

    /// Parent directory of every tracked source, deduplicated.
    fn watch_roots(&self) -> BTreeSet<PathBuf> {
        self.sources
            .iter()
            .filter_map(|source| source.path.parent().map(Path::to_path_buf))
            .collect()
    }

    fn handle_change(self: &Arc<Self>, path: &Path) {
        if let Some(filter) = &self.config.watch_filter {
            let name = path.file_name().map_or(path, Path::new);
            if !filter.matches_path(name) {
                return;
            }
        }

        let Some(source) = self.matching_source(path) else {
            return;
        };

        if self.debounce.lock().observe(&source.path, Instant::now()) == DebounceDecision::Ignore {
            debug!(path = %path.display(), "change already accounted for in debounce window");
            return;
        }

        info!(path = %path.display(), "source changed");
        self.schedule(source);
    }

    fn matching_source(&self, path: &Path) -> Option<Arc<Source>> {
        // editors often write via rename, so the event path may be a fresh
        // inode; fall back to canonicalizing before comparing
        let canonical = path.canonicalize().ok();
        self.sources
            .iter()
            .find(|source| {
                source.path == path || canonical.as_deref() == Some(source.path.as_path())
            })
            .map(Arc::clone)
    }

    /// Cancel-and-replace: only the latest scheduled run for a source
    /// survives.
    fn schedule(self: &Arc<Self>, source: Arc<Source>) {
        let watcher = Arc::clone(self);
        let delay = self.config.debounce;
        let id = source.id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            watcher.clone().start_run(source).await;
        });

        if let Some(previous) = self.pending.lock().insert(id, task)
            && !previous.is_finished()
        {
            previous.abort();
            debug!("previous scheduled run cancelled");
        }
    }

    /// Transition to `running`: tear down the prior run (kill its child,
    /// evict the stale worker channel) before the new process spawns, so two
    /// runs of one source never interleave output.
    async fn start_run(self: Arc<Self>, source: Arc<Source>) {
        let previous = self.runs.lock().remove(&source.id);
        if let Some(previous) = previous
            && !previous.is_finished()
        {
            warn!(source = %source.path.display(), "superseding still-running worker");
            previous.abort();
            let _ = previous.await;
        }
        self.broker.evict_worker_channel();

        let task = tokio::spawn(run_worker(
            Arc::clone(&source),
            self.dispatcher.clone(),
            Arc::clone(&self.broker),
            self.config.worker_deadline,
        ));
        self.runs.lock().insert(source.id.clone(), task);
    }
}
