//! Instruction dispatch.
//!
//! The dispatcher owns the mapping from command name to handler and executes
//! instructions in the order they were parsed, on the task that produced
//! them. External collaborators (renderers, widget generators) plug in
//! through [`HandlerRegistry`] without this crate knowing their
//! implementation.
//!
//! Handlers come in two shapes:
//!
//! - a **target** renders: `(id, content)` with a side effect, no result
//! - a **service** transforms: `(id, content, memory)` to an optional result
//!
//! `Register` instructions add per-run aliases on top of the static registry;
//! pipes thread content through stages left to right. Nothing in here
//! propagates an error to the caller: every failure is logged and converted
//! to a skip.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::protocol::{Command, Instruction, Pipe};

/// Per-run id to content memory, readable by services.
pub type RunMemory = HashMap<String, String>;

/// A rendering sink: side-effecting function of `(id, content)`.
pub type TargetFn = dyn Fn(&str, &str) + Send + Sync;

/// A transform: function of `(id, content, memory)` returning the produced
/// content, or `None` when the service could not produce any.
pub type ServiceFn = dyn Fn(&str, &str, &RunMemory) -> Option<String> + Send + Sync;

/// Placeholder substituted with the invocation content in alias templates.
const CALL_PLACEHOLDER: &str = "${0}";

/// Wall-clock deadline for a registered alias invocation.
const ALIAS_KILL_DEADLINE: Duration = Duration::from_secs(10);

/// Static name-to-handler mapping, built once at startup and shared across
/// runs.
#[derive(Default)]
pub struct HandlerRegistry {
    targets: HashMap<String, Arc<TargetFn>>,
    services: HashMap<String, Arc<ServiceFn>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("target_count", &self.targets.len())
            .field("service_count", &self.services.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rendering target under `name`, overwriting any previous
    /// handler with that name.
    pub fn register_target<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.targets.insert(name.into(), Arc::new(handler));
    }

    /// Register a transforming service under `name`.
    pub fn register_service<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&str, &str, &RunMemory) -> Option<String> + Send + Sync + 'static,
    {
        self.services.insert(name.into(), Arc::new(handler));
    }

    fn target(&self, name: &str) -> Option<Arc<TargetFn>> {
        self.targets.get(name).cloned()
    }

    fn service(&self, name: &str) -> Option<Arc<ServiceFn>> {
        self.services.get(name).cloned()
    }
}

/// Dynamic alias installed by a `Register` instruction.
#[derive(Debug, Clone)]
struct Alias {
    call: String,
    skip_id: bool,
}

/// State scoped to one (re-)execution of a source, discarded before the next
/// worker process is spawned.
#[derive(Debug, Default)]
pub struct DispatchRun {
    aliases: HashMap<String, Alias>,
    memory: RunMemory,
    pending_read: Option<String>,
}

impl DispatchRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent content produced under `id` in this run, if any.
    pub fn recall(&self, id: &str) -> Option<&str> {
        self.memory.get(id).map(String::as_str)
    }
}

/// Content captured by a `Read` instruction, handed back to the caller for
/// relay to the worker instead of being dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub id: String,
    pub content: String,
}

enum StageOutcome {
    /// A service produced content (already recorded in run memory).
    Produced(String),
    /// A target rendered; the input content was recorded in run memory.
    Rendered,
    /// A service ran but produced nothing.
    Failed,
    /// No handler under that name.
    Unknown,
}

/// Executes instructions against a shared [`HandlerRegistry`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Fresh per-run state. Call before spawning a source's worker process.
    pub fn begin_run(&self) -> DispatchRun {
        DispatchRun::new()
    }

    /// Execute one instruction. Returns captured content when a `Read` was
    /// pending; never an error (failures are logged and skipped).
    pub async fn execute(
        &self,
        run: &mut DispatchRun,
        instruction: Instruction,
    ) -> Option<Captured> {
        match instruction {
            Instruction::Command(command) => self.execute_command(run, command).await,
            Instruction::Register(register) => {
                debug!(name = %register.name, call = %register.call, "registered alias");
                run.aliases.insert(
                    register.name,
                    Alias {
                        call: register.call,
                        skip_id: register.skip_id,
                    },
                );
                None
            }
            Instruction::Read(read) => {
                run.pending_read = Some(read.id);
                None
            }
            Instruction::Pipe(pipe) => {
                self.execute_pipe(run, pipe).await;
                None
            }
        }
    }

    async fn execute_command(
        &self,
        run: &mut DispatchRun,
        command: Command,
    ) -> Option<Captured> {
        if let Some(read_id) = run.pending_read.take() {
            debug!(id = %read_id, "captured content for pending read");
            run.memory.insert(read_id.clone(), command.content.clone());
            return Some(Captured {
                id: read_id,
                content: command.content,
            });
        }

        debug!(name = %command.name, id = %command.id, "command");
        self.invoke(run, &command.name, &command.id, &command.content)
            .await;
        None
    }

    /// Thread content through the pipe stages. The first ref seeds the chain
    /// from run memory; a seed with no recorded content aborts the pipe
    /// (forward references are skipped, not errors).
    async fn execute_pipe(&self, run: &mut DispatchRun, pipe: Pipe) {
        let mut stages = pipe.refs.into_iter();
        let Some(seed) = stages.next() else {
            return;
        };
        let Some(mut current) = run.memory.get(&seed.id).cloned() else {
            warn!(
                name = %seed.name,
                id = %seed.id,
                "pipe references content that has not been produced; skipping pipe"
            );
            return;
        };

        for stage in stages {
            debug!(name = %stage.name, id = %stage.id, "pipe stage");
            match self.invoke(run, &stage.name, &stage.id, &current).await {
                StageOutcome::Produced(output) => current = output,
                // A rendering stage passes its input through unchanged.
                StageOutcome::Rendered => {}
                StageOutcome::Failed => {
                    warn!(name = %stage.name, "pipe stage produced no output; stopping pipe");
                    return;
                }
                StageOutcome::Unknown => {}
            }
        }
    }

    /// Resolve `name` (alias, then service, then target) and invoke it.
    /// Produced or rendered content is recorded in run memory under `id`.
    async fn invoke(
        &self,
        run: &mut DispatchRun,
        name: &str,
        id: &str,
        content: &str,
    ) -> StageOutcome {
        if let Some(alias) = run.aliases.get(name).cloned() {
            return match invoke_alias(&alias, name, id, content).await {
                Some(output) => {
                    run.memory.insert(id.to_string(), output.clone());
                    StageOutcome::Produced(output)
                }
                None => StageOutcome::Failed,
            };
        }

        if let Some(service) = self.registry.service(name) {
            return match service(id, content, &run.memory) {
                Some(output) => {
                    run.memory.insert(id.to_string(), output.clone());
                    StageOutcome::Produced(output)
                }
                None => StageOutcome::Failed,
            };
        }

        if let Some(target) = self.registry.target(name) {
            target(id, content);
            run.memory.insert(id.to_string(), content.to_string());
            return StageOutcome::Rendered;
        }

        error!(%name, "command not found");
        StageOutcome::Unknown
    }
}

/// Run a registered alias: substitute the content into the call template,
/// execute it through the shell, and capture its output.
///
/// Unless the alias was registered with `skipId`, the correlation id is
/// written as the first stdin line. A template without a `${0}` placeholder
/// gets the content on stdin instead.
async fn invoke_alias(alias: &Alias, name: &str, id: &str, content: &str) -> Option<String> {
    let has_placeholder = alias.call.contains(CALL_PLACEHOLDER);
    let call = alias.call.replace(CALL_PLACEHOLDER, content);
    info!(%name, %call, "executing registered alias");

    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&call)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            error!(%name, %error, "failed to spawn alias process");
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let mut feed = String::new();
        if !alias.skip_id {
            feed.push_str(id);
            feed.push('\n');
        }
        if !has_placeholder {
            feed.push_str(content);
            feed.push('\n');
        }
        if !feed.is_empty()
            && let Err(error) = stdin.write_all(feed.as_bytes()).await
        {
            warn!(%name, %error, "failed to write alias stdin");
        }
        // dropping stdin closes the pipe so the child sees EOF
    }

    let output = match tokio::time::timeout(ALIAS_KILL_DEADLINE, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => {
            error!(%name, %error, "alias process failed");
            return None;
        }
        // kill_on_drop reaps the child when the timeout drops it
        Err(_) => {
            error!(%name, "timeout: alias process killed");
            return None;
        }
    };

    if !output.stderr.is_empty() {
        debug!(%name, stderr = %String::from_utf8_lossy(&output.stderr), "alias stderr");
    }

    let mut result = String::from_utf8_lossy(&output.stdout).into_owned();
    if result.ends_with('\n') {
        result.pop();
        if result.ends_with('\r') {
            result.pop();
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandRef, Read, Register};
    use std::sync::Mutex;

    fn command(name: &str, id: &str, content: &str) -> Instruction {
        Instruction::Command(Command {
            name: name.to_string(),
            id: id.to_string(),
            content: content.to_string(),
        })
    }

    fn pipe(refs: &[(&str, &str)]) -> Instruction {
        Instruction::Pipe(Pipe {
            refs: refs
                .iter()
                .map(|(name, id)| CommandRef {
                    name: name.to_string(),
                    id: id.to_string(),
                })
                .collect(),
        })
    }

    /// Registry with an identity service `A` and a recording target `B`.
    fn registry_with_recorder() -> (Arc<HandlerRegistry>, Arc<Mutex<Vec<(String, String)>>>) {
        let rendered = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register_service("A", |_id, content, _memory| Some(content.to_string()));
        let sink = Arc::clone(&rendered);
        registry.register_target("B", move |id: &str, content: &str| {
            sink.lock().unwrap().push((id.to_string(), content.to_string()));
        });
        (Arc::new(registry), rendered)
    }

    #[tokio::test]
    async fn unknown_command_is_skipped_without_error() {
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()));
        let mut run = dispatcher.begin_run();
        assert!(dispatcher
            .execute(&mut run, command("Nope", "x", "content"))
            .await
            .is_none());
        assert!(run.recall("x").is_none());
    }

    #[tokio::test]
    async fn target_receives_id_and_content() {
        let (registry, rendered) = registry_with_recorder();
        let dispatcher = Dispatcher::new(registry);
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("B", "el1", "<p>hi</p>")).await;

        assert_eq!(
            rendered.lock().unwrap().as_slice(),
            [("el1".to_string(), "<p>hi</p>".to_string())]
        );
        assert_eq!(run.recall("el1"), Some("<p>hi</p>"));
    }

    #[tokio::test]
    async fn pipe_threads_recorded_content_into_next_stage() {
        let (registry, rendered) = registry_with_recorder();
        let dispatcher = Dispatcher::new(registry);
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("A", "1", "hello")).await;
        dispatcher
            .execute(&mut run, pipe(&[("A", "1"), ("B", "b1")]))
            .await;

        let rendered = rendered.lock().unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].1, "hello");
    }

    #[tokio::test]
    async fn pipe_forward_reference_is_skipped() {
        let (registry, rendered) = registry_with_recorder();
        let dispatcher = Dispatcher::new(registry);
        let mut run = dispatcher.begin_run();

        dispatcher
            .execute(&mut run, pipe(&[("A", "missing"), ("B", "b1")]))
            .await;

        assert!(rendered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pipe_continues_through_rendering_stage() {
        let (registry, rendered) = registry_with_recorder();
        let dispatcher = Dispatcher::new(registry);
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("A", "1", "payload")).await;
        dispatcher
            .execute(&mut run, pipe(&[("A", "1"), ("B", "first"), ("B", "second")]))
            .await;

        let rendered = rendered.lock().unwrap();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].1, "payload");
        assert_eq!(rendered[1].1, "payload");
    }

    #[tokio::test]
    async fn register_alias_substitutes_content_into_template() {
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()));
        let mut run = dispatcher.begin_run();

        dispatcher
            .execute(
                &mut run,
                Instruction::Register(Register {
                    name: "Triangle".to_string(),
                    call: "echo drawTriangle(${0})".to_string(),
                    skip_id: true,
                }),
            )
            .await;
        dispatcher.execute(&mut run, command("Triangle", "t", "5")).await;

        assert_eq!(run.recall("t"), Some("drawTriangle(5)"));
    }

    #[tokio::test]
    async fn register_alias_forwards_id_on_stdin() {
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()));
        let mut run = dispatcher.begin_run();

        dispatcher
            .execute(
                &mut run,
                Instruction::Register(Register {
                    name: "Echo".to_string(),
                    call: "cat".to_string(),
                    skip_id: false,
                }),
            )
            .await;
        dispatcher.execute(&mut run, command("Echo", "t7", "body")).await;

        assert_eq!(run.recall("t7"), Some("t7\nbody"));
    }

    #[tokio::test]
    async fn aliases_do_not_leak_across_runs() {
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()));
        let mut run = dispatcher.begin_run();
        dispatcher
            .execute(
                &mut run,
                Instruction::Register(Register {
                    name: "Echo".to_string(),
                    call: "echo ${0}".to_string(),
                    skip_id: true,
                }),
            )
            .await;
        dispatcher.execute(&mut run, command("Echo", "a", "one")).await;
        assert_eq!(run.recall("a"), Some("one"));

        let mut next_run = dispatcher.begin_run();
        dispatcher.execute(&mut next_run, command("Echo", "a", "two")).await;
        assert!(next_run.recall("a").is_none());
    }

    #[tokio::test]
    async fn read_captures_next_command_instead_of_dispatching() {
        let (registry, rendered) = registry_with_recorder();
        let dispatcher = Dispatcher::new(registry);
        let mut run = dispatcher.begin_run();

        dispatcher
            .execute(
                &mut run,
                Instruction::Read(Read {
                    id: "snippet".to_string(),
                }),
            )
            .await;
        let captured = dispatcher
            .execute(&mut run, command("B", "x", "fn main() {}"))
            .await;

        assert_eq!(
            captured,
            Some(Captured {
                id: "snippet".to_string(),
                content: "fn main() {}".to_string(),
            })
        );
        assert!(rendered.lock().unwrap().is_empty(), "capture must not dispatch");
        assert_eq!(run.recall("snippet"), Some("fn main() {}"));
    }

    #[tokio::test]
    async fn service_can_recall_run_memory() {
        let mut registry = HandlerRegistry::new();
        registry.register_service("Text", |id, content, memory| {
            if content.trim().is_empty() {
                memory.get(id).cloned()
            } else {
                Some(content.to_string())
            }
        });
        let dispatcher = Dispatcher::new(Arc::new(registry));
        let mut run = dispatcher.begin_run();

        dispatcher.execute(&mut run, command("Text", "tpl", "stored")).await;
        dispatcher.execute(&mut run, command("Text", "other", "x")).await;

        assert_eq!(run.recall("tpl"), Some("stored"));
    }
}
