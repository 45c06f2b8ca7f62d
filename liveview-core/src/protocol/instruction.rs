//! Parsed instruction types.

/// One fully parsed directive from a worker's output stream.
///
/// Instructions are immutable once parsed; they are consumed synchronously by
/// the dispatcher and then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Command(Command),
    Register(Register),
    Read(Read),
    Pipe(Pipe),
}

/// A directive with a target name, a correlation id, and a body.
///
/// The body is either the remainder of a single line or the joined content of
/// a `Name:` … `~~~` block. Reusing an id lets a later command replace the
/// visual element produced by an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub id: String,
    pub content: String,
}

/// Declares a dynamic alias binding a new command name to an invocation
/// template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub call: String,
    /// When set, the correlation id is not forwarded to the underlying call.
    pub skip_id: bool,
}

/// Requests that the next command's content be captured instead of
/// dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub id: String,
}

/// Chains prior commands' outputs as input to the next target, left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipe {
    pub refs: Vec<CommandRef>,
}

/// One `name` or `name{id}` stage of a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRef {
    pub name: String,
    pub id: String,
}
