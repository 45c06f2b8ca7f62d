//! Push-style parser for the worker line protocol.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::ids::generate_id;

use super::instruction::{Command, CommandRef, Instruction, Pipe, Read, Register};

/// Closes a `Name:` block.
const BLOCK_SENTINEL: &str = "~~~";

static SINGLE_LINE_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)(?:\{([^}]+)\})?:\s*(.+)$").unwrap());
static BLOCK_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)(?:\{([^}]+)\})?:\s*$").unwrap());
static READ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Read(?:\{([^}]+)\})?:\s*$").unwrap());
static REGISTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Register(?:\{([^}]+)\})?:\s+(\w+)\s+(.+)$").unwrap());
static PIPE_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\|(.+)$").unwrap());
static PIPE_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)(?:\{([^}]+)\})?$").unwrap());

#[derive(Debug)]
struct BlockState {
    name: String,
    id: String,
    lines: Vec<String>,
}

/// Parses a stream of text lines into [`Instruction`]s, one call per line.
///
/// The parser is stateful only while inside a block; one instance per worker
/// run keeps successive runs independent. Line classification follows a fixed
/// precedence: pipe, register, read, block start, single-line command.
#[derive(Debug, Default)]
pub struct LineParser {
    block: Option<BlockState>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns an instruction when the line completes one.
    ///
    /// Unrecognized lines are logged and skipped. Blank lines outside a block
    /// are ignored; inside a block every line except the `~~~` sentinel is
    /// preserved verbatim, empty lines included, so multi-line content such
    /// as markdown paragraphs survives intact.
    pub fn push_line(&mut self, line: &str) -> Option<Instruction> {
        if let Some(mut block) = self.block.take() {
            if line == BLOCK_SENTINEL {
                debug!(name = %block.name, id = %block.id, "parsed block command");
                return Some(Instruction::Command(Command {
                    name: block.name,
                    id: block.id,
                    content: block.lines.join("\n"),
                }));
            }
            block.lines.push(line.to_string());
            self.block = Some(block);
            return None;
        }

        if line.trim().is_empty() {
            return None;
        }

        if let Some(instruction) = try_pipe(line) {
            return instruction;
        }
        if let Some(instruction) = try_register(line) {
            return Some(instruction);
        }
        if let Some(instruction) = try_read(line) {
            return Some(instruction);
        }
        if self.try_block_start(line) {
            return None;
        }
        if let Some(instruction) = try_single_command(line) {
            return Some(instruction);
        }

        warn!(line, "ignored unrecognized line");
        None
    }

    /// Signal end of input. An unterminated block is dropped with a warning.
    pub fn finish(&mut self) {
        if let Some(block) = self.block.take() {
            warn!(name = %block.name, id = %block.id, "dropped unterminated block at end of input");
        }
    }

    fn try_block_start(&mut self, line: &str) -> bool {
        let Some(captures) = BLOCK_START.captures(line) else {
            return false;
        };

        let name = captures[1].to_string();
        let id = captures
            .get(2)
            .map_or_else(generate_id, |id| id.as_str().to_string());
        debug!(%name, %id, "started block command");
        self.block = Some(BlockState {
            name,
            id,
            lines: Vec::new(),
        });
        true
    }
}

// Outer Option: did the line look like a pipe at all. Inner Option: did any
// stage survive filtering.
fn try_pipe(line: &str) -> Option<Option<Instruction>> {
    let captures = PIPE_LINE.captures(line)?;

    let refs: Vec<CommandRef> = captures[1]
        .split('|')
        .map(str::trim)
        .filter_map(|entry| match PIPE_ENTRY.captures(entry) {
            Some(m) => Some(CommandRef {
                name: m[1].to_string(),
                id: m.get(2).map_or_else(generate_id, |id| id.as_str().to_string()),
            }),
            None => {
                warn!(entry, "invalid pipe stage");
                None
            }
        })
        .collect();

    if refs.is_empty() {
        warn!(line, "pipe instruction without valid stages");
        return Some(None);
    }

    debug!(?refs, "parsed pipe");
    Some(Some(Instruction::Pipe(Pipe { refs })))
}

fn try_register(line: &str) -> Option<Instruction> {
    let captures = REGISTER.captures(line)?;

    let skip_id = captures.get(1).is_some_and(|flag| flag.as_str() == "skipId");
    debug!(name = &captures[2], call = &captures[3], skip_id, "parsed register");
    Some(Instruction::Register(Register {
        name: captures[2].to_string(),
        call: captures[3].to_string(),
        skip_id,
    }))
}

fn try_read(line: &str) -> Option<Instruction> {
    let captures = READ.captures(line)?;

    let id = captures
        .get(1)
        .map_or_else(generate_id, |id| id.as_str().to_string());
    debug!(%id, "parsed read");
    Some(Instruction::Read(Read { id }))
}

fn try_single_command(line: &str) -> Option<Instruction> {
    let captures = SINGLE_LINE_COMMAND.captures(line)?;

    let id = captures
        .get(2)
        .map_or_else(generate_id, |id| id.as_str().to_string());
    debug!(name = &captures[1], %id, "parsed single-line command");
    Some(Instruction::Command(Command {
        name: captures[1].to_string(),
        id,
        content: captures[3].to_string(),
    }))
}
