//! The line-oriented instruction protocol.
//!
//! A worker process drives the server by writing plain text lines to its
//! stdout. This module turns that stream into typed [`Instruction`]s; it
//! performs no I/O of its own.

mod instruction;
mod parser;

pub use instruction::{Command, CommandRef, Instruction, Pipe, Read, Register};
pub use parser::LineParser;
