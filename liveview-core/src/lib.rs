//! # Liveview Core
//!
//! Core library for the liveview server, providing the instruction protocol,
//! the dispatch layer, and source configuration.
//!
//! ## Overview
//!
//! `liveview-core` contains everything about the wire-and-dispatch model that
//! does not touch HTTP or the filesystem watcher:
//!
//! - **Line Protocol**: parses the text lines a worker process writes to its
//!   stdout into typed [`protocol::Instruction`]s
//! - **Dispatch**: routes parsed instructions to named target and service
//!   handlers, including dynamic `Register` aliases and pipe threading
//! - **Sources**: the file + command pairs the server tracks and re-executes,
//!   built from CLI arguments, glob patterns, or a `sources.json` file
//! - **Events**: the fixed vocabulary of server-sent event types
//!
//! The HTTP surface, the event broker, and the watcher live in
//! `liveview-server` and consume this crate.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod source;

pub use dispatch::{Captured, DispatchRun, Dispatcher, HandlerRegistry};
pub use error::SourceError;
pub use events::EventType;
pub use protocol::{Command, CommandRef, Instruction, LineParser, Pipe, Read, Register};
pub use source::Source;
