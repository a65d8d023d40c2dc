//! Core types and error definitions for the okvm agent runtime.
//!
//! This crate provides the foundational types shared across all okvm crates:
//! the error taxonomy, message representations, the tool-invocation contract
//! and the per-turn execution trace.
//!
//! # Main types
//!
//! - [`OkvmError`]: Unified error enum for all okvm subsystems.
//! - [`OkvmResult`]: Convenience alias for `Result<T, OkvmError>`.
//! - [`Message`]: A single message in a session's history.
//! - [`ToolCall`] / [`ToolResult`]: The `{name, arguments} -> {result} | {error}` contract.
//! - [`ExecutionTrace`]: Ordered record of model exchanges and tool calls in one turn.
//! - [`TurnStatus`]: Terminal status of a turn.

/// Error taxonomy shared by every crate.
pub mod error;
/// Conversation messages.
pub mod message;
/// Tool calls, results and invocation records.
pub mod tool;
/// Execution traces and turn status.
pub mod trace;

pub use error::{OkvmError, OkvmResult};
pub use message::{Message, Role};
pub use tool::{ToolCall, ToolFailure, ToolInvocation, ToolOutcome, ToolResult};
pub use trace::{ExecutionTrace, TraceStep, TurnStatus};
