//! Turn execution for the okvm agent runtime.
//!
//! A [`TurnExecutor`] drives one conversational turn: it calls the model,
//! dispatches the tools it asks for, feeds the results back, and loops until
//! the model answers or the turn is interrupted. Progress is published as
//! [`StreamEvent`]s through an [`EventSink`] to the one [`TurnStream`] that
//! consumes them.

pub mod backends;
pub mod config;
pub mod executor;
pub mod model;
pub mod stream;

pub use backends::{OpenAiCompatClient, ScriptStep, ScriptedModel};
pub use config::{ExecutorConfig, ModelConfig};
pub use executor::{TurnExecutor, TurnOutcome, TurnPhase, SEGMENT_SEPARATOR};
pub use model::{ModelClient, ModelReply, ModelRequest};
pub use stream::{EventSink, StreamEvent, ToolState, TurnStream};
