//! [`ModelClient`](crate::ModelClient) implementations.

pub mod openai;
pub mod scripted;

pub use openai::OpenAiCompatClient;
pub use scripted::{ScriptStep, ScriptedModel};
