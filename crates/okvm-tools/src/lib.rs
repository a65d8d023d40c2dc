//! Tool contract and workspace-bound tools for the okvm agent runtime.
//!
//! Concrete capabilities such as shell, browser or media synthesis live
//! outside this crate and plug in through the same [`Tool`] trait.

pub mod files;
pub mod registry;
pub mod tool;

pub use files::{
    register_workspace_tools, DeleteFileTool, EditFileTool, ListDirectoryTool, ReadFileTool,
    WriteFileTool,
};
pub use registry::ToolRegistry;
pub use tool::{Tool, ToolDescriptor};
