//! Sandboxed workspaces for the okvm agent runtime.
//!
//! A [`Workspace`] is a directory tree bounded by a byte quota, with every
//! path confined to its root and an append-only snapshot chain recorded by
//! a [`VersionControl`] backend. The [`WorkspaceManager`] allocates and
//! releases them.
//!
//! # Main types
//!
//! - [`WorkspaceManager`]: Allocation, limits and release.
//! - [`Workspace`]: Serialised, timed file and snapshot operations.
//! - [`VersionControl`]: Snapshot backend seam ([`GitVersionControl`], [`DisabledVersionControl`]).
//! - [`Snapshot`]: An immutable checkpoint.

pub mod config;
pub mod manager;
pub mod sandbox;
pub mod vcs;
pub mod workspace;

pub use config::{SnapshotBackend, WorkspaceConfig};
pub use manager::WorkspaceManager;
pub use vcs::{
    normalize_label, DisabledVersionControl, GitVersionControl, Snapshot, SnapshotId,
    VersionControl,
};
pub use workspace::{DirEntry, EntryKind, Workspace, WorkspaceState, WriteMode, WriteReceipt};
