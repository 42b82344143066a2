//! Quarry - a language-server-adjacent core that bridges a package-manifest
//! build system to a semantic index pipeline.
//!
//! Given a workspace rooted at a package manifest, quarry loads the package,
//! maps source files to build targets, synthesizes per-file compiler
//! invocations, and schedules preparation (build) and index-store-update work
//! across targets with bounded parallelism.
//!
//! # Architecture
//!
//! ```text
//! file events ──▶ PackageBuildSystem ──▶ DelegateBus ──▶ observers
//!                       │  (reload / debounced dependency fan-out)
//!                       ▼
//! client queries ──▶ SemanticIndexManager ──▶ TaskScheduler ──▶ swift build
//!                       │                          │
//!                       ▼                          ▼
//!                  index-status map          IndexStore updates
//! ```
//!
//! Each component owns its mutable state behind a lock that is never held
//! across an `.await`; the `TaskScheduler` is the only resource shared across
//! workspaces and its concurrency budget is the sole admission control.
//!
//! The core does not persist state across restarts, does not parse source
//! code, and does not compile anything in-process - it launches the external
//! build tool and waits.

pub mod buildsystem;
pub mod debounce;
pub mod index;
pub mod scheduler;

pub use buildsystem::{
  BuildSystemDelegate, BuildSystemError, DelegateBus, FileBuildSettings, PackageBuildSystem, ReloadStatus,
  WorkspaceBuildSystem, find_package_root,
};
pub use index::{CompilerIndexer, IndexHooks, IndexStore, IndexTaskDescription, SemanticIndexManager};
pub use scheduler::{TaskExecutionState, TaskHandle, TaskPriority, TaskScheduler};
