//! Shared domain types for the quarry indexing core.
//!
//! This crate holds the value types that cross component boundaries:
//! configured-target identities, file events delivered by the host, the
//! build-setup configuration with its merge semantics, and the toolchain
//! model. It deliberately has no async machinery; everything here is cheap
//! to clone and safe to hash.

pub mod config;
pub mod events;
pub mod language;
pub mod target;
pub mod toolchain;

pub use config::{BuildConfiguration, BuildFlags, BuildSetup, WorkspaceType};
pub use events::{FileEvent, FileEventKind};
pub use language::Language;
pub use target::{ConfiguredTarget, SourceFileInfo};
pub use toolchain::{Toolchain, ToolchainRegistry};
