//! End-to-end tests for the semantic index pipeline.
//!
//! These tests drive the real `PackageBuildSystem` + `SemanticIndexManager`
//! wiring against a fake package loader, a recording index store, and a stub
//! build tool written into a temp directory, so preparation exercises real
//! subprocess handling without a toolchain installed.

pub mod helpers;

mod events;
