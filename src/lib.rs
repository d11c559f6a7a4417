//! Quillsync integration tests and workspace root
//!
//! This crate serves as the root of the Quillsync workspace and contains
//! integration tests that exercise the full sync engine against the
//! in-memory reference backend.

// Re-export major components for integration testing
pub use quill_files as files;
pub use quill_store as store;
pub use quill_sync as sync;
