//! Remote file API abstraction for Quill sync targets
//!
//! Every storage backend is an opaque blob store behind the [`FileApi`]
//! trait: stat/get/put/delete/list plus a paginated delta feed with an
//! opaque continuation. Capability flags let the engine exploit backends
//! that echo accurate item timestamps or accept batched uploads.

pub mod api;
pub mod errors;
pub mod memory;

pub use api::{
    DeltaOptions, DeltaPage, FileApi, ItemIdSource, MultiPutItem, MultiPutResponse, PutContent,
    RemoteItem, RequestLogEntry,
};
pub use errors::{FileApiError, Result};
pub use memory::MemoryFileApi;
