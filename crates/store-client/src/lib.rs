#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Document-store clients and persisted record shapes for the bookforge
//! pipeline: an HTTP-backed [`DocumentStore`] for production use, an
//! in-memory one for tests and offline runs, and the record types the job
//! drivers round-trip through whichever store is in play.

pub mod http_store;
pub mod memory_store;
pub mod records;

pub use bookforge_scheduler_core::store::DocumentStore;
pub use http_store::HttpDocumentStore;
pub use memory_store::InMemoryDocumentStore;
pub use records::{AudioSegment, Book, OcrResultRecord};
