//! Repository clients for drift.
//!
//! [`Repository`] is the capability set the sync engine needs from a remote
//! content store. Implementations:
//! - [`MemoryRepository`]: in-process reference implementation
//! - [`FileRepository`]: a directory tree, e.g. on a shared mount
//! - [`HttpRepository`]: a REST endpoint
//! - [`InstrumentedRepository`]: wraps any of the above with call
//!   accounting and fault injection

mod error;
mod file_repo;
mod http_repo;
mod instrumented;
mod memory_repo;
mod traits;

pub use error::RepoError;
pub use file_repo::FileRepository;
pub use http_repo::HttpRepository;
pub use instrumented::{InstrumentedRepository, RepoEvent, RepoOp};
pub use memory_repo::MemoryRepository;
pub use traits::Repository;
