//! Document repository core: lazily bootstrapped repositories, sessions with
//! private caches, and cache invalidation across sessions and processes.

pub mod binary;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod invalidation;
pub mod logging;
pub mod mapper;
pub mod model;
pub mod repository;
pub mod session;

pub use binary::{BinaryManager, BinaryRef};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RepositoryConfig;
pub use db::Dialect;
pub use error::{RepoError, RepoResult};
pub use invalidation::{InvalidationKind, Invalidations};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{
    DocId, Document, DocumentType, Field, FieldKind, PropertyValue, Schema, SchemaManager,
    StaticSchemaManager,
};
pub use repository::{ClusterPoller, InitStats, PollOutcome, Repository};
pub use session::{Credentials, Session, SessionId};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
