//! Coordination and results plumbing for load-test runs

pub mod batch;
pub mod commune;
pub mod config;
#[cfg(feature = "postgres")]
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod message;
pub mod point;
pub mod retry;
pub mod statement;
pub mod storage;
pub mod tracer;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::batch::{Batch, BatchAccumulator};
    pub use crate::config::{StressConfig, load_config};
    pub use crate::coordinator::{Coordinator, TestState, WorkerChannels};
    pub use crate::error::{Result, StressError, TracerError};
    pub use crate::message::{Directive, Package, PackageKind, Response};
    pub use crate::point::{FieldValue, Point, Precision};
    pub use crate::retry::{RetryConfig, execute_with_retry};
    pub use crate::statement::{SetStatement, Statement};
    pub use crate::storage::{MeasurementStore, MemoryStore, Query, QueryResponse, Series};
    pub use crate::tracer::Tracer;
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
