//! Connection audit trail: masking and the asynchronous logger.

pub mod logger;
pub mod masking;

pub use logger::{LogRecordBuilder, RequestLogger, spawn_retention_task};
pub use masking::Masker;
