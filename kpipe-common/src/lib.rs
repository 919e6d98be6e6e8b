//! # Karaoke Pipeline Common Library
//!
//! Shared code for every pipeline stage worker:
//! - Pipeline status model and topic names
//! - Status Store (per-file authoritative position in the pipeline)
//! - Stream Broker (append-only topics with consumer groups)
//! - Configuration loading
//! - SQLite pool initialisation

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod status;
pub mod store;
pub mod topics;

pub use broker::{MemoryBroker, MessageId, SqliteBroker, StreamBroker, StreamMessage, WorkMessage};
pub use error::{Error, Result};
pub use status::{FileError, FileRecord, FileStatus};
pub use topics::StageKind;
pub use store::{MemoryStatusStore, SqliteStatusStore, StatusStore};
