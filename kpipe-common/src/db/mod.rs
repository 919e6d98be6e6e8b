//! SQLite access shared by the Status Store and the Stream Broker

pub mod init;
pub mod retry;

pub use init::*;
pub use retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
