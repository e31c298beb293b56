pub mod thread_store;

pub use thread_store::{SqliteThreadStore, StoredMessage, ThreadStore, ThreadSummary};
