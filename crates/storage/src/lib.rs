//! Conveyor persistence layer.
//!
//! Task records live in SQLite behind the [`TaskStore`] trait; the engine
//! talks to a [`TaskCache`] that serves reads from memory and funnels all
//! writes through one ordered queue. A small [`PrefsStore`] in the same
//! database keeps queue-wide settings across restarts.

#![warn(missing_docs)]

mod cache;
mod prefs;
mod record;
mod sqlite_store;
mod trait_;

pub use cache::{CacheError, PersistTicket, TaskCache};
pub use prefs::PrefsStore;
pub use record::{TaskPatch, TaskRow};
pub use sqlite_store::SqliteTaskStore;
pub use trait_::{Result, StorageError, TaskStore};
