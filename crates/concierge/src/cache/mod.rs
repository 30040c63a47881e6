//! Session-wide query cache.

mod entry;
mod store;

pub use entry::{CacheNotification, CacheStats, Entry, NotificationKind, Payload};
pub use store::{CacheStore, FetchHandle, FetchResult, FetchTicket, RollbackToken, SharedFetch};
