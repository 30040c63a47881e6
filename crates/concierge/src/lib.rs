//! Client-side cache synchronization and optimistic writes for property
//! management data.
//!
//! A [`Session`] owns one [`cache::CacheStore`] shared by every screen. Reads
//! go through the [`query::QueryCoordinator`], writes through the
//! [`mutation::MutationCoordinator`], and remote changes arrive through the
//! [`feed::ChangeFeedListener`]. All three invalidate with the same routing
//! rules from `concierge_core::invalidation`.

pub mod cache;
pub mod config;
pub mod feed;
pub mod gateway;
pub mod mock_data;
pub mod mutation;
pub mod query;
pub mod reports;
pub mod resource;
mod retry;
pub mod session;

pub use config::Config;
pub use resource::{DetailView, ListView, Resource};
pub use session::Session;
