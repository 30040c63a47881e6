//! Functional core of the concierge cache synchronization layer.
//!
//! Everything in this crate is pure: key construction, pattern matching,
//! invalidation routing, optimistic projections and report aggregation.
//! The imperative shell (`concierge`) owns the cache state, spawns tasks and
//! talks to the remote gateway through the traits defined in [`gateway`].

pub mod cache;
pub mod domain;
pub mod gateway;
pub mod invalidation;
pub mod mutation;
pub mod optimistic;
pub mod policy;
pub mod reports;
