//! Registry and watch layer standing in for the orchestration API server.
//!
//! `StateStore` persists raw bytes in SlateDB and records every mutation in an
//! `EventLog`; `Registry` adds typed access with optimistic concurrency on
//! `resource_version`.

pub mod client;
pub mod error;
pub mod registry;
pub mod watch;
