//! Edge caching core of a minimal CDN.
//!
//! An in-process HTTP reverse proxy that serves `GET`/`HEAD` traffic from a
//! two-tier (memory + disk) cache governed by HTTP freshness rules,
//! coalesces concurrent misses to the origin, revalidates stale entries
//! conditionally, and distributes origin load across upstream peers via
//! consistent hashing.

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod disk;
pub mod error;
pub mod freshness;
pub mod handlers;
pub mod origin;
pub mod range;
pub mod ring;
