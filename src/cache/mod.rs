//! Offline caching layer for the app shell and its network traffic.
//!
//! This module provides:
//! - Named, versioned cache partitions (static, runtime, api) over a
//!   pluggable [`CacheStorage`]
//! - Per-request routing to network-first, stale-while-revalidate or
//!   cache-first strategies
//! - FIFO bounds on the runtime and api partitions
//! - Install/activate sequencing with old-version pruning

mod eviction;
mod http;
mod lifecycle;
mod router;
mod storage;
#[cfg(test)]
mod testing;
mod traits;
mod versions;

pub use eviction::EvictionPolicy;
pub use http::{FetchOptions, Fetcher, HttpFetcher, Request, RequestMode, Response};
pub use lifecycle::{Client, ControlMessage, LifecycleManager, LifecycleState, Worker};
pub use router::{FetchEvent, FetchRouter, PreloadResponse, Route};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{Served, ServedFrom};
pub use versions::{CacheVersionSet, Manifest};
