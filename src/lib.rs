//! Offline-first persistence for a personal data tracker: record storage
//! with a transactional backend and a flat fallback, plus a versioned
//! response cache with install/activate sequencing.

pub mod cache;
pub mod commands;
pub mod config;
pub mod logging;
pub mod store;
