//! Local caching module for offline data access.
//!
//! This module provides the `CacheManager`, the per-user store that the
//! sync engine fills and the UI reads. Data is cached as JSON (optionally
//! encrypted) with one file per entity group:
//!
//! - profile, communities, guides, emergency contacts
//! - the pending mutation queue
//! - sync metadata (last sync time, per-group version markers)

pub mod cipher;
pub mod manager;

pub use cipher::CacheCipher;
pub use manager::{format_age, CacheAges, CacheManager, CachedCollections, CachedData};
