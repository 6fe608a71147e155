//! prepcache-core: offline cache and sync for community preparedness data.
//!
//! The crate keeps a per-member local copy of profile, community, guide and
//! emergency-contact data so it stays readable without network access, and
//! keeps that copy in step with the hosted Postgres service:
//!
//! - `cache`: per-user JSON store (optionally encrypted) and pending writes
//! - `api`: PostgREST client implementing `remote::RemoteStore`
//! - `sync`: change detection, sync engine and coordinator
//! - `config`, `auth`: settings file and keychain-held access tokens

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod remote;
pub mod sync;
pub mod utils;
