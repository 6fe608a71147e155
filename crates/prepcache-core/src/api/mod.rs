//! REST client for the hosted Postgres data service.
//!
//! This module provides the `ApiClient`, which reads entity groups, probes
//! them cheaply for changes, and uploads queued mutations through the
//! PostgREST interface of the service.
//!
//! Requests carry the project's anon key plus the member's bearer token;
//! row visibility is enforced server-side.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
