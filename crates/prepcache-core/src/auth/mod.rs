//! Credential storage for the member's access token.
//!
//! Issuing tokens is the job of the hosted auth service; this module only
//! keeps an already issued token in the OS keychain between runs.

pub mod credentials;

pub use credentials::CredentialStore;
