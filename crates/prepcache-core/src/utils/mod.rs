//! Utility functions for string formatting.

pub mod format;

pub use format::{format_phone, truncate_string};
