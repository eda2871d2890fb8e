//! Utility functions for display formatting.

pub mod format;

pub use format::{format_age, redact, truncate_string};
