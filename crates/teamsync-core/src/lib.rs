//! TeamSync core - session reconciliation, credential storage, and the
//! query cache with its invalidation protocol.
//!
//! Consumers build one [`AppContext`] at startup, call [`AppContext::boot`]
//! to reconcile the persisted session with the stored credential, then read
//! through [`AppContext::query`] and write through [`AppContext::mutate`].

pub mod api;
pub mod app;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use app::AppContext;
pub use config::Config;
