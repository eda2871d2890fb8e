//! Platform API access.
//!
//! The core depends only on the [`IdentityVerifier`] and [`EntityService`]
//! traits; [`ApiClient`] is the HTTP implementation of both. Requests carry
//! the stored access token as a bearer token.

pub mod client;
pub mod error;
pub mod service;

pub use client::ApiClient;
pub use error::ApiError;
pub use service::{EntityService, IdentityVerifier};
