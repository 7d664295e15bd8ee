//! Authentication for Folio.
//!
//! [`TokenService`] signs and checks HS256 tokens; [`Identity`] is the axum
//! extractor that turns a request's token into the caller's identity.

pub mod identity;
pub mod token;

pub use identity::Identity;
pub use token::{AuthError, Claims, TokenService};
