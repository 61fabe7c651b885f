// spauth - Library root

pub mod auth;
pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod http_client;
pub mod secret;
pub mod store;
pub mod templates;

pub use auth::{AuthContext, AuthScheme, AuthToken, CredentialStrategy, StrategyKind};
pub use config::AuthSettings;
pub use digest::DigestCache;
pub use error::{AuthError, Result};
pub use http_client::{SiteClient, SiteResponse};
