//! # auth-adapters
//!
//! Sessions for the comment engine: signed tokens in cookies, axum middleware that
//! resolves the current user, and the identity providers users log in with.

pub mod avatar;
pub mod error;
pub mod middleware;
pub mod providers;
pub mod service;
pub mod token;

pub use avatar::AvatarProxy;
pub use error::AuthError;
pub use middleware::{admin_only, auth, trace, AuthState, AuthUser, MaybeUser};
pub use providers::apple::{AppleParams, AppleProvider};
pub use providers::oauth1::{OAuth1Params, OAuth1Provider};
pub use providers::oauth2::{OAuth2Params, OAuth2Provider};
pub use providers::telegram::TelegramLogin;
pub use providers::verify::{Channel, VerifyProvider};
pub use providers::{AuthContext, LoginRequest, Provider};
pub use service::AuthService;
pub use token::{Claims, Flags, KeyStore, SameSite, SiteKeys, TokenParams, TokenService};
