//! iFlow OAuth authentication library
//!
//! Handles the iFlow OAuth provider interactions: authorization URL
//! construction, authorization-code exchange, token refresh, and the
//! user-info lookup that mints the inference api key. This crate is a
//! standalone library with no dependency on the gateway binary.
//!
//! Credential flow:
//! 1. User authorizes via `build_authorization_url()`
//! 2. `exchange_code()` trades the authorization code for OAuth tokens
//! 3. `fetch_user_info()` resolves the inference `apiKey` for the session
//! 4. The pool's refresher calls `IFlowOAuth::refresh()` before expiry,
//!    which repeats steps 2–3 with the refresh-token grant
//!
//! The gateway itself only exercises step 4. Steps 1–3 exist for the
//! account-enrollment tooling that adds OAuth accounts to the keys file;
//! that tool links this crate directly and performs the interactive flow
//! against the local redirect listener.

pub mod authorize;
pub mod constants;
pub mod error;
pub mod provider;
pub mod token;

pub use authorize::build_authorization_url;
pub use constants::*;
pub use error::{Error, Result};
pub use provider::IFlowOAuth;
pub use token::{TokenResponse, UserInfo, exchange_code, fetch_user_info, refresh_token};
