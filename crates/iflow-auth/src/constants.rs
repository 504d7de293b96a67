//! iFlow OAuth constants
//!
//! Public OAuth client configuration matching the iFlow CLI. These values
//! identify the public client application, not a user. The per-account
//! secrets (access/refresh tokens, api keys) live in the keys file managed
//! by the pool crate.

/// iFlow's public OAuth client ID (same as the iFlow CLI)
pub const IFLOW_CLIENT_ID: &str = "10009311001";

/// OAuth client secret for the public CLI client
pub const IFLOW_CLIENT_SECRET: &str = "4Z3YjXycVsQvyGF1etiNlIBB4RsqSDtW";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://iflow.cn/oauth/token";

/// User-info endpoint; the response carries the inference `apiKey`
pub const USER_INFO_ENDPOINT: &str = "https://iflow.cn/api/oauth/getUserInfo";

/// Authorization endpoint for the browser login flow
pub const AUTHORIZE_ENDPOINT: &str = "https://iflow.cn/oauth";

/// Loopback redirect used by the CLI-style login flow
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:11451/oauth2callback";
