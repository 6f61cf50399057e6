//! Credentials for talking to a remote database.
//!
//! Every authenticator attaches its credentials to each request up front
//! rather than waiting for a 401 challenge. Cookie-based authenticators
//! additionally drive the session check and login step that runs before a
//! replication fetches its checkpoint:
//!
//! ```text
//! GET <db>/_session ──404──▶ GET <server>/_session
//!        │
//!        ├── userCtx.name set ──▶ checkpoint
//!        └── no user ──▶ login_parameters()? ──None──▶ checkpoint
//!                               │
//!                               └── POST <db>/<login_path> ──▶ checkpoint
//! ```

use reqwest::RequestBuilder;
use serde_json::{Map, Value};
use std::fmt;

/// Attaches credentials to outgoing requests.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Add credentials to a request.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }

    /// Whether a session check and login should precede replication.
    fn uses_cookie_based_login(&self) -> bool {
        false
    }

    /// Login path, relative to the remote database URL.
    fn login_path(&self) -> Option<String> {
        None
    }

    /// Body to POST to [`login_path`](Self::login_path). `None` skips login.
    fn login_parameters(&self) -> Option<Map<String, Value>> {
        None
    }
}

/// HTTP Basic credentials.
#[derive(Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("username", &self.username)
            .field("password", &"---")
            .finish()
    }
}

impl Authenticator for BasicAuthenticator {
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.username, Some(&self.password))
    }
}

/// Logs in by POSTing parameters; the session cookie then rides in the
/// client's cookie store.
#[derive(Clone)]
pub struct CookieAuthenticator {
    login_path: String,
    parameters: Option<Map<String, Value>>,
}

impl CookieAuthenticator {
    pub fn new(login_path: impl Into<String>, parameters: Option<Map<String, Value>>) -> Self {
        Self {
            login_path: login_path.into(),
            parameters,
        }
    }

    /// CouchDB `_session` login with a name and password.
    pub fn couch_session(name: &str, password: &str) -> Self {
        let mut params = Map::new();
        params.insert("name".into(), Value::String(name.to_string()));
        params.insert("password".into(), Value::String(password.to_string()));
        Self::new("/_session", Some(params))
    }
}

impl fmt::Debug for CookieAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieAuthenticator")
            .field("login_path", &self.login_path)
            .field("has_parameters", &self.parameters.is_some())
            .finish()
    }
}

impl Authenticator for CookieAuthenticator {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_path(&self) -> Option<String> {
        Some(self.login_path.clone())
    }

    fn login_parameters(&self) -> Option<Map<String, Value>> {
        self.parameters.clone()
    }
}

/// Bearer token credentials.
#[derive(Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenAuthenticator { .. }")
    }
}

impl Authenticator for TokenAuthenticator {
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }
}

/// User name from a `_session` response, if a user is logged in.
pub fn session_user(response: &Value) -> Option<&str> {
    response
        .get("userCtx")?
        .get("name")?
        .as_str()
        .filter(|name| !name.is_empty())
}
