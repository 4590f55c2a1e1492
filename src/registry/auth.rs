//! Authentication module for registry access
//!
//! Holds the per-registry [`Credential`], parses `WWW-Authenticate`
//! challenges and caches registry tokens obtained from a challenge realm.

use crate::error::{Result, SyncerError};
use reqwest::RequestBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Lifetime assumed for tokens without `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);

/// Refresh tokens slightly before the registry would reject them
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(5);

/// Credential used for every request an instance makes
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Credential {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    /// OAuth2 refresh token from a credential helper, exchanged at the token realm
    IdentityToken {
        token: String,
    },
}

impl Credential {
    /// Select the credential mode from configured values.
    ///
    /// A token wins over username and password; nothing means anonymous.
    pub fn from_parts(username: &str, password: &str, token: &str) -> Result<Self> {
        match (username.is_empty(), password.is_empty(), token.is_empty()) {
            (_, _, false) => Ok(Credential::Bearer {
                token: token.to_string(),
            }),
            (false, false, true) => Ok(Credential::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (false, true, true) => Err(SyncerError::Config(
                "Password is required when username is provided".to_string(),
            )),
            (true, false, true) => Err(SyncerError::Config(
                "Username is required when password is provided".to_string(),
            )),
            (true, true, true) => Ok(Credential::Anonymous),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Credential::Anonymous => "anonymous",
            Credential::Basic { .. } => "basic",
            Credential::Bearer { .. } => "bearer",
            Credential::IdentityToken { .. } => "identity-token",
        }
    }

    /// Attach this credential to a request. Identity tokens are never sent directly.
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::Anonymous | Credential::IdentityToken { .. } => request,
            Credential::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credential::Bearer { token } => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
            Credential::IdentityToken { .. } => f
                .debug_struct("IdentityToken")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// Parse a challenge header such as
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`.
pub fn parse_challenge(header: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(AuthChallenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let params = parse_params(params);
    let realm = params.get("realm")?.clone();
    Some(AuthChallenge::Bearer {
        realm,
        service: params.get("service").cloned(),
        scope: params.get("scope").cloned(),
    })
}

/// Split `key="value",key=value` pairs, honouring commas inside quotes
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

/// Response body of a token realm
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub fn into_token(self) -> Result<(String, Duration)> {
        let lifetime = self
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        self.token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .map(|t| (t, lifetime))
            .ok_or_else(|| SyncerError::Decode("token response carried no token".to_string()))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Registry tokens keyed by scope
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token for `scope`, if one is cached and still valid
    pub fn get(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().ok()?;
        tokens
            .get(scope)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }

    pub fn insert(&self, scope: &str, token: String, lifetime: Duration) {
        let lifetime = lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN);
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(
                scope.to_string(),
                CachedToken {
                    token,
                    expires_at: Instant::now() + lifetime,
                },
            );
        }
    }
}
