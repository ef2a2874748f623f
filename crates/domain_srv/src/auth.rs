//! Admin HTTP authentication: OAuth + admin list, HTTP Basic, or open.
//!
//! The strategies are mutually exclusive per deployment and resolved
//! from the settings store at startup. Misconfiguration is fatal with
//! a documented exit code, never a silently-open server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use torii_api::*;

/// Environment variable overriding the OAuth client secret.
pub const CLIENT_SECRET_ENV: &str = "DOMAIN_SERVER_CLIENT_SECRET";

/// The admin session cookie name.
pub const SESSION_COOKIE: &str = "torii_domain_session";

/// Admin sessions live for one month.
const SESSION_LIFETIME: std::time::Duration =
    std::time::Duration::from_secs(60 * 60 * 24 * 30);

/// Why auth could not be configured, with its process exit code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthConfigError {
    /// Admin users/roles are configured but no OAuth provider URL.
    #[error("admin users/roles configured without an oauth provider url")]
    MissingProviderUrl,
    /// An OAuth provider is configured but the client id/secret is
    /// missing.
    #[error("oauth provider configured without client id/secret")]
    MissingClientConfig,
}

impl AuthConfigError {
    /// The documented process exit code for this misconfiguration.
    pub fn exit_code(&self) -> i32 {
        match self {
            AuthConfigError::MissingClientConfig => 4,
            AuthConfigError::MissingProviderUrl => 5,
        }
    }
}

/// The resolved authentication strategy.
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    /// Every request is accepted.
    Open,
    /// HTTP Basic against a configured username and SHA-256 password
    /// hash.
    Basic {
        /// The configured admin username.
        username: String,
        /// Lowercase hex SHA-256 of the admin password.
        password_sha256_hex: String,
    },
    /// OAuth against the metaverse provider plus an admin allow-list.
    OAuth(Arc<OAuthAuth>),
}

impl AuthStrategy {
    /// Resolve the strategy from settings.
    pub fn from_settings(
        settings: &SettingsStore,
    ) -> Result<AuthStrategy, AuthConfigError> {
        let provider: String =
            settings.get_or("security.oauth_provider", String::new());
        let admin_users: Vec<String> =
            settings.get_or("security.admin_users", Vec::new());
        let admin_roles: Vec<String> =
            settings.get_or("security.admin_roles", Vec::new());

        let wants_oauth =
            !admin_users.is_empty() || !admin_roles.is_empty();
        if !provider.is_empty() || wants_oauth {
            if provider.is_empty() {
                return Err(AuthConfigError::MissingProviderUrl);
            }
            let client_id: String = settings
                .get_or("security.oauth_client_id", String::new());
            let client_secret = std::env::var(CLIENT_SECRET_ENV)
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| {
                    settings.get_or(
                        "security.oauth_client_secret",
                        String::new(),
                    )
                });
            if client_id.is_empty() || client_secret.is_empty() {
                return Err(AuthConfigError::MissingClientConfig);
            }
            return Ok(AuthStrategy::OAuth(Arc::new(OAuthAuth {
                provider: provider.trim_end_matches('/').to_string(),
                client_id,
                client_secret,
                admin_users,
                admin_roles,
                pending_states: Mutex::new(HashSet::new()),
                sessions: Mutex::new(HashMap::new()),
            })));
        }

        let username: String =
            settings.get_or("security.http_username", String::new());
        let password: String =
            settings.get_or("security.http_password", String::new());
        if !username.is_empty() && !password.is_empty() {
            return Ok(AuthStrategy::Basic {
                username,
                password_sha256_hex: password.to_lowercase(),
            });
        }

        Ok(AuthStrategy::Open)
    }

    /// Check an `Authorization: Basic` header value against the
    /// configured credentials.
    pub fn check_basic(&self, authorization: Option<&str>) -> bool {
        let (username, password_hash) = match self {
            AuthStrategy::Basic {
                username,
                password_sha256_hex,
            } => (username, password_sha256_hex),
            _ => return false,
        };

        let encoded = match authorization
            .and_then(|a| a.strip_prefix("Basic "))
        {
            Some(encoded) => encoded,
            None => return false,
        };

        use base64::prelude::*;
        let decoded = match BASE64_STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
        {
            Some(decoded) => decoded,
            None => return false,
        };
        let (user, pass) = match decoded.split_once(':') {
            Some(split) => split,
            None => return false,
        };

        use sha2::Digest;
        let digest = sha2::Sha256::digest(pass.as_bytes());
        let hex: String =
            digest.iter().map(|b| format!("{b:02x}")).collect();

        user == username && &hex == password_hash
    }
}

struct Session {
    username: String,
    expires: Timestamp,
}

/// The OAuth admin flow state: pending authorization states and the
/// issued sessions.
pub struct OAuthAuth {
    provider: String,
    client_id: String,
    client_secret: String,
    admin_users: Vec<String>,
    admin_roles: Vec<String>,
    pending_states: Mutex<HashSet<uuid::Uuid>>,
    sessions: Mutex<HashMap<uuid::Uuid, Session>>,
}

impl std::fmt::Debug for OAuthAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthAuth")
            .field("provider", &self.provider)
            .finish()
    }
}

impl OAuthAuth {
    /// Begin the flow: record a fresh state uuid and return the
    /// provider authorization URL to redirect to.
    pub fn begin(&self, request_host: &str) -> String {
        let state = uuid::Uuid::new_v4();
        self.pending_states.lock().unwrap().insert(state);
        format!(
            "{}/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&state={}",
            self.provider,
            url_encode(&self.client_id),
            url_encode(&format!("http://{request_host}/oauth")),
            state,
        )
    }

    /// `true` if the session cookie header carries a live admin
    /// session.
    pub fn check_cookie(&self, cookie_header: Option<&str>) -> bool {
        let id = match cookie_header.and_then(session_cookie_value) {
            Some(id) => id,
            None => return false,
        };
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&id) {
            Some(session) if session.expires > Timestamp::now() => true,
            Some(_) => {
                sessions.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Complete the flow: verify the state, exchange the code for a
    /// token, fetch the profile, and issue a session cookie when the
    /// user is on the admin list. Returns the `Set-Cookie` value.
    pub async fn callback(
        &self,
        code: String,
        state: String,
        request_host: String,
    ) -> ToriiResult<String> {
        let state: uuid::Uuid = state
            .parse()
            .map_err(|_| ToriiError::other("malformed oauth state"))?;
        if !self.pending_states.lock().unwrap().remove(&state) {
            return Err(ToriiError::other("unknown oauth state"));
        }

        let token_url = format!("{}/oauth/token", self.provider);
        let form = format!(
            "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&client_secret={}",
            url_encode(&code),
            url_encode(&format!("http://{request_host}/oauth")),
            url_encode(&self.client_id),
            url_encode(&self.client_secret),
        );
        let profile_url =
            format!("{}/api/v1/user/profile", self.provider);

        let profile = tokio::task::spawn_blocking(move || {
            exchange_and_fetch_profile(&token_url, &form, &profile_url)
        })
        .await
        .map_err(|e| ToriiError::other_src("oauth task", e))??;

        let is_admin = self
            .admin_users
            .iter()
            .any(|u| u.eq_ignore_ascii_case(&profile.username))
            || profile.roles.iter().any(|role| {
                self.admin_roles
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(role))
            });
        if !is_admin {
            return Err(ToriiError::other(format!(
                "user {} is not a domain admin",
                profile.username
            )));
        }

        let id = uuid::Uuid::new_v4();
        self.sessions.lock().unwrap().insert(
            id,
            Session {
                username: profile.username.clone(),
                expires: Timestamp::now() + SESSION_LIFETIME,
            },
        );
        tracing::info!(username = %profile.username,
            "issued admin session");
        Ok(format!(
            "{SESSION_COOKIE}={id}; Max-Age={}; HttpOnly; Path=/",
            SESSION_LIFETIME.as_secs(),
        ))
    }

    /// The username behind a session cookie, for audit logs.
    pub fn session_username(
        &self,
        cookie_header: Option<&str>,
    ) -> Option<String> {
        let id = cookie_header.and_then(session_cookie_value)?;
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.username.clone())
    }
}

struct Profile {
    username: String,
    roles: Vec<String>,
}

fn exchange_and_fetch_profile(
    token_url: &str,
    form: &str,
    profile_url: &str,
) -> ToriiResult<Profile> {
    #[derive(serde::Deserialize)]
    struct Token {
        access_token: String,
    }

    let token: Token = ureq::post(token_url)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .send(form.as_bytes())
        .map_err(|e| ToriiError::other_src("oauth token exchange", e))?
        .body_mut()
        .read_json()
        .map_err(|e| ToriiError::other_src("oauth token response", e))?;

    #[derive(serde::Deserialize)]
    struct User {
        username: String,
        #[serde(default)]
        roles: Vec<String>,
    }
    #[derive(serde::Deserialize)]
    struct Data {
        user: User,
    }
    #[derive(serde::Deserialize)]
    struct Envelope {
        data: Data,
    }

    let envelope: Envelope = ureq::get(profile_url)
        .header(
            "Authorization",
            &format!("Bearer {}", token.access_token),
        )
        .call()
        .map_err(|e| ToriiError::other_src("oauth profile fetch", e))?
        .body_mut()
        .read_json()
        .map_err(|e| ToriiError::other_src("oauth profile response", e))?;

    Ok(Profile {
        username: envelope.data.user.username,
        roles: envelope.data.user.roles,
    })
}

fn session_cookie_value(header: &str) -> Option<uuid::Uuid> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE {
            value.parse().ok()
        } else {
            None
        }
    })
}

fn url_encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
