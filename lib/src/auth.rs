//! Registry authentication: challenge discovery, the Basic and Bearer flows,
//! and the per-scope token cache.
//!
//! A registry advertises how it wants to be talked to via the
//! `WWW-Authenticate` header on `GET /v2/`. The engine probes that endpoint
//! once per client, remembers the challenge, and from then on answers
//! "what Authorization header goes on this request" for a given scope.
//! Bearer tokens are cached per rendered scope; a cache slot is locked for
//! the duration of a fetch so concurrent requests for the same scope produce
//! exactly one token-endpoint round trip.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::WWW_AUTHENTICATE;
use serde::Deserialize;
use strum::EnumString;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, trace};

use crate::{Authentication, Error, Result};

/// The client identifier sent to token servers.
pub const CLIENT_ID: &str = "stevedore";

/// Tokens within this many seconds of expiry are treated as already expired.
const TOKEN_GRACE_SECONDS: i64 = 60;

/// Lifetime assumed for token responses that don't state one.
const DEFAULT_EXPIRY_SECONDS: i64 = 60;

/// The authentication scheme named by a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, strum::Display)]
pub enum ChallengeScheme {
    Basic,
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The scheme the registry demands.
    pub scheme: ChallengeScheme,

    /// The token endpoint, for Bearer challenges.
    pub realm: String,

    /// The service name to present to the token endpoint.
    pub service: String,
}

impl Challenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Parameter values may be quoted or bare. A Bearer challenge without a
    /// realm is useless and therefore malformed.
    pub fn parse(header: &str) -> Result<Self> {
        let malformed = || Error::MalformedChallenge(header.to_string());

        let (scheme, params) = match header.trim().split_once(' ') {
            Some((scheme, params)) => (scheme, params.trim()),
            None => (header.trim(), ""),
        };
        let scheme = ChallengeScheme::from_str(scheme).map_err(|_| malformed())?;
        let params = parse_params(params).ok_or_else(malformed)?;

        let lookup = |key: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.clone())
        };

        let realm = lookup("realm").unwrap_or_default();
        let service = lookup("service").unwrap_or_default();
        if scheme == ChallengeScheme::Bearer && realm.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            scheme,
            realm,
            service,
        })
    }
}

/// Split an auth-param list (`key="value", other=bare`) into pairs.
/// Returns `None` when the list doesn't scan.
fn parse_params(input: &str) -> Option<Vec<(String, String)>> {
    let mut params = Vec::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(',') || key.contains(' ') {
            return None;
        }
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"')?;
            let value = &quoted[..end];
            rest = quoted[end + 1..].trim_start();
            value.to_string()
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim();
            rest = &rest[end..];
            value.to_string()
        };

        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        params.push((key.to_string(), value));
    }

    Some(params)
}

/// What a token must grant: access to a repository, to a registry-level
/// resource, or to nothing in particular.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// No specific grant.
    Empty,

    /// Actions on a repository, e.g. `repository:library/ubuntu:pull`.
    Repository { name: String, actions: Vec<String> },

    /// Actions on a registry resource, e.g. `registry:catalog:*`.
    Registry { name: String, actions: Vec<String> },
}

impl Scope {
    /// Pull access to a repository.
    pub fn pull(name: impl Into<String>) -> Self {
        Self::Repository {
            name: name.into(),
            actions: vec!["pull".to_string()],
        }
    }

    /// Delete access to a repository.
    pub fn delete(name: impl Into<String>) -> Self {
        Self::Repository {
            name: name.into(),
            actions: vec!["delete".to_string()],
        }
    }

    /// Access to the registry catalog.
    pub fn catalog() -> Self {
        Self::Registry {
            name: "catalog".to_string(),
            actions: vec!["*".to_string()],
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Empty => Ok(()),
            Scope::Repository { name, actions } => {
                write!(f, "repository:{name}:{}", actions.join(","))
            }
            Scope::Registry { name, actions } => {
                write!(f, "registry:{name}:{}", actions.join(","))
            }
        }
    }
}

/// A cached bearer token: the ready-to-send header value and when it stops
/// being trustworthy.
#[derive(Debug, Clone)]
struct Token {
    header: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    fn fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(TOKEN_GRACE_SECONDS) < self.expires_at
    }
}

/// The JSON a token endpoint answers with.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,

    #[serde(default)]
    access_token: Option<String>,

    #[serde(default = "default_expiry")]
    expires_in: i64,

    #[serde(default)]
    issued_at: Option<String>,
}

fn default_expiry() -> i64 {
    DEFAULT_EXPIRY_SECONDS
}

type CacheSlot = Arc<Mutex<Option<Token>>>;

/// Per-registry authentication state.
#[derive(Debug)]
pub(crate) struct AuthEngine {
    client: reqwest::Client,
    base_url: String,
    authentication: Authentication,
    metadata_timeout: std::time::Duration,
    challenge: OnceCell<Option<Challenge>>,
    cache: std::sync::Mutex<HashMap<String, CacheSlot>>,
}

impl AuthEngine {
    pub(crate) fn new(
        client: reqwest::Client,
        base_url: String,
        authentication: Authentication,
        metadata_timeout: std::time::Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            authentication,
            metadata_timeout,
            challenge: OnceCell::new(),
            cache: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The registry's challenge, probing `/v2/` on first use.
    /// Concurrent callers race; the first to finish publishes for everyone.
    pub(crate) async fn challenge(&self) -> Result<Option<&Challenge>> {
        self.challenge
            .get_or_try_init(|| self.ping())
            .await
            .map(Option::as_ref)
    }

    /// The scheme the registry demands, if any.
    pub(crate) async fn scheme(&self) -> Result<Option<ChallengeScheme>> {
        Ok(self.challenge().await?.map(|challenge| challenge.scheme))
    }

    async fn ping(&self) -> Result<Option<Challenge>> {
        let url = format!("{}/v2/", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.metadata_timeout)
            .send()
            .await?;

        let Some(header) = response.headers().get(WWW_AUTHENTICATE) else {
            debug!(%url, "registry requires no authentication");
            return Ok(None);
        };
        let header = header
            .to_str()
            .map_err(|_| Error::MalformedChallenge("header is not valid ascii".to_string()))?;
        Challenge::parse(header).map(Some)
    }

    /// The `Authorization` header value for a request under the given scope,
    /// or `None` when the registry wants nothing.
    pub(crate) async fn authorization(&self, scope: &Scope) -> Result<Option<String>> {
        let Some(challenge) = self.challenge().await? else {
            return Ok(None);
        };
        match challenge.scheme {
            ChallengeScheme::Basic => self.basic_header().map(Some),
            ChallengeScheme::Bearer => self.bearer_header(challenge, scope).await.map(Some),
        }
    }

    /// Drop the cached token for a scope so the next request fetches anew.
    pub(crate) async fn invalidate(&self, scope: &Scope) {
        let slot = self.slot(scope);
        *slot.lock().await = None;
    }

    fn basic_header(&self) -> Result<String> {
        let (username, password) = self.authentication.credentials().ok_or_else(|| {
            Error::Unauthorized {
                registry: self.base_url.clone(),
            }
        })?;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        Ok(format!("Basic {encoded}"))
    }

    async fn bearer_header(&self, challenge: &Challenge, scope: &Scope) -> Result<String> {
        let slot = self.slot(scope);
        // Holding the slot across the fetch is what makes same-scope
        // requests single-flight; other scopes use other slots.
        let mut guard = slot.lock().await;

        if let Some(token) = guard.as_ref() {
            if token.fresh(Utc::now()) {
                trace!(%scope, "token cache hit");
                return Ok(token.header.clone());
            }
        }

        let token = self.fetch_token(challenge, scope).await?;
        let header = token.header.clone();
        *guard = Some(token);
        Ok(header)
    }

    fn slot(&self, scope: &Scope) -> CacheSlot {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.entry(scope.to_string()).or_default().clone()
    }

    async fn fetch_token(&self, challenge: &Challenge, scope: &Scope) -> Result<Token> {
        let (username, password) = self.authentication.credentials().unwrap_or(("", ""));
        let anonymous = username.is_empty() && password.is_empty();

        let mut request = self
            .client
            .get(&challenge.realm)
            .timeout(self.metadata_timeout)
            .query(&[
                ("scope", scope.to_string().as_str()),
                ("service", challenge.service.as_str()),
                ("client_id", CLIENT_ID),
                ("account", username),
            ]);

        // Docker Hub answers anonymous exchanges only when no Authorization
        // header is present at all; other registries accept empty basic auth.
        if !(anonymous && realm_is_docker_hub(&challenge.realm)) {
            request = request.basic_auth(username, Some(password));
        }

        debug!(realm = %challenge.realm, %scope, "fetching bearer token");
        let response = request.send().await.map_err(|err| Error::AuthFailure {
            reason: err.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(Error::AuthFailure {
                reason: format!("token endpoint returned {}", response.status()),
            });
        }
        let body: TokenResponse = response.json().await.map_err(|err| Error::AuthFailure {
            reason: format!("invalid token response: {err}"),
        })?;

        let value = body
            .access_token
            .filter(|token| !token.is_empty())
            .unwrap_or(body.token);
        if value.is_empty() {
            return Err(Error::AuthFailure {
                reason: "token response carried no token".to_string(),
            });
        }

        let issued_at = body
            .issued_at
            .as_deref()
            .and_then(|issued| DateTime::parse_from_rfc3339(issued).ok())
            .map(|issued| issued.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Token {
            header: format!("Bearer {value}"),
            expires_at: issued_at + Duration::seconds(body.expires_in),
        })
    }
}

fn realm_is_docker_hub(realm: &str) -> bool {
    reqwest::Url::parse(realm)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.ends_with("docker.io")))
        .unwrap_or(false)
}
