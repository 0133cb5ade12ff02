//! # Authentication & Access
//!
//! Bearer-token verification and role checks.
//!
//! RS256 tokens are verified against the auth domain's published key set,
//! fetched through the response cache. HS256 tokens are accepted when a
//! shared secret is configured. Roles come from the token's `permissions`
//! claim (`role:<name>`). Roles are ranked admin > editor > writer >
//! teacher > learner, and a role passes every check for a junior one.

use axum::http::Method;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use regex::Regex;
use roster_core::{Role, User};
use roster_io::{DirectoryError, ResponseCache};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::people::Person;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub auth_domain: String,
    #[serde(default)]
    pub hs256_secret: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_domain: String::new(),
            hs256_secret: None,
            audience: None,
            jwks_ttl_secs: default_jwks_ttl(),
        }
    }
}

fn default_jwks_ttl() -> u64 {
    3600
}

/// Verified token contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("no signing key for token")]
    UnknownKey,
    #[error("key set unavailable: {0}")]
    KeySet(#[from] DirectoryError),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        Self::InvalidToken(e.to_string())
    }
}

/// The authenticated principal of one request.
#[derive(Debug, Clone, Serialize)]
pub struct Caller {
    pub request_id: uuid::Uuid,
    pub user: User,
    pub person: Person,
    pub permissions: Vec<String>,
}

impl Caller {
    pub fn has_role(&self, role: Role) -> bool {
        has_role(&self.permissions, role)
    }
}

/// Whether any `role:<name>` permission names `role` or a more senior one.
pub fn has_role(permissions: &[String], role: Role) -> bool {
    permissions
        .iter()
        .filter_map(|p| p.strip_prefix("role:"))
        .filter_map(|name| name.parse::<Role>().ok())
        .any(|granted| granted.covers(role))
}

/// Role a route demands. `None` for public routes; every other API route
/// needs at least `learner`.
pub fn required_role(path: &str, method: &Method) -> Option<Role> {
    if !path.starts_with("/api") || path == "/api/status" {
        return None;
    }
    if path.starts_with("/api/cache") || path.ends_with("/role") {
        return Some(Role::Admin);
    }
    if path.starts_with("/api/users/") && matches!(*method, Method::PUT | Method::DELETE) {
        return Some(Role::Admin);
    }
    if path == "/api/me" || path.ends_with("/permissions") {
        return Some(Role::Learner);
    }
    if path.starts_with("/api/people") || path.starts_with("/api/users") || path.starts_with("/api/query") {
        return Some(Role::Teacher);
    }
    Some(Role::Learner)
}

pub struct Authenticator {
    config: AuthConfig,
    http: reqwest::Client,
    cache: ResponseCache,
    bearer: Regex,
}

impl Authenticator {
    pub fn new(config: AuthConfig, cache: ResponseCache) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            http: reqwest::Client::new(),
            cache,
            bearer: Regex::new(r"^Bearer (\S*)$")?,
        })
    }

    /// The token of an `Authorization: Bearer <token>` header value.
    pub fn bearer_token<'a>(&self, header: &'a str) -> Option<&'a str> {
        self.bearer
            .captures(header)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|t| !t.is_empty())
    }

    pub fn issuer(&self) -> String {
        format!("https://{}/", self.config.auth_domain)
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let header = decode_header(token)?;
        let (key, mut validation) = match header.alg {
            Algorithm::HS256 => {
                let secret = self
                    .config
                    .hs256_secret
                    .as_deref()
                    .ok_or(AuthError::UnknownKey)?;
                (
                    DecodingKey::from_secret(secret.as_bytes()),
                    Validation::new(Algorithm::HS256),
                )
            }
            Algorithm::RS256 => {
                let keys = self.key_set().await?;
                let jwk = match &header.kid {
                    Some(kid) => keys.find(kid),
                    None => keys.keys.first(),
                }
                .ok_or(AuthError::UnknownKey)?;
                let mut validation = Validation::new(Algorithm::RS256);
                validation.set_issuer(&[self.issuer()]);
                (DecodingKey::from_jwk(jwk)?, validation)
            }
            other => {
                return Err(AuthError::InvalidToken(format!(
                    "unsupported algorithm {:?}",
                    other
                )))
            }
        };
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Ok(decode::<Claims>(token, &key, &validation)?.claims)
    }

    async fn key_set(&self) -> Result<JwkSet, AuthError> {
        let url = format!("{}.well-known/jwks.json", self.issuer());
        let http = self.http.clone();
        let keys = self
            .cache
            .deduplicated_cached(
                &format!("jwks:{}", self.config.auth_domain),
                Duration::from_secs(self.config.jwks_ttl_secs),
                move || async move {
                    tracing::debug!(%url, "fetching signing keys");
                    let response = http
                        .get(&url)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| DirectoryError::Transport(e.to_string()))?;
                    response
                        .json::<JwkSet>()
                        .await
                        .map_err(|e| DirectoryError::Decode(e.to_string()))
                },
            )
            .await?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use roster_io::{InflightRegistry, MemoryStore};
    use std::sync::Arc;

    const SECRET: &str = "test-secret";

    fn authenticator(secret: Option<&str>) -> Authenticator {
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), InflightRegistry::default());
        Authenticator::new(
            AuthConfig {
                auth_domain: "auth.example.com".into(),
                hs256_secret: secret.map(str::to_string),
                ..Default::default()
            },
            cache,
        )
        .unwrap()
    }

    fn token(secret: &str, permissions: &[&str]) -> String {
        let claims = Claims {
            sub: "auth0|1".into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_bearer_header_parsing() {
        let auth = authenticator(None);
        assert_eq!(auth.bearer_token("Bearer abc.def"), Some("abc.def"));
        assert_eq!(auth.bearer_token("Bearer "), None);
        assert_eq!(auth.bearer_token("Basic abc"), None);
        assert_eq!(auth.bearer_token("Bearer a b"), None);
    }

    #[tokio::test]
    async fn test_hs256_round_trip() {
        let auth = authenticator(Some(SECRET));
        let claims = auth
            .verify(&token(SECRET, &["role:learner", "role:teacher"]))
            .await
            .unwrap();
        assert_eq!(claims.sub, "auth0|1");
        assert!(has_role(&claims.permissions, Role::Teacher));
        assert!(!has_role(&claims.permissions, Role::Admin));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let auth = authenticator(Some(SECRET));
        assert!(matches!(
            auth.verify(&token("other", &[])).await,
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_hs256_without_secret_is_rejected() {
        let auth = authenticator(None);
        assert!(matches!(
            auth.verify(&token(SECRET, &[])).await,
            Err(AuthError::UnknownKey)
        ));
    }

    #[test]
    fn test_admin_passes_every_role() {
        let perms = vec!["role:admin".to_string()];
        for role in Role::ALL {
            assert!(has_role(&perms, role));
        }
        assert!(!has_role(&[], Role::Learner));
    }

    #[test]
    fn test_senior_roles_pass_junior_checks() {
        let teacher = vec!["role:teacher".to_string()];
        assert!(has_role(&teacher, Role::Learner));
        assert!(has_role(&teacher, Role::Teacher));
        assert!(!has_role(&teacher, Role::Writer));

        let editor = vec!["role:editor".to_string(), "read:users".to_string()];
        assert!(has_role(&editor, Role::Teacher));
        assert!(!has_role(&editor, Role::Admin));
        assert!(!has_role(&["role:principal".to_string()], Role::Learner));
    }

    #[test]
    fn test_route_roles() {
        assert_eq!(required_role("/api/status", &Method::GET), None);
        assert_eq!(required_role("/", &Method::GET), None);
        assert_eq!(required_role("/api/me", &Method::GET), Some(Role::Learner));
        assert_eq!(
            required_role("/api/people/search", &Method::POST),
            Some(Role::Teacher)
        );
        assert_eq!(
            required_role("/api/people/3/permissions", &Method::GET),
            Some(Role::Learner)
        );
        assert_eq!(
            required_role("/api/users/auth0|1/role", &Method::PUT),
            Some(Role::Admin)
        );
        assert_eq!(
            required_role("/api/users/auth0|1", &Method::DELETE),
            Some(Role::Admin)
        );
        assert_eq!(
            required_role("/api/users/batch", &Method::POST),
            Some(Role::Teacher)
        );
        assert_eq!(required_role("/api/cache", &Method::DELETE), Some(Role::Admin));
    }
}
