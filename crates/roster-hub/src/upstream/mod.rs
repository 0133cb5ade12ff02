//! # Management API Client
//!
//! [`Directory`] over the upstream's HTTP management API. Authenticates with
//! the client-credentials grant and reuses the access token until shortly
//! before it expires.
//!
//! Never used bare: `main` wraps it in a [`Throttled`](roster_io::Throttled).

use reqwest::{Method, StatusCode, Url};
use roster_core::{User, UserPage, UserUpdate};
use roster_io::{Directory, DirectoryError, RoleInfo, SearchRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tokens are renewed this long before they expire.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ROLES_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Connection new users are created in.
    #[serde(default)]
    pub connection_id: String,
    /// Defaults to the management API of `domain`.
    #[serde(default)]
    pub audience: Option<String>,
}

impl UpstreamConfig {
    pub fn audience(&self) -> String {
        self.audience
            .clone()
            .unwrap_or_else(|| format!("https://{}/api/v2/", self.domain))
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
    audience: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    86_400
}

#[derive(Deserialize)]
struct Permission {
    permission_name: String,
}

#[derive(Serialize)]
struct RoleIds<'a> {
    roles: &'a [String],
}

struct AccessToken {
    value: String,
    renew_at: Instant,
}

pub struct ManagementClient {
    http: reqwest::Client,
    config: UpstreamConfig,
    base: Url,
    token: Mutex<Option<AccessToken>>,
}

impl ManagementClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, DirectoryError> {
        let base = Url::parse(&format!("https://{}/api/v2/", config.domain))
            .map_err(|e| DirectoryError::Transport(format!("bad upstream domain: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;
        Ok(Self {
            http,
            config,
            base,
            token: Mutex::new(None),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DirectoryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::Transport("upstream url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, DirectoryError> {
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref().filter(|t| t.renew_at > Instant::now()) {
            return Ok(t.value.clone());
        }

        let response = self
            .http
            .post(format!("https://{}/oauth/token", self.config.domain))
            .json(&TokenRequest {
                grant_type: "client_credentials",
                client_id: &self.config.client_id,
                client_secret: &self.config.client_secret,
                audience: self.config.audience(),
            })
            .send()
            .await
            .map_err(transport)?;
        let issued: TokenResponse = decode(check(response, "oauth/token").await?).await?;
        tracing::debug!(expires_in = issued.expires_in, "management token issued");

        let lifetime = Duration::from_secs(issued.expires_in).saturating_sub(TOKEN_MARGIN);
        let value = issued.access_token.clone();
        *token = Some(AccessToken {
            value: issued.access_token,
            renew_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&B>,
        subject: &str,
    ) -> Result<reqwest::Response, DirectoryError> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .request(method, self.url(segments)?)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(transport)?;
        check(response, subject).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
        subject: &str,
    ) -> Result<T, DirectoryError> {
        decode(
            self.send::<()>(Method::GET, segments, query, None, subject)
                .await?,
        )
        .await
    }
}

fn transport(e: reqwest::Error) -> DirectoryError {
    DirectoryError::Transport(e.to_string())
}

async fn check(response: reqwest::Response, subject: &str) -> Result<reqwest::Response, DirectoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(subject.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(DirectoryError::RateLimited),
        _ => {
            let message = response.text().await.unwrap_or_default();
            Err(DirectoryError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, DirectoryError> {
    let bytes = response.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| DirectoryError::Decode(e.to_string()))
}

/// Query parameters of one search call.
fn search_params(request: &SearchRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("q", request.q.clone()),
        ("page", request.page.to_string()),
        ("per_page", request.per_page.to_string()),
        ("include_totals", request.include_totals.to_string()),
        ("search_engine", "v3".to_string()),
    ];
    if let Some(sort) = &request.sort {
        params.push(("sort", sort.clone()));
    }
    params
}

#[async_trait::async_trait]
impl Directory for ManagementClient {
    async fn search(&self, request: &SearchRequest) -> Result<UserPage, DirectoryError> {
        self.get_json(&["users"], &search_params(request), "users")
            .await
    }

    async fn get_user(&self, id: &str) -> Result<User, DirectoryError> {
        self.get_json(&["users", id], &[], id).await
    }

    async fn create_user(&self, data: &UserUpdate) -> Result<User, DirectoryError> {
        let mut data = data.clone();
        if data.connection.is_none() {
            data.connection = Some(self.config.connection_id.clone());
        }
        decode(
            self.send(Method::POST, &["users"], &[], Some(&data), "users")
                .await?,
        )
        .await
    }

    async fn update_user(&self, id: &str, data: &UserUpdate) -> Result<User, DirectoryError> {
        decode(
            self.send(Method::PATCH, &["users", id], &[], Some(data), id)
                .await?,
        )
        .await
    }

    async fn delete_user(&self, id: &str) -> Result<(), DirectoryError> {
        self.send::<()>(Method::DELETE, &["users", id], &[], None, id)
            .await?;
        Ok(())
    }

    async fn users_by_email(&self, email: &str) -> Result<Vec<User>, DirectoryError> {
        self.get_json(&["users-by-email"], &[("email", email.to_string())], email)
            .await
    }

    async fn user_permissions(&self, id: &str) -> Result<Vec<String>, DirectoryError> {
        let permissions: Vec<Permission> =
            self.get_json(&["users", id, "permissions"], &[], id).await?;
        Ok(permissions.into_iter().map(|p| p.permission_name).collect())
    }

    async fn roles(&self) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.get_json(
            &["roles"],
            &[("per_page", ROLES_PER_PAGE.to_string())],
            "roles",
        )
        .await
    }

    async fn user_roles(&self, id: &str) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.get_json(&["users", id, "roles"], &[], id).await
    }

    async fn assign_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.send(
            Method::POST,
            &["users", id, "roles"],
            &[],
            Some(&RoleIds { roles: role_ids }),
            id,
        )
        .await?;
        Ok(())
    }

    async fn remove_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.send(
            Method::DELETE,
            &["users", id, "roles"],
            &[],
            Some(&RoleIds { roles: role_ids }),
            id,
        )
        .await?;
        Ok(())
    }
}
