use axum::{
    extract::{Request, State},
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roster_core::User;
use roster_io::{
    CacheMode, Directory, InflightRegistry, MemoryStore, ResponseCache, Throttle, ThrottleLimits,
    Throttled, Users, UsersConfig,
};

mod api;
mod auth;
mod people;
mod query;
mod upstream;

use auth::{AuthConfig, Authenticator, Caller};
use people::{PeopleStore, Person};
use upstream::{ManagementClient, UpstreamConfig};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "roster-hub",
    version = "0.1.0",
    about = "ROSTER directory hub"
)]
struct Args {
    /// Server bind address
    #[arg(long, default_value = "127.0.0.1:3030")]
    bind: String,

    /// Path to config file
    #[arg(long, default_value = "roster-hub.toml")]
    config: PathBuf,
}

// =============================================================================
// Config
// =============================================================================

#[derive(Deserialize, Default, Clone)]
struct Config {
    #[serde(default)]
    upstream: UpstreamConfig,
    #[serde(default)]
    throttle: ThrottleConfig,
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    search: SearchConfig,
}

#[derive(Deserialize, Clone)]
struct ThrottleConfig {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_rate")]
    rate: usize,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            rate: default_rate(),
            concurrency: default_concurrency(),
        }
    }
}

impl ThrottleConfig {
    fn limits(&self) -> ThrottleLimits {
        ThrottleLimits {
            interval: Duration::from_millis(self.interval_ms),
            rate: self.rate,
            concurrency: self.concurrency,
        }
    }
}

#[derive(Deserialize, Clone)]
struct CacheConfig {
    #[serde(default = "default_user_ttl")]
    user_ttl_secs: u64,
    #[serde(default = "default_ttl")]
    default_ttl_secs: u64,
    #[serde(default = "default_dedup_timeout")]
    dedup_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            user_ttl_secs: default_user_ttl(),
            default_ttl_secs: default_ttl(),
            dedup_timeout_secs: default_dedup_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Deserialize, Clone)]
struct SearchConfig {
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}
fn default_rate() -> usize {
    2
}
fn default_concurrency() -> usize {
    10
}
fn default_user_ttl() -> u64 {
    86_400
}
fn default_ttl() -> u64 {
    3600
}
fn default_dedup_timeout() -> u64 {
    10
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_page_size() -> u32 {
    100
}
fn default_batch_size() -> usize {
    64
}

/// A missing file means defaults. So does a broken one, loudly.
fn load_config(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!("No config at {:?}; using defaults", path);
        return Config::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to read config {:?}: {}", path, e);
            return Config::default();
        }
    };
    toml::from_str(&content).unwrap_or_else(|e| {
        tracing::error!("Failed to parse config {:?}: {}", path, e);
        Config::default()
    })
}

// =============================================================================
// Application State
// =============================================================================

struct AppState {
    users: Users,
    people: Arc<PeopleStore>,
    auth: Arc<Authenticator>,
    store: Arc<MemoryStore>,
    config: Config,
    start_time: Instant,
}

/// Wire the components around `upstream`, which is throttled here and only
/// here.
fn build_state(config: Config, upstream: Arc<dyn Directory>) -> Result<Arc<AppState>, String> {
    let store = Arc::new(MemoryStore::new());
    let inflight =
        InflightRegistry::new(Duration::from_secs(config.cache.dedup_timeout_secs));
    let cache = ResponseCache::new(store.clone(), inflight);

    let throttle = Arc::new(Throttle::new(config.throttle.limits()));
    let directory: Arc<dyn Directory> = Arc::new(Throttled::new(upstream, throttle));

    let users = Users::new(
        directory,
        cache.clone(),
        UsersConfig {
            namespace: config.upstream.domain.clone(),
            user_ttl: Duration::from_secs(config.cache.user_ttl_secs),
            default_ttl: Duration::from_secs(config.cache.default_ttl_secs),
            batch_size: config.search.batch_size,
            page_size: config.search.page_size,
        },
    );
    let auth = Authenticator::new(config.auth.clone(), cache).map_err(|e| e.to_string())?;

    Ok(Arc::new(AppState {
        users,
        people: Arc::new(PeopleStore::new()),
        auth: Arc::new(auth),
        store,
        config,
        start_time: Instant::now(),
    }))
}

// =============================================================================
// Types
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    upstream: String,
    uptime_seconds: u64,
    cached_entries: usize,
    people: usize,
    inflight: usize,
}

#[derive(Serialize)]
struct MeResponse {
    person: Person,
    user: User,
    permissions: Vec<String>,
    under_age: bool,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "roster_hub=info,roster_io=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config);

    let client = match ManagementClient::new(config.upstream.clone()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build upstream client: {}", e);
            std::process::exit(1);
        }
    };
    let state = match build_state(config, Arc::new(client)) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to initialise: {}", e);
            std::process::exit(1);
        }
    };

    // Spawn background cache sweeper
    let bg_state = state.clone();
    tokio::spawn(async move { cache_sweeper(bg_state).await });

    let app = build_router(state.clone());

    let addr: SocketAddr = args.bind.parse().expect("Invalid bind address");
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  ROSTER hub v0.1.0");
    tracing::info!("  API:        http://{}/api/status", addr);
    tracing::info!("  Upstream:   {}", state.config.upstream.domain);
    tracing::info!(
        "  Budget:     {} calls / {} ms, {} concurrent",
        state.config.throttle.rate,
        state.config.throttle.interval_ms,
        state.config.throttle.concurrency
    );
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");
    axum::serve(listener, app).await.expect("Server error");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/me", get(api_me))
        .route("/api/people/search", post(api::search_people))
        .route("/api/people/:id", get(api::get_person))
        .route(
            "/api/people/:id/children",
            get(api::list_children).post(api::add_child),
        )
        .route("/api/people/:id/permissions", get(api::person_permissions))
        .route("/api/users/batch", post(api::batch_users))
        .route(
            "/api/users/:id",
            put(api::update_user).delete(api::delete_user),
        )
        .route("/api/users/:id/role", put(api::set_role))
        .route("/api/query/compile", post(api::compile_query))
        .route("/api/cache", delete(api::invalidate_cache))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Background Cache Sweeper
// =============================================================================

async fn cache_sweeper(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.cache.sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let purged = state.store.purge_expired().await;
        if purged > 0 {
            tracing::debug!(purged, "expired cache entries swept");
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn api_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        upstream: state.config.upstream.domain.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        cached_entries: state.store.len().await,
        people: state.people.len().await,
        inflight: state.users.cache().inflight().len().await,
    })
}

async fn api_me(Extension(caller): Extension<Caller>) -> Json<MeResponse> {
    let today = chrono::Utc::now().date_naive();
    Json(MeResponse {
        under_age: caller.user.is_under_age(today),
        person: caller.person,
        user: caller.user,
        permissions: caller.permissions,
    })
}

// =============================================================================
// Auth Middleware
// =============================================================================

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // Public routes bypass
    let required = match auth::required_role(&path, &method) {
        Some(role) if method != Method::OPTIONS => role,
        _ => return Ok(next.run(req).await),
    };

    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| state.auth.bearer_token(header))
        .map(str::to_string);
    let Some(token) = token else {
        tracing::warn!("Missing bearer token for {}", path);
        return Err(StatusCode::UNAUTHORIZED);
    };

    let claims = state.auth.verify(&token).await.map_err(|e| {
        tracing::warn!("Rejected token for {}: {}", path, e);
        StatusCode::UNAUTHORIZED
    })?;

    let user = match state.users.get_user(&claims.sub, CacheMode::Prefer).await {
        Ok(user) => user,
        Err(roster_io::DirectoryError::NotFound(_)) => {
            tracing::warn!("Token subject {} has no user", claims.sub);
            return Err(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            tracing::error!("Failed to resolve {}: {}", claims.sub, e);
            return Err(StatusCode::BAD_GATEWAY);
        }
    };
    let person = state.people.find_or_create(&user).await;
    let caller = Caller {
        request_id: uuid::Uuid::new_v4(),
        user,
        person,
        permissions: claims.permissions,
    };

    if !caller.has_role(required) {
        tracing::warn!("Role {} required for {} {}", required, method, path);
        return Err(StatusCode::FORBIDDEN);
    }

    tracing::debug!(request_id = %caller.request_id, user_id = %caller.user.user_id, "authenticated");
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use roster_io::testing::FakeDirectory;
    use tower::ServiceExt;

    const SECRET: &str = "hub-test-secret";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.auth.hs256_secret = Some(SECRET.into());
        config.throttle.rate = 10_000;
        config.throttle.concurrency = 100;
        config
    }

    fn fixture(users: Vec<User>) -> (Router, Arc<AppState>, Arc<FakeDirectory>) {
        let fake = Arc::new(FakeDirectory::with_users(users));
        let state = build_state(test_config(), fake.clone()).unwrap();
        (build_router(state.clone()), state, fake)
    }

    fn token(sub: &str, permissions: &[&str]) -> String {
        let claims = auth::Claims {
            sub: sub.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            exp: (chrono::Utc::now().timestamp() + 3600) as u64,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<serde_json::Value>) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(t) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn people(n: usize) -> Vec<User> {
        (0..n)
            .map(|i| User::new(format!("auth0|{i}"), format!("p{i:03}@x.com")))
            .collect()
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            domain = "tenant.example.com"
            [throttle]
            rate = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.domain, "tenant.example.com");
        assert_eq!(config.throttle.rate, 5);
        assert_eq!(config.throttle.interval_ms, 1000);
        assert_eq!(config.throttle.concurrency, 10);
        assert_eq!(config.cache.user_ttl_secs, 86_400);
        assert_eq!(config.cache.dedup_timeout_secs, 10);
        assert_eq!(config.auth.jwks_ttl_secs, 3600);
        assert_eq!(config.search.batch_size, 64);
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let config = load_config(Path::new("/nonexistent/roster-hub.toml"));
        assert_eq!(config.search.page_size, 100);
        assert_eq!(config.cache.sweep_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_status_is_public() {
        let (app, _, _) = fixture(vec![]);
        let response = app
            .oneshot(request(Method::GET, "/api/status", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_me_requires_token() {
        let (app, _, _) = fixture(people(1));
        let response = app
            .oneshot(request(Method::GET, "/api/me", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_me_resolves_user_and_person() {
        let (app, state, _) = fixture(people(1));
        let t = token("auth0|0", &["role:learner"]);
        let response = app
            .oneshot(request(Method::GET, "/api/me", Some(&t), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["user"]["user_id"], "auth0|0");
        assert_eq!(body["permissions"][0], "role:learner");
        assert_eq!(state.people.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_not_found() {
        let (app, _, _) = fixture(vec![]);
        let t = token("auth0|ghost", &["role:learner"]);
        let response = app
            .oneshot(request(Method::GET, "/api/me", Some(&t), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_people_search_needs_teacher() {
        let (app, _, _) = fixture(people(3));
        let t = token("auth0|0", &["role:learner"]);
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/people/search",
                Some(&t),
                Some(serde_json::json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_people_search_enumerates_everyone() {
        let (app, state, _) = fixture(people(150));
        let t = token("auth0|0", &["role:learner", "role:teacher"]);
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/people/search",
                Some(&t),
                Some(serde_json::json!({ "filter": null })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["count"], 150);
        assert_eq!(body["complete"], true);
        assert_eq!(body["people"].as_array().unwrap().len(), 150);
        assert_eq!(state.people.len().await, 150);
    }

    #[tokio::test]
    async fn test_people_search_reports_truncated_bucket_once() {
        let dense: Vec<User> = (0..1100)
            .map(|i| User::new(format!("auth0|{i}"), format!("zz{i:05}@x.com")))
            .collect();
        let (app, _, _) = fixture(dense);
        let t = token("auth0|0", &["role:teacher"]);
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/people/search",
                Some(&t),
                Some(serde_json::json!({ "filter": null })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["complete"], false);
        assert_eq!(body["truncated"], serde_json::json!(["zz*"]));
        assert_eq!(body["count"], 1100);
        assert_eq!(body["people"].as_array().unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn test_people_search_rejects_bad_filter() {
        let (app, _, fake) = fixture(people(1));
        let t = token("auth0|0", &["role:teacher"]);
        let calls = fake.calls();
        let response = app
            .oneshot(request(
                Method::POST,
                "/api/people/search",
                Some(&t),
                Some(serde_json::json!({ "filter": { "email": "a@b.c" } })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Only the caller lookup reached the upstream.
        assert_eq!(fake.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_family_links_and_permissions() {
        let (app, _, fake) = fixture(people(3));
        fake.set_permissions("auth0|2", vec!["role:learner".into()]);
        let t = token("auth0|0", &["role:teacher"]);

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/people/search",
                Some(&t),
                Some(serde_json::json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The caller became person 1; the search added auth0|1 and auth0|2.
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/people/1/children",
                Some(&t),
                Some(serde_json::json!({ "child_id": 2 })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/people/1/children", Some(&t), None))
            .await
            .unwrap();
        let children = json_body(response).await;
        assert_eq!(children.as_array().unwrap().len(), 1);
        assert_eq!(children[0]["id"], 2);
        assert_eq!(children[0]["user"]["user_id"], "auth0|1");

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/people/3/permissions", Some(&t), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!(["role:learner"]));

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/people/1/permissions", Some(&t), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, serde_json::json!(["role:teacher"]));

        let response = app
            .oneshot(request(Method::GET, "/api/people/99", Some(&t), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_role_change_is_admin_only() {
        let (app, _, fake) = fixture(people(2));
        let teacher = token("auth0|0", &["role:teacher"]);
        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/api/users/auth0%7C1/role",
                Some(&teacher),
                Some(serde_json::json!({ "role": "editor" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let admin = token("auth0|0", &["role:admin"]);
        let response = app
            .oneshot(request(
                Method::PUT,
                "/api/users/auth0%7C1/role",
                Some(&admin),
                Some(serde_json::json!({ "role": "editor" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["app_metadata"]["role"], "editor");
        assert_eq!(fake.role_names("auth0|1"), vec!["editor"]);
    }
}
