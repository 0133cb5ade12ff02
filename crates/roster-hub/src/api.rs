//! Directory endpoints: people search, family links, batch user lookups,
//! user administration and cache control.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use futures_util::StreamExt;
use roster_core::{CompileError, Role, User, UserUpdate};
use roster_io::{CacheMode, DirectoryError, EnumerateError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::Caller;
use crate::people::{FamilyError, Person};
use crate::query::{compile_filter, parse_filter, CompileRequest, CompiledQuery, PeopleSearchRequest};
use crate::{ApiError, AppState};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

fn api_error(status: StatusCode, error: impl ToString) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: error.to_string(),
        }),
    )
}

fn directory_error(e: DirectoryError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        DirectoryError::NotFound(_) => StatusCode::NOT_FOUND,
        DirectoryError::RateLimited => StatusCode::SERVICE_UNAVAILABLE,
        DirectoryError::Http { .. } | DirectoryError::Transport(_) | DirectoryError::Decode(_) => {
            StatusCode::BAD_GATEWAY
        }
        DirectoryError::Cache(_) | DirectoryError::Aborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Upstream failure: {}", e);
    }
    api_error(status, e)
}

fn compile_error(e: CompileError) -> (StatusCode, Json<ApiError>) {
    api_error(StatusCode::BAD_REQUEST, e)
}

fn enumerate_error(e: EnumerateError) -> (StatusCode, Json<ApiError>) {
    match e {
        EnumerateError::Compile(e) => compile_error(e),
        EnumerateError::Directory(e) => directory_error(e),
    }
}

fn family_error(e: FamilyError) -> (StatusCode, Json<ApiError>) {
    let status = match e {
        FamilyError::UnknownPerson(_) => StatusCode::NOT_FOUND,
        FamilyError::SelfLink => StatusCode::BAD_REQUEST,
        FamilyError::TooManyParents(_) => StatusCode::CONFLICT,
    };
    api_error(status, e)
}

async fn person_or_404(state: &AppState, id: u64) -> Result<Person, (StatusCode, Json<ApiError>)> {
    state
        .people
        .get(id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("person {} not found", id)))
}

// =============================================================================
// Types
// =============================================================================

#[derive(Serialize)]
pub struct PersonView {
    #[serde(flatten)]
    pub person: Person,
    pub user: Option<User>,
}

#[derive(Serialize)]
pub struct PeopleSearchResponse {
    pub people: Vec<PersonView>,
    /// Matches reported upstream, summed over every bucket.
    pub count: u64,
    pub complete: bool,
    /// Buckets whose tail could not be reached.
    pub truncated: Vec<String>,
    pub pages: usize,
}

#[derive(Deserialize)]
pub struct AddChildRequest {
    pub child_id: u64,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct SetRoleRequest {
    pub role: Role,
}

#[derive(Deserialize)]
pub struct InvalidateParams {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

// =============================================================================
// People
// =============================================================================

/// Enumerate every user matching the filter and shadow each one locally.
pub async fn search_people(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PeopleSearchRequest>,
) -> ApiResult<PeopleSearchResponse> {
    let filter = parse_filter(&req.filter).map_err(compile_error)?;
    let run = state
        .users
        .enumerate(filter, req.options(state.config.search.page_size))
        .map_err(compile_error)?;

    let mut response = PeopleSearchResponse {
        people: Vec::new(),
        count: 0,
        complete: true,
        truncated: Vec::new(),
        pages: 0,
    };
    let mut pages = Box::pin(run.into_stream());
    while let Some(page) = pages.next().await {
        let page = page.map_err(enumerate_error)?;
        response.pages += 1;
        if page.page == 0 {
            response.count += page.total;
        }
        if page.truncated && page.page == 0 {
            response.complete = false;
            response.truncated.push(page.bucket.to_string());
        }
        let people = state.people.find_or_create_many(&page.users).await;
        response.people.extend(
            people
                .into_iter()
                .zip(page.users)
                .map(|(person, user)| PersonView {
                    person,
                    user: Some(user),
                }),
        );
    }

    tracing::info!(
        people = response.people.len(),
        count = response.count,
        pages = response.pages,
        complete = response.complete,
        "people search finished"
    );
    Ok(Json(response))
}

pub async fn get_person(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<PersonView> {
    let person = person_or_404(&state, id).await?;
    let user = match state.users.get_user(&person.user_id, CacheMode::Prefer).await {
        Ok(user) => Some(user),
        Err(DirectoryError::NotFound(_)) => None,
        Err(e) => return Err(directory_error(e)),
    };
    Ok(Json(PersonView { person, user }))
}

pub async fn list_children(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<PersonView>> {
    person_or_404(&state, id).await?;
    let children = state.people.children(id).await;
    let ids: Vec<String> = children.iter().map(|p| p.user_id.clone()).collect();
    let users = state.users.get_users(&ids).await.map_err(directory_error)?;
    Ok(Json(
        children
            .into_iter()
            .zip(users)
            .map(|(person, user)| PersonView { person, user })
            .collect(),
    ))
}

pub async fn add_child(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(req): Json<AddChildRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .people
        .add_child(id, req.child_id)
        .await
        .map_err(family_error)?;
    tracing::info!(parent = id, child = req.child_id, "family link added");
    Ok(StatusCode::CREATED)
}

/// A caller's own permissions come from their token; anyone else's are
/// asked for upstream.
pub async fn person_permissions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Vec<String>> {
    if caller.person.id == id {
        return Ok(Json(caller.permissions));
    }
    if !caller.has_role(Role::Teacher) {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "teacher role required for other people's permissions",
        ));
    }
    let person = person_or_404(&state, id).await?;
    let permissions = state
        .users
        .user_permissions(&person.user_id)
        .await
        .map_err(directory_error)?;
    Ok(Json(permissions))
}

// =============================================================================
// Users
// =============================================================================

/// Users for `ids` in request order; unknown ids come back as `null`.
pub async fn batch_users(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Vec<Option<User>>> {
    let users = state
        .users
        .get_users(&req.ids)
        .await
        .map_err(directory_error)?;
    Ok(Json(users))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<UserUpdate>,
) -> ApiResult<User> {
    let user = state
        .users
        .update_user(&id, &update)
        .await
        .map_err(directory_error)?;
    Ok(Json(user))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state.users.delete_user(&id).await.map_err(directory_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_role(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<User> {
    let user = state
        .users
        .get_user(&id, CacheMode::Refresh)
        .await
        .map_err(directory_error)?;
    let user = state
        .users
        .set_role(&user, req.role)
        .await
        .map_err(directory_error)?;
    Ok(Json(user))
}

// =============================================================================
// Query & Cache
// =============================================================================

pub async fn compile_query(Json(req): Json<CompileRequest>) -> ApiResult<CompiledQuery> {
    compile_filter(&req.filter).map(Json).map_err(compile_error)
}

/// `?user_id=` drops one cached user, `?prefix=` a whole key range.
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InvalidateParams>,
) -> ApiResult<InvalidateResponse> {
    let removed = match (params.user_id, params.prefix) {
        (Some(id), _) => usize::from(state.users.invalidate(&id).await.map_err(directory_error)?),
        (None, Some(prefix)) => state
            .users
            .invalidate_prefix(&prefix)
            .await
            .map_err(directory_error)?,
        (None, None) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "either user_id or prefix is required",
            ))
        }
    };
    Ok(Json(InvalidateResponse { removed }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_error_statuses() {
        let status = |e| directory_error(e).0;
        assert_eq!(status(DirectoryError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(DirectoryError::RateLimited), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(DirectoryError::Http {
                status: 500,
                message: String::new()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(DirectoryError::Aborted(roster_io::Aborted("gone".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_compile_failures_are_bad_requests() {
        let (status, Json(body)) = enumerate_error(EnumerateError::Compile(
            CompileError::UnknownField("shoe_size".into()),
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.contains("shoe_size"));
    }

    #[test]
    fn test_family_error_statuses() {
        assert_eq!(family_error(FamilyError::UnknownPerson(3)).0, StatusCode::NOT_FOUND);
        assert_eq!(family_error(FamilyError::TooManyParents(3)).0, StatusCode::CONFLICT);
        assert_eq!(family_error(FamilyError::SelfLink).0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_compile_endpoint() {
        let Json(compiled) = compile_query(Json(CompileRequest {
            filter: serde_json::json!({ "role": "learner", "sort": "email" }),
        }))
        .await
        .unwrap();
        assert_eq!(compiled.q, r#"app_metadata.role:"learner""#);
        assert_eq!(compiled.sort.as_deref(), Some("email:1"));
    }
}
