use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;
use validator::Validate;

use crate::{
    AppState,
    auth::{AuthUser, OptionalAuthUser},
    error::{AppError, Result},
    models::{CreatePostRequest, PostPage, PostResponse, UpdatePostRequest, VoteRequest, VoteResponse},
    services::{post_service, vote_service},
};

#[derive(Debug, Deserialize)]
pub struct GetPostsQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

pub async fn create_post(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    // Validate input
    payload.validate()?;

    let post =
        post_service::create_post(&state.db, auth_user.user_id, &payload.title, &payload.content)
            .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Post created successfully",
            "post_id": post.id
        })),
    ))
}

pub async fn get_posts(
    State(state): State<AppState>,
    Query(params): Query<GetPostsQuery>,
    auth_user: OptionalAuthUser,
) -> Result<Json<PostPage>> {
    let limit = params.limit.unwrap_or(25);
    let viewer_id = auth_user.0.as_ref().map(|user| user.user_id);

    let page =
        post_service::list_posts(&state.db, viewer_id, limit, params.cursor.as_deref()).await?;

    Ok(Json(page))
}

pub async fn get_post(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    auth_user: OptionalAuthUser,
) -> Result<Json<PostResponse>> {
    let viewer_id = auth_user.0.as_ref().map(|user| user.user_id);

    let post = post_service::get_post_by_id(&state.db, post_id, viewer_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Post not found".to_string()))?;

    Ok(Json(post))
}

pub async fn update_post(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(post_id): Path<Uuid>,
    Json(payload): Json<UpdatePostRequest>,
) -> Result<Json<Value>> {
    payload.validate()?;

    // Check if post exists and user owns it
    let post = post_service::get_post_by_id_raw(&state.db, post_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Post not found".to_string()))?;

    if post.author_id != auth_user.user_id {
        return Err(AppError::Authorization(
            "Can only edit your own posts".to_string(),
        ));
    }

    post_service::update_post(
        &state.db,
        post_id,
        payload.title.as_deref(),
        payload.content.as_deref(),
    )
    .await?;

    Ok(Json(json!({
        "message": "Post updated successfully"
    })))
}

pub async fn delete_post(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(post_id): Path<Uuid>,
) -> Result<Json<Value>> {
    // Check if post exists and user owns it
    let post = post_service::get_post_by_id_raw(&state.db, post_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Post not found".to_string()))?;

    if post.author_id != auth_user.user_id {
        return Err(AppError::Authorization(
            "Can only delete your own posts".to_string(),
        ));
    }

    post_service::delete_post(&state.db, post_id).await?;

    Ok(Json(json!({
        "message": "Post deleted successfully"
    })))
}

pub async fn vote_post(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(post_id): Path<Uuid>,
    Json(payload): Json<VoteRequest>,
) -> Result<Json<VoteResponse>> {
    let outcome =
        vote_service::apply_vote(&state.db, auth_user.user_id, post_id, payload.vote_type).await?;

    Ok(Json(outcome))
}
