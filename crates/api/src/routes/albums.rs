//! Album endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::EntityId;
use imaging::Album;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlbumRequest {
    pub created_by: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlbumDeleted {
    pub album_id: String,
    pub deleted_images: usize,
}

/// POST /albums: album names are unique, a duplicate is a conflict.
#[tracing::instrument(skip(state, req), fields(name = %req.name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAlbumRequest>,
) -> Result<(StatusCode, Json<Album>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }

    let album = state.images.create_album(&req.created_by, name).await?;
    Ok((StatusCode::CREATED, Json(album)))
}

/// DELETE /albums/{id}: removes the album with its images and their
/// stored objects.
#[tracing::instrument(skip(state))]
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AlbumDeleted>, ApiError> {
    let album_id = EntityId::from(id);
    let deleted_images = state.images.delete_album(&album_id).await?;
    Ok(Json(AlbumDeleted {
        album_id: album_id.to_string(),
        deleted_images,
    }))
}
