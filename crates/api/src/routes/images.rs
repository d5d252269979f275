//! Image listing, upload registration and processing endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::EntityId;
use imaging::{Image, ImageStatus, NewImage};
use repository::{Direction, Operator, Page, Sort, Specification};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Query string of `GET /images`.
#[derive(Debug, Default, Deserialize)]
pub struct ListImagesParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
    /// Domain field to sort by; defaults to `createdAt`.
    pub sort: Option<String>,
    /// `asc` or `desc`; defaults to `desc`.
    pub order: Option<String>,
}

impl ListImagesParams {
    pub fn to_specification(&self) -> Result<Specification, ApiError> {
        let direction = match self.order.as_deref() {
            Some(order) => order.parse::<Direction>()?,
            None => Direction::Desc,
        };
        let field = self.sort.as_deref().unwrap_or("createdAt");

        let mut spec = Specification::new()
            .sort(Sort {
                field: field.to_string(),
                direction,
            })
            .paginate(self.limit.unwrap_or(0), self.offset.unwrap_or(0));
        if let Some(status) = self.status.as_deref() {
            let status: ImageStatus = status.parse()?;
            spec = spec.filter("status", Operator::Eq, status.as_str());
        }
        Ok(spec)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterImageRequest {
    pub created_by: String,
    pub name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub album_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingAccepted {
    pub image_id: String,
    pub message_id: String,
}

/// GET /images: one page of images, optionally filtered by status.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListImagesParams>,
) -> Result<Json<Page<Image>>, ApiError> {
    let spec = params.to_specification()?;
    let page = state.images.list_images(spec).await?;
    Ok(Json(page))
}

/// GET /images/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Image>, ApiError> {
    let image = state.images.get_image(&EntityId::from(id)).await?;
    Ok(Json(image))
}

/// POST /images: registers an upload and returns the image with the
/// storage key to upload to.
#[tracing::instrument(skip(state, req), fields(name = %req.name))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterImageRequest>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if req.size_bytes < 0 {
        return Err(ApiError::BadRequest(
            "sizeBytes must not be negative".to_string(),
        ));
    }

    let image = state
        .images
        .register_upload(NewImage {
            created_by: req.created_by,
            name: req.name,
            content_type: req.content_type,
            size_bytes: req.size_bytes,
            album_id: req.album_id.map(EntityId::from),
            tags: req.tags,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(image)))
}

/// POST /images/{id}/process: queues the image for the batch worker.
#[tracing::instrument(skip(state))]
pub async fn process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ProcessingAccepted>), ApiError> {
    let image_id = EntityId::from(id);
    let message_id = state.images.request_processing(&image_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessingAccepted {
            image_id: image_id.to_string(),
            message_id,
        }),
    ))
}
