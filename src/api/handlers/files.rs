use std::collections::{BTreeSet, HashMap};
use std::io;
use std::pin::pin;

use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

use super::file_error;
use crate::api::response::{ApiError, AppJson, AppQuery, JSend, JSendPaginated, Pagination};
use crate::manager::{TransferOptions, UploadRequest};
use crate::storage::models::{
    AssetDescriptor, FileFilter, FilePermissions, FileRecord, FileStatus, FileType,
    UploadProgress, VirusScanResult,
};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct FileResponse {
    pub accessed_at: String,
    pub byte_size: u64,
    pub checksum: Option<String>,
    pub content_hash: Option<String>,
    pub created_at: String,
    pub extension: String,
    pub file_type: FileType,
    pub id: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub mime_type: String,
    pub name: String,
    pub original_name: String,
    pub permissions: Option<FilePermissions>,
    pub preview: Option<AssetResponse>,
    pub status: FileStatus,
    pub tags: BTreeSet<String>,
    pub thumbnail: Option<AssetResponse>,
    pub updated_at: String,
    pub uploaded_by: Option<String>,
    pub versions: Vec<VersionResponse>,
    pub virus_scan: Option<VirusScanResult>,
}

#[derive(Debug, Serialize)]
pub struct AssetResponse {
    pub byte_size: u64,
    pub height: Option<u32>,
    pub mime_type: String,
    pub width: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub byte_size: u64,
    pub checksum: String,
    pub content_hash: String,
    pub created_at: String,
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub status: Option<FileStatus>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct AddTagsRequest {
    pub tags: Vec<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Multipart upload. Descriptive fields (`metadata`, `tags`, `uploaded_by`,
/// `size`) must precede the `file` field, which is streamed as it arrives.
pub async fn create_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
    let mut tags: Vec<String> = Vec::new();
    let mut uploaded_by: Option<String> = None;
    let mut total_size: Option<u64> = None;

    while let Some(field) = next_field(&mut multipart).await? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ApiError::bad_request("file field must have a filename"))?;

                let mut request = UploadRequest::new(filename)
                    .with_metadata(std::mem::take(&mut metadata))
                    .with_tags(std::mem::take(&mut tags));
                if let Some(content_type) = field.content_type() {
                    request = request.with_mime_type(content_type);
                }
                if let Some(uploader) = uploaded_by.take() {
                    request = request.uploaded_by(uploader);
                }
                if let Some(total) = total_size {
                    request = request.with_total_size(total);
                }

                let reader = pin!(field_reader(field));
                let file = state
                    .manager
                    .upload_file(reader, request)
                    .await
                    .map_err(file_error)?;

                tracing::debug!(file_id = %file.id, name = %file.name, "Created file");
                return Ok(JSend::success(file_to_response(&file)));
            }
            "metadata" => {
                let text = field_text(field, "metadata").await?;
                metadata = serde_json::from_str(&text).map_err(|e| {
                    ApiError::bad_request(format!("metadata must be a JSON object: {e}"))
                })?;
            }
            "tags" => {
                let text = field_text(field, "tags").await?;
                tags.extend(text.split(',').map(|t| t.trim().to_string()));
            }
            "uploaded_by" => {
                uploaded_by = Some(field_text(field, "uploaded_by").await?);
            }
            "size" => {
                total_size = Some(parse_size(&field_text(field, "size").await?)?);
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    Err(ApiError::bad_request("file field is required"))
}

/// Multipart upload of replacement content for an existing file.
pub async fn create_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let mut transfer = TransferOptions::default();

    while let Some(field) = next_field(&mut multipart).await? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                let reader = pin!(field_reader(field));
                let file = state
                    .manager
                    .upload_version(&id, reader, transfer)
                    .await
                    .map_err(file_error)?;

                tracing::debug!(file_id = %id, versions = file.versions.len(), "Created version");
                return Ok(JSend::success(file_to_response(&file)));
            }
            "size" => {
                transfer.total_size = Some(parse_size(&field_text(field, "size").await?)?);
            }
            _ => {}
        }
    }

    Err(ApiError::bad_request("file field is required"))
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state.manager.get_file_info(&id).map_err(file_error)?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (file, reader) = state.manager.download_file(&id).await.map_err(file_error)?;

    let headers = [
        (header::CONTENT_TYPE, file.mime_type.clone()),
        (header::CONTENT_LENGTH, file.byte_size.to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&file.name)),
    ];
    let body = Body::from_stream(ReaderStream::new(reader));

    Ok((headers, body).into_response())
}

pub async fn list_files(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListFilesParams>,
) -> Result<Json<JSendPaginated<FileResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let filter = FileFilter {
        file_type: params.file_type,
        status: params.status,
        extension: params.extension,
        tag: params.tag,
    };
    let files = state.manager.list_files(&filter);
    let total = files.len() as u64;
    let items: Vec<FileResponse> = files
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(file_to_response)
        .collect();

    Ok(JSend::page(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.manager.delete_file(&id).await.map_err(file_error)?;
    Ok(JSend::success(()))
}

pub async fn update_metadata(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(metadata): AppJson<HashMap<String, serde_json::Value>>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    if metadata.is_empty() {
        return Err(ApiError::bad_request("metadata must not be empty"));
    }

    let file = state
        .manager
        .update_metadata(&id, metadata)
        .map_err(file_error)?;

    tracing::debug!(file_id = %id, "Updated metadata");
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn add_tags(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<AddTagsRequest>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    if req.tags.iter().all(|t| t.trim().is_empty()) {
        return Err(ApiError::bad_request("at least one tag must be provided"));
    }

    let file = state.manager.add_tags(&id, req.tags).map_err(file_error)?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn set_permissions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(permissions): AppJson<FilePermissions>,
) -> Result<Json<JSend<FileResponse>>, ApiError> {
    let file = state
        .manager
        .set_permissions(&id, permissions)
        .map_err(file_error)?;
    Ok(JSend::success(file_to_response(&file)))
}

pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<UploadProgress>>, ApiError> {
    state
        .manager
        .get_upload_progress(&id)
        .map(JSend::success)
        .ok_or_else(|| ApiError::not_found("No upload in progress for this file"))
}

// ============================================================================
// Helpers
// ============================================================================

async fn next_field(multipart: &mut Multipart) -> Result<Option<Field<'_>>, ApiError> {
    multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))
}

async fn field_text(field: Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid {name}: {e}")))
}

fn field_reader<'a>(field: Field<'a>) -> impl AsyncRead + Send + 'a {
    StreamReader::new(field.map_err(io::Error::other))
}

fn parse_size(text: &str) -> Result<u64, ApiError> {
    text.trim()
        .parse()
        .map_err(|_| ApiError::bad_request("size must be a non-negative integer"))
}

/// Header-safe attachment disposition; non-printable and non-ASCII
/// characters are replaced.
fn content_disposition(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

fn asset_to_response(asset: &AssetDescriptor) -> AssetResponse {
    AssetResponse {
        byte_size: asset.byte_size,
        height: asset.height,
        mime_type: asset.mime_type.clone(),
        width: asset.width,
    }
}

fn file_to_response(file: &FileRecord) -> FileResponse {
    FileResponse {
        accessed_at: file.accessed_at.to_rfc3339(),
        byte_size: file.byte_size,
        checksum: file.checksum.clone(),
        content_hash: file.content_hash.clone(),
        created_at: file.created_at.to_rfc3339(),
        extension: file.extension.clone(),
        file_type: file.file_type,
        id: file.id.clone(),
        metadata: file.metadata.clone(),
        mime_type: file.mime_type.clone(),
        name: file.name.clone(),
        original_name: file.original_name.clone(),
        permissions: file.permissions.clone(),
        preview: file.preview.as_ref().map(asset_to_response),
        status: file.status,
        tags: file.tags.clone(),
        thumbnail: file.thumbnail.as_ref().map(asset_to_response),
        updated_at: file.updated_at.to_rfc3339(),
        uploaded_by: file.uploaded_by.clone(),
        versions: file
            .versions
            .iter()
            .map(|v| VersionResponse {
                byte_size: v.byte_size,
                checksum: v.checksum.clone(),
                content_hash: v.content_hash.clone(),
                created_at: v.created_at.to_rfc3339(),
                version: v.version,
            })
            .collect(),
        virus_scan: file.virus_scan.clone(),
    }
}
