use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use super::{GeneratedAsset, PreviewGenerator, ProcessingError, ThumbnailGenerator};
use crate::storage::models::{FileRecord, FileType};

/// Built-in generator: PNG thumbnails and previews for images, UTF-8
/// excerpts for text. Other types, and images above `max_image_bytes`,
/// are declined before any content is read.
#[derive(Debug, Clone)]
pub struct ImageAssetGenerator {
    pub thumbnail_size: u32,
    pub preview_size: u32,
    pub text_excerpt_bytes: usize,
    /// Largest image that is decoded whole
    pub max_image_bytes: u64,
}

impl Default for ImageAssetGenerator {
    fn default() -> Self {
        Self {
            thumbnail_size: 256,
            preview_size: 1024,
            text_excerpt_bytes: 4096,
            max_image_bytes: 32 * 1024 * 1024, // 32MB
        }
    }
}

impl ImageAssetGenerator {
    fn image_input(&self, file: &FileRecord) -> Option<u64> {
        if file.byte_size > self.max_image_bytes {
            tracing::debug!(
                file_id = %file.id,
                byte_size = file.byte_size,
                "Image too large to decode, skipping derived assets"
            );
            return None;
        }
        Some(file.byte_size)
    }

    /// Decode, shrink to fit `max` (never upscale), and re-encode as PNG on
    /// the blocking pool.
    async fn render_png(data: Bytes, max: u32) -> Result<GeneratedAsset, ProcessingError> {
        tokio::task::spawn_blocking(move || {
            let img = image::load_from_memory(&data)
                .map_err(|e| ProcessingError::Decode(e.to_string()))?;
            let fitted = if img.width() <= max && img.height() <= max {
                img
            } else {
                img.thumbnail(max, max)
            };
            encode_png(&fitted)
        })
        .await
        .map_err(|e| ProcessingError::Task(e.to_string()))?
    }
}

fn encode_png(img: &DynamicImage) -> Result<GeneratedAsset, ProcessingError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ProcessingError::Encode(e.to_string()))?;
    Ok(GeneratedAsset {
        data: out.into_inner(),
        mime_type: "image/png".to_string(),
        extension: "png",
        width: Some(img.width()),
        height: Some(img.height()),
    })
}

/// Longest valid UTF-8 prefix of at most `limit` bytes.
fn text_excerpt(data: &[u8], limit: usize) -> Result<&str, ProcessingError> {
    let head = &data[..data.len().min(limit)];
    match std::str::from_utf8(head) {
        Ok(text) => Ok(text),
        // A multi-byte character cut at the limit is fine; garbage is not.
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => {
            Ok(std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or_default())
        }
        Err(e) => Err(ProcessingError::Decode(format!("not UTF-8 text: {e}"))),
    }
}

#[async_trait]
impl ThumbnailGenerator for ImageAssetGenerator {
    fn thumbnail_input(&self, file: &FileRecord) -> Option<u64> {
        match file.file_type {
            FileType::Image => self.image_input(file),
            _ => None,
        }
    }

    async fn thumbnail(
        &self,
        file: &FileRecord,
        data: Bytes,
    ) -> Result<GeneratedAsset, ProcessingError> {
        match file.file_type {
            FileType::Image => Self::render_png(data, self.thumbnail_size).await,
            other => Err(ProcessingError::Unsupported(other)),
        }
    }
}

#[async_trait]
impl PreviewGenerator for ImageAssetGenerator {
    fn preview_input(&self, file: &FileRecord) -> Option<u64> {
        match file.file_type {
            FileType::Image => self.image_input(file),
            FileType::Text => Some(file.byte_size.min(self.text_excerpt_bytes as u64)),
            _ => None,
        }
    }

    async fn preview(
        &self,
        file: &FileRecord,
        data: Bytes,
    ) -> Result<GeneratedAsset, ProcessingError> {
        match file.file_type {
            FileType::Image => Self::render_png(data, self.preview_size).await,
            FileType::Text => {
                let excerpt = text_excerpt(&data, self.text_excerpt_bytes)?;
                Ok(GeneratedAsset {
                    data: excerpt.as_bytes().to_vec(),
                    mime_type: "text/plain; charset=utf-8".to_string(),
                    extension: "txt",
                    width: None,
                    height: None,
                })
            }
            other => Err(ProcessingError::Unsupported(other)),
        }
    }
}
