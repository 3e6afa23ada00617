use std::sync::Arc;

use uuid::Uuid;

use crate::{
    content::{ContentBlock, DISPLAY_MESSAGE, FileMetadata, FileRecord, ResponsePayload},
    encode,
    error::{ImageGenError, Result},
    fetch::{DEFAULT_MIME_TYPE, FetchedImage},
    storage::{FileContext, ImageUploader, OutputPaths, UploadMetadata, UploadRequest},
    types::{GenerationInfo, GenerationRequest},
};

/// Representation an image is materialized into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Inline data URI in content blocks
    Agent,
    /// Upload collaborator plus a metadata record
    Persisted,
    /// File under the user's directory, referenced by markdown
    Markdown,
}

impl OutputMode {
    /// Persisted mode needs both the caller's request for metadata and an
    /// uploader to hand the image to
    pub fn select(is_agent: bool, return_metadata: bool, has_uploader: bool) -> Self {
        if is_agent {
            Self::Agent
        } else if return_metadata && has_uploader {
            Self::Persisted
        } else {
            Self::Markdown
        }
    }
}

/// Caller-side facts the materializer needs beyond the image itself
#[derive(Debug, Clone, Copy)]
pub struct MaterializeContext<'a> {
    pub request: &'a GenerationRequest,
    pub info: &'a GenerationInfo,
    pub user_id: &'a str,
}

/// Turns fetched image bytes into a response payload
#[derive(Clone)]
pub struct Materializer {
    paths: OutputPaths,
    uploader: Option<Arc<dyn ImageUploader>>,
}

impl Materializer {
    pub fn new(paths: OutputPaths) -> Self {
        Self { paths, uploader: None }
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn ImageUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn has_uploader(&self) -> bool {
        self.uploader.is_some()
    }

    /// Produce the payload for `mode`
    ///
    /// Persistence failures are logged and yield `None`; they never fail
    /// the invocation.
    pub async fn materialize(
        &self,
        image: &FetchedImage,
        mode: OutputMode,
        context: MaterializeContext<'_>,
    ) -> Option<ResponsePayload> {
        let result = match mode {
            OutputMode::Agent => Ok(Self::content_blocks(image)),
            OutputMode::Persisted => self.upload(image, context).await,
            OutputMode::Markdown => self.save_markdown(image, context).await,
        };

        match result {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!(error = %e, mode = ?mode, user_id = context.user_id, "error while saving the image");
                None
            }
        }
    }

    fn content_blocks(image: &FetchedImage) -> ResponsePayload {
        ResponsePayload::AgentContentBlocks {
            text: vec![ContentBlock::text(DISPLAY_MESSAGE)],
            image: ContentBlock::image_url(image.data_uri()),
        }
    }

    async fn upload(&self, image: &FetchedImage, context: MaterializeContext<'_>) -> Result<ResponsePayload> {
        let uploader = self
            .uploader
            .as_ref()
            .ok_or_else(|| ImageGenError::PersistenceFailed("no uploader configured".to_owned()))?;

        let buffer = encode::to_png(&image.bytes, None)?;
        let (width, height) = encode::dimensions(&buffer)?;
        let file_id = Uuid::new_v4();

        let file = uploader
            .upload(UploadRequest {
                user_id: context.user_id.to_owned(),
                context: FileContext::ImageGeneration,
                metadata: UploadMetadata {
                    bytes: buffer.len() as u64,
                    buffer,
                    width,
                    height,
                    filename: format!("{file_id}.png"),
                    mime_type: DEFAULT_MIME_TYPE.to_owned(),
                    file_id,
                },
            })
            .await?;

        Ok(ResponsePayload::FileRecord(Box::new(FileRecord {
            file,
            prompt: context.request.prompt.clone(),
            metadata: FileMetadata {
                negative_prompt: context.request.negative_prompt.clone(),
                seed: context.info.seed,
                info: context.info.summary_line(),
            },
        })))
    }

    async fn save_markdown(&self, image: &FetchedImage, context: MaterializeContext<'_>) -> Result<ResponsePayload> {
        let encoded = encode::to_png(&image.bytes, context.info.parameters())?;

        let filename = format!("{}.png", Uuid::new_v4());
        let dir = self.paths.ensure_user_dir(context.user_id).await?;
        let target = dir.join(&filename);

        tokio::fs::write(&target, &encoded).await.map_err(|e| {
            ImageGenError::PersistenceFailed(format!("failed to write {}: {e}", target.display()))
        })?;

        tracing::debug!(path = %target.display(), bytes = encoded.len(), "saved generated image");

        let url = self.paths.public_url(context.user_id, &filename)?;
        Ok(ResponsePayload::markdown_image(&url))
    }
}
