#![allow(
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::unused_self
)]

mod client;
mod content;
pub mod encode;
mod error;
mod events;
mod execution;
mod fetch;
mod http_client;
mod materialize;
mod storage;
mod tool;
mod types;
pub mod workflow;

use std::sync::Arc;

pub use client::{BackendOs, ComfyClient};
pub use content::{
    ContentBlock, DISPLAY_MESSAGE, ERROR_MESSAGE, FileMetadata, FileRecord, ImageUrl, ResponsePayload, ToolOutput,
};
pub use error::{ImageGenError, Result};
pub use execution::{Completion, ExecutionEvent, ExecutionObserver, ExecutionState, TracingObserver};
pub use fetch::{DEFAULT_MIME_TYPE, FetchedImage, ImageFetcher};
pub use materialize::{MaterializeContext, Materializer, OutputMode};
pub use storage::{
    FileContext, ImageUploader, LocalImageStorage, OutputPaths, StoredFile, UploadMetadata, UploadRequest,
};
pub use tool::{CallContext, ComfyUiTool, ComfyUiToolBuilder, GenerationParams, TOOL_NAME};
pub use types::{
    DEFAULT_DIMENSION, GenerationInfo, GenerationProgress, GenerationRequest, GenerationResult, ImageReference,
    SEED_RANGE, ToolInput, random_seed,
};
pub use workflow::{Slot, WorkflowGraph, WorkflowTemplate};

/// Build the tool from configuration, storing uploads on local disk
///
/// # Errors
///
/// Returns an error if no backend URL is configured and `override` is off
pub fn build_tool(config: &atelier_config::Config) -> anyhow::Result<ComfyUiTool> {
    let storage = LocalImageStorage::new(OutputPaths::from_config(&config.paths));

    ComfyUiToolBuilder::new(config)
        .with_uploader(Arc::new(storage))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to initialize ComfyUI tool: {e}"))
}
