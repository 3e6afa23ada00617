use thiserror::Error;

use crate::workflow::Slot;

pub type Result<T> = std::result::Result<T, ImageGenError>;

/// Errors raised along the generation pipeline
///
/// Only `MissingConfiguration` escapes the tool facade; every other
/// variant is logged and turned into the fixed error text or a degraded
/// result.
#[derive(Debug, Error)]
pub enum ImageGenError {
    /// No backend URL configured and no override set
    #[error("Missing COMFYUI_URL: no ComfyUI backend URL configured")]
    MissingConfiguration,

    /// Declared slots without a binding
    #[error("Workflow graph is incomplete, unbound slots: {}", join_slots(.missing))]
    BuildIncomplete { missing: Vec<Slot> },

    /// Binding for a slot the template never declared
    #[error("Slot '{slot}' is not declared by workflow template '{template}'")]
    UndeclaredSlot { slot: Slot, template: String },

    /// Template document failed load-time validation
    #[error("Invalid workflow template: {0}")]
    InvalidTemplate(String),

    /// Backend reported a terminal failure, or finished without output
    #[error("Image generation failed: {0}")]
    GenerationFailed(String),

    /// Non-success status while retrieving the output image
    #[error("Failed to fetch generated image ({status}): {message}")]
    FetchFailed { status: u16, message: String },

    /// Network or connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Backend answered with something we could not interpret
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// Generation info text is absent or malformed
    #[error("Failed to read generation info: {0}")]
    MetadataParseFailed(String),

    /// Storage or disk write error
    #[error("Failed to persist image: {0}")]
    PersistenceFailed(String),
}

fn join_slots(slots: &[Slot]) -> String {
    slots.iter().copied().map(Slot::as_str).collect::<Vec<_>>().join(", ")
}
