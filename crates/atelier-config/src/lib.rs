#![allow(clippy::must_use_candidate)]

pub mod comfyui;
mod env;
mod loader;
pub mod paths;
pub mod telemetry;

use serde::Deserialize;

pub use comfyui::*;
pub use env::ExpandError;
pub use paths::*;
pub use telemetry::*;

/// Top-level Atelier configuration
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `ComfyUI` backend and generation parameters
    #[serde(default)]
    pub comfyui: ComfyUiConfig,
    /// Where generated images are written and served from
    #[serde(default)]
    pub paths: PathsConfig,
    /// Logging configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
