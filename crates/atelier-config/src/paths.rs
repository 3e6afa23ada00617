use std::path::PathBuf;

use serde::Deserialize;

/// Filesystem locations for generated images
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Output root; each user gets a subdirectory here
    #[serde(default = "default_image_output")]
    pub image_output: PathBuf,
    /// Root that public image URLs are computed relative to
    #[serde(default = "default_client")]
    pub client: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            image_output: default_image_output(),
            client: default_client(),
        }
    }
}

fn default_image_output() -> PathBuf {
    PathBuf::from("client/public/images")
}

fn default_client() -> PathBuf {
    PathBuf::from("client")
}
