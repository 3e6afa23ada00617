use serde::Deserialize;

/// Environment variable consulted when no backend URL is configured
pub const COMFYUI_URL_ENV: &str = "COMFYUI_URL";

/// `ComfyUI` backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComfyUiConfig {
    /// Base URL of the backend, e.g. `http://127.0.0.1:8188`
    #[serde(default)]
    pub url: Option<String>,
    /// Allow the tool to be constructed without a backend URL
    #[serde(default, rename = "override")]
    pub allow_missing_url: bool,
    /// Checkpoint bound into the loader node
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,
    /// Sampling steps
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Classifier-free guidance scale
    #[serde(default = "default_cfg")]
    pub cfg: f64,
    /// Sampler name understood by the backend
    #[serde(default = "default_sampler")]
    pub sampler: String,
    /// Noise scheduler understood by the backend
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Images per generation
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for ComfyUiConfig {
    fn default() -> Self {
        Self {
            url: None,
            allow_missing_url: false,
            checkpoint: default_checkpoint(),
            steps: default_steps(),
            cfg: default_cfg(),
            sampler: default_sampler(),
            scheduler: default_scheduler(),
            batch_size: default_batch_size(),
        }
    }
}

impl ComfyUiConfig {
    /// Backend URL from the config file, falling back to `COMFYUI_URL`
    ///
    /// Empty values count as absent. Returns `None` when neither source
    /// provides a URL; whether that is fatal depends on `override`.
    pub fn resolve_url(&self) -> Option<String> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| {
                std::env::var(COMFYUI_URL_ENV)
                    .ok()
                    .map(|url| url.trim().to_owned())
                    .filter(|url| !url.is_empty())
            })
    }
}

fn default_checkpoint() -> String {
    "sd-v1-5-pruned-emaonly-fp16.safetensors".to_string()
}

const fn default_steps() -> u32 {
    6
}

const fn default_cfg() -> f64 {
    1.0
}

fn default_sampler() -> String {
    "euler".to_string()
}

fn default_scheduler() -> String {
    "normal".to_string()
}

const fn default_batch_size() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_url_wins_over_environment() {
        temp_env::with_var(COMFYUI_URL_ENV, Some("http://env:8188"), || {
            let config = ComfyUiConfig {
                url: Some("http://explicit:8188".to_owned()),
                ..ComfyUiConfig::default()
            };
            assert_eq!(config.resolve_url().as_deref(), Some("http://explicit:8188"));
        });
    }

    #[test]
    fn falls_back_to_environment() {
        temp_env::with_var(COMFYUI_URL_ENV, Some("http://env:8188"), || {
            let config = ComfyUiConfig::default();
            assert_eq!(config.resolve_url().as_deref(), Some("http://env:8188"));
        });
    }

    #[test]
    fn empty_url_counts_as_missing() {
        temp_env::with_var(COMFYUI_URL_ENV, Some("  "), || {
            let config = ComfyUiConfig {
                url: Some(String::new()),
                ..ComfyUiConfig::default()
            };
            assert!(config.resolve_url().is_none());
        });
    }

    #[test]
    fn missing_everywhere() {
        temp_env::with_var_unset(COMFYUI_URL_ENV, || {
            assert!(ComfyUiConfig::default().resolve_url().is_none());
        });
    }
}
