use std::path::Path;

use url::Url;

use crate::Config;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let config = Self::parse(&raw)?;

        tracing::debug!(path = %path.display(), "configuration loaded");

        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded = crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// A missing backend URL is not an error here: the tool decides whether
    /// that is fatal based on the `override` flag.
    ///
    /// # Errors
    ///
    /// Returns an error if a generation parameter is out of range or the
    /// backend URL is malformed
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_backend_url()?;
        self.validate_generation_params()?;
        Ok(())
    }

    fn validate_backend_url(&self) -> anyhow::Result<()> {
        let Some(raw) = self.comfyui.url.as_deref().map(str::trim).filter(|url| !url.is_empty()) else {
            return Ok(());
        };

        let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("comfyui.url is not a valid URL '{raw}': {e}"))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("comfyui.url must use http or https, got '{}'", url.scheme());
        }

        Ok(())
    }

    fn validate_generation_params(&self) -> anyhow::Result<()> {
        let comfyui = &self.comfyui;

        if comfyui.steps == 0 {
            anyhow::bail!("comfyui.steps must be greater than 0");
        }

        if comfyui.batch_size == 0 {
            anyhow::bail!("comfyui.batch_size must be greater than 0");
        }

        if !comfyui.cfg.is_finite() || comfyui.cfg <= 0.0 {
            anyhow::bail!("comfyui.cfg must be a positive number");
        }

        if comfyui.checkpoint.trim().is_empty() {
            anyhow::bail!("comfyui.checkpoint must not be empty");
        }

        Ok(())
    }
}
