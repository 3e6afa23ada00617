use std::sync::Arc;

use atelier_config::{ComfyUiConfig, Config};
use serde_json::Value;
use url::Url;

use crate::{
    client::{BackendOs, ComfyClient},
    content::{ResponsePayload, ToolOutput},
    encode,
    error::{ImageGenError, Result},
    execution::{ExecutionObserver, TracingObserver},
    fetch::{FetchedImage, ImageFetcher},
    materialize::{MaterializeContext, Materializer, OutputMode},
    storage::{ImageUploader, OutputPaths},
    types::{GenerationInfo, GenerationRequest, ToolInput},
    workflow::{Slot, WorkflowGraph, WorkflowTemplate},
};

pub const TOOL_NAME: &str = "comfyui";

const DESCRIPTION: &str =
    "You can generate images using text with 'stable-diffusion'. This tool is exclusively for visual content.";

const DESCRIPTION_FOR_MODEL: &str = r#"// Generate images and visuals using text.
// Guidelines:
// - ALWAYS use {{"prompt": "5+ detailed keywords", "negative_prompt": "5+ detailed keywords"}} structure for queries.
// - ALWAYS include the markdown url in your final response to show the user: ![caption](/images/id.png)
// - Visually describe the moods, details, structures, styles, and/or proportions of the image. Remember, the focus is on visual attributes.
// - Craft your input by "showing" and not "telling" the imagery. Think in terms of what you'd want to see in a photograph or a painting.
// - Here's an example for generating a realistic portrait photo of a man:
// "prompt":"photo of a man in black clothes, half body, high detailed skin, coastline, overcast weather, wind, waves, 8k uhd, dslr, soft lighting, high quality, film grain, Fujifilm XT3"
// "negative_prompt":"semi-realistic, cgi, 3d, render, sketch, cartoon, drawing, anime, out of frame, low quality, ugly, mutation, deformed"
// - Generate images only once per human query unless explicitly requested by the user"#;

/// Sampling parameters bound into every graph
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub checkpoint: String,
    pub steps: u32,
    pub cfg: f64,
    pub sampler: String,
    pub scheduler: String,
    pub batch_size: u32,
}

impl GenerationParams {
    pub fn from_config(config: &ComfyUiConfig) -> Self {
        Self {
            checkpoint: config.checkpoint.clone(),
            steps: config.steps,
            cfg: config.cfg,
            sampler: config.sampler.clone(),
            scheduler: config.scheduler.clone(),
            batch_size: config.batch_size,
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_config(&ComfyUiConfig::default())
    }
}

/// Who is calling and what shape they expect back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub user_id: String,
    pub is_agent: bool,
    pub return_metadata: bool,
}

impl CallContext {
    pub fn direct(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn agent(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_agent: true,
            return_metadata: false,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self) -> Self {
        self.return_metadata = true;
        self
    }
}

/// Builder for the tool from configuration
pub struct ComfyUiToolBuilder {
    url: Option<String>,
    allow_missing_url: bool,
    params: GenerationParams,
    paths: OutputPaths,
    template: Option<WorkflowTemplate>,
    uploader: Option<Arc<dyn ImageUploader>>,
    observer: Arc<dyn ExecutionObserver>,
}

impl ComfyUiToolBuilder {
    /// Start from configuration; the URL falls back to `COMFYUI_URL`
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.comfyui.resolve_url(),
            allow_missing_url: config.comfyui.allow_missing_url,
            params: GenerationParams::from_config(&config.comfyui),
            paths: OutputPaths::from_config(&config.paths),
            template: None,
            uploader: None,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Explicit backend URL, taking precedence over configuration
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into()).filter(|url| !url.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn ImageUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Run a custom workflow instead of the bundled one
    #[must_use]
    pub fn with_template(mut self, template: WorkflowTemplate) -> Self {
        self.template = Some(template);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_paths(mut self, paths: OutputPaths) -> Self {
        self.paths = paths;
        self
    }

    /// # Errors
    ///
    /// Returns `MissingConfiguration` when no URL is known and `override`
    /// is not set, `ConnectionError` for a malformed URL
    pub fn build(self) -> Result<ComfyUiTool> {
        let client = match self.url {
            Some(raw) => {
                let url = Url::parse(raw.trim())
                    .map_err(|e| ImageGenError::ConnectionError(format!("invalid backend URL '{raw}': {e}")))?;
                Some(ComfyClient::new(url)?)
            }
            None if self.allow_missing_url => {
                tracing::warn!("no ComfyUI URL configured, generation requests will fail");
                None
            }
            None => return Err(ImageGenError::MissingConfiguration),
        };

        let mut materializer = Materializer::new(self.paths);
        if let Some(uploader) = self.uploader {
            materializer = materializer.with_uploader(uploader);
        }

        let template = self.template.unwrap_or_else(WorkflowTemplate::txt2img_sd15);

        tracing::debug!(
            template = template.name(),
            url = client.as_ref().map_or("-", |c| c.base_url().as_str()),
            "comfyui tool initialized"
        );

        Ok(ComfyUiTool {
            client,
            fetcher: ImageFetcher::new()?,
            materializer,
            template,
            params: self.params,
            observer: self.observer,
        })
    }
}

/// Image generation tool backed by `ComfyUI`
pub struct ComfyUiTool {
    client: Option<ComfyClient>,
    fetcher: ImageFetcher,
    materializer: Materializer,
    template: WorkflowTemplate,
    params: GenerationParams,
    observer: Arc<dyn ExecutionObserver>,
}

impl ComfyUiTool {
    pub fn name(&self) -> &'static str {
        TOOL_NAME
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTION
    }

    pub fn description_for_model(&self) -> &'static str {
        DESCRIPTION_FOR_MODEL
    }

    /// JSON schema of the caller-facing input
    pub fn schema(&self) -> Value {
        schemars::schema_for!(ToolInput).to_value()
    }

    pub fn template(&self) -> &WorkflowTemplate {
        &self.template
    }

    /// Generate an image and shape it for the caller
    ///
    /// Never fails: generation and fetch errors come back as the fixed
    /// error text, persistence errors as an empty result.
    pub async fn call(&self, input: ToolInput, context: &CallContext) -> ToolOutput {
        let request = GenerationRequest::from_input(input);

        tracing::info!(
            user_id = %context.user_id,
            seed = request.seed,
            width = request.width,
            height = request.height,
            agent = context.is_agent,
            "generating image"
        );

        let payload = match self.generate(&request).await {
            Ok(image) => {
                let info = generation_info(&request, &image);
                let mode = OutputMode::select(
                    context.is_agent,
                    context.return_metadata,
                    self.materializer.has_uploader(),
                );

                self.materializer
                    .materialize(
                        &image,
                        mode,
                        MaterializeContext {
                            request: &request,
                            info: &info,
                            user_id: &context.user_id,
                        },
                    )
                    .await
            }
            Err(e) => {
                tracing::error!(error = %e, "error while generating image");
                Some(ResponsePayload::error())
            }
        };

        ToolOutput::from_payload(payload, context.is_agent)
    }

    /// Run the workflow and download its first output image
    ///
    /// # Errors
    ///
    /// Returns the first failure of graph building, execution or fetch
    pub async fn generate(&self, request: &GenerationRequest) -> Result<FetchedImage> {
        let client = self.client.as_ref().ok_or(ImageGenError::MissingConfiguration)?;

        let os = client.backend_os().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to detect backend OS, assuming posix paths");
            BackendOs::default()
        });

        let graph = self.build_graph(request, os)?;
        let result = client.execute(&graph, self.observer.as_ref()).await?;

        let reference = result
            .images
            .first()
            .ok_or_else(|| ImageGenError::GenerationFailed("no output images".to_owned()))?;

        tracing::debug!(prompt_id = %result.prompt_id, filename = %reference.filename, "fetching generated image");

        self.fetcher.fetch(&client.view_url(reference)?).await
    }

    /// Bind request and configured parameters into the template
    ///
    /// Only slots the template declares are bound, so reduced custom
    /// templates work without changes here.
    ///
    /// # Errors
    ///
    /// Returns `BuildIncomplete` if the template declares nothing this tool
    /// can bind
    pub fn build_graph(&self, request: &GenerationRequest, os: BackendOs) -> Result<WorkflowGraph> {
        let values: [(Slot, Value); 11] = [
            (Slot::Positive, request.prompt.clone().into()),
            (Slot::Negative, request.negative_prompt.clone().into()),
            (Slot::Checkpoint, os.encode_path(&self.params.checkpoint).into()),
            (Slot::Seed, request.seed.into()),
            (Slot::Batch, self.params.batch_size.into()),
            (Slot::Steps, self.params.steps.into()),
            (Slot::Cfg, self.params.cfg.into()),
            (Slot::Sampler, self.params.sampler.clone().into()),
            (Slot::Scheduler, self.params.scheduler.clone().into()),
            (Slot::Width, request.width.into()),
            (Slot::Height, request.height.into()),
        ];

        values
            .into_iter()
            .filter(|(slot, _)| self.template.declares(*slot))
            .fold(self.template.builder(), |builder, (slot, value)| builder.bind(slot, value))
            .build()
    }
}

fn generation_info(request: &GenerationRequest, image: &FetchedImage) -> GenerationInfo {
    let info = GenerationInfo::from_request(request);

    let parsed = encode::read_infotext(&image.bytes).and_then(|text| {
        text.ok_or_else(|| ImageGenError::MetadataParseFailed("image carries no generation parameters".to_owned()))
    });

    match parsed {
        Ok(text) => info.with_infotext(text),
        Err(e) => {
            tracing::warn!(error = %e, "error while getting image metadata");
            info
        }
    }
}
