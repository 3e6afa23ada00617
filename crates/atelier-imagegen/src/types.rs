use std::ops::RangeInclusive;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Range the default seed is drawn from
pub const SEED_RANGE: RangeInclusive<u64> = 10_000_000_000..=999_999_999_999;

/// Width and height used when the caller gives none
pub const DEFAULT_DIMENSION: u32 = 512;

/// Tool input as supplied by the caller
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ToolInput {
    /// Positive prompt
    #[schemars(
        description = "Detailed keywords to describe the subject, using at least 7 keywords to accurately describe the image, separated by comma"
    )]
    pub prompt: String,
    /// Negative prompt
    #[schemars(
        description = "Keywords we want to exclude from the final image, using at least 7 keywords to accurately describe the image, separated by comma"
    )]
    pub negative_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub seed: Option<u64>,
}

impl ToolInput {
    pub fn new(prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            width: None,
            height: None,
            seed: None,
        }
    }
}

/// One generation, with every default resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

impl GenerationRequest {
    /// Resolve caller input
    ///
    /// Zero or absent dimensions become 512. A caller-supplied seed is used
    /// verbatim, even outside [`SEED_RANGE`].
    pub fn from_input(input: ToolInput) -> Self {
        Self {
            prompt: input.prompt,
            negative_prompt: input.negative_prompt,
            width: input.width.filter(|w| *w > 0).unwrap_or(DEFAULT_DIMENSION),
            height: input.height.filter(|h| *h > 0).unwrap_or(DEFAULT_DIMENSION),
            seed: input.seed.unwrap_or_else(random_seed),
        }
    }
}

/// Draw a seed from [`SEED_RANGE`]
pub fn random_seed() -> u64 {
    rand::rng().random_range(SEED_RANGE)
}

/// Step progress reported while a node executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationProgress {
    pub node_id: Option<String>,
    pub current_step: u64,
    pub max_step: u64,
}

/// Locator of one output image on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Successful execution: never empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub prompt_id: String,
    pub images: Vec<ImageReference>,
}

/// Output of a single node, as reported by events and history
#[derive(Debug, Default, Deserialize)]
pub(crate) struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageReference>,
}

/// Parameters recorded alongside a generated image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub infotexts: Vec<String>,
}

impl GenerationInfo {
    /// Defaults taken from the request, with no info text
    pub fn from_request(request: &GenerationRequest) -> Self {
        Self {
            width: request.width,
            height: request.height,
            seed: request.seed,
            infotexts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_infotext(mut self, text: impl Into<String>) -> Self {
        self.infotexts.push(text.into());
        self
    }

    /// Full text of the first info entry
    pub fn parameters(&self) -> Option<&str> {
        self.infotexts.first().map(String::as_str)
    }

    /// Last non-empty line of the first info entry, trimmed
    pub fn summary_line(&self) -> Option<String> {
        self.parameters()?
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(ToOwned::to_owned)
    }
}
