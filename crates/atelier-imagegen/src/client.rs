use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{ImageGenError, Result},
    events::{self, EventStream},
    execution::{Completion, ExecutionEvent, ExecutionObserver, PromptTracker, Step},
    http_client::http_client,
    types::{GenerationResult, ImageReference, NodeOutput},
    workflow::{Graph, WorkflowGraph},
};

/// Operating system the backend runs on, as far as path encoding goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendOs {
    #[default]
    Posix,
    Windows,
}

impl BackendOs {
    /// Rewrite path separators of a model path for this backend
    pub fn encode_path(self, path: &str) -> String {
        match self {
            Self::Posix => path.replace('\\', "/"),
            Self::Windows => path.replace('/', "\\"),
        }
    }
}

#[derive(Serialize)]
struct QueuePromptRequest<'a> {
    prompt: &'a Graph,
    client_id: String,
}

#[derive(Deserialize)]
struct QueuePromptResponse {
    prompt_id: String,
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    node_errors: Map<String, Value>,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: HashMap<String, NodeOutput>,
}

#[derive(Deserialize)]
struct SystemStats {
    system: SystemInfo,
}

#[derive(Deserialize)]
struct SystemInfo {
    #[serde(default)]
    os: String,
}

/// Async client for a `ComfyUI` backend
///
/// Each instance identifies itself with a random client id, shared by the
/// event subscription and every prompt it submits.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    http: reqwest::Client,
    base_url: Url,
    client_id: Uuid,
}

impl ComfyClient {
    /// Create a new client for the backend at `base_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new(base_url: Url) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            base_url,
            client_id: Uuid::new_v4(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&raw).map_err(|e| ImageGenError::ConnectionError(format!("invalid backend URL '{raw}': {e}")))
    }

    /// Websocket URL of the event stream for this client
    pub(crate) fn ws_url(&self) -> Result<Url> {
        let mut url = self.endpoint("ws")?;

        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|()| ImageGenError::ConnectionError(format!("cannot derive websocket URL from {url}")))?;
        url.query_pairs_mut()
            .append_pair("clientId", &self.client_id.to_string());

        Ok(url)
    }

    /// URL serving one output image
    ///
    /// GET `/view?filename=..&subfolder=..&type=..`
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL cannot be extended
    pub fn view_url(&self, image: &ImageReference) -> Result<Url> {
        let mut url = self.endpoint("view")?;
        url.query_pairs_mut()
            .append_pair("filename", &image.filename)
            .append_pair("subfolder", &image.subfolder)
            .append_pair("type", &image.folder_type);
        Ok(url)
    }

    /// Ask the backend which OS it runs on
    ///
    /// GET `/system_stats`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer is malformed
    pub async fn backend_os(&self) -> Result<BackendOs> {
        let response = self
            .http
            .get(self.endpoint("system_stats")?)
            .send()
            .await
            .map_err(|e| ImageGenError::ConnectionError(format!("failed to read system stats: {e}")))?;

        if !response.status().is_success() {
            return Err(ImageGenError::InvalidResponse(format!(
                "system stats returned {}",
                response.status()
            )));
        }

        let stats: SystemStats = response
            .json()
            .await
            .map_err(|e| ImageGenError::InvalidResponse(format!("malformed system stats: {e}")))?;

        Ok(if stats.system.os == "nt" {
            BackendOs::Windows
        } else {
            BackendOs::Posix
        })
    }

    /// Submit a graph for execution and return its prompt id
    ///
    /// POST `/prompt`
    ///
    /// # Errors
    ///
    /// Returns `GenerationFailed` if the backend rejects the graph
    pub async fn queue_prompt(&self, graph: &WorkflowGraph) -> Result<String> {
        let body = QueuePromptRequest {
            prompt: graph.nodes(),
            client_id: self.client_id.to_string(),
        };

        let response = self
            .http
            .post(self.endpoint("prompt")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "prompt submission failed");
                ImageGenError::ConnectionError(format!("failed to submit prompt: {e}"))
            })?;

        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(status = %status, "backend rejected prompt");
            return Err(ImageGenError::GenerationFailed(format!(
                "backend rejected prompt ({status}): {message}"
            )));
        }

        let queued: QueuePromptResponse = response
            .json()
            .await
            .map_err(|e| ImageGenError::InvalidResponse(format!("malformed prompt response: {e}")))?;

        if !queued.node_errors.is_empty() {
            return Err(ImageGenError::GenerationFailed(format!(
                "backend reported node errors: {}",
                Value::Object(queued.node_errors)
            )));
        }

        tracing::debug!(
            prompt_id = %queued.prompt_id,
            number = queued.number,
            template = graph.template(),
            "prompt queued"
        );

        Ok(queued.prompt_id)
    }

    /// Images recorded for a node in the prompt's history
    ///
    /// GET `/history/{prompt_id}`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the answer is malformed
    pub async fn output_images(&self, prompt_id: &str, node: &str) -> Result<Vec<ImageReference>> {
        let response = self
            .http
            .get(self.endpoint(&format!("history/{prompt_id}"))?)
            .send()
            .await
            .map_err(|e| ImageGenError::ConnectionError(format!("failed to read history: {e}")))?;

        if !response.status().is_success() {
            return Err(ImageGenError::InvalidResponse(format!(
                "history returned {}",
                response.status()
            )));
        }

        let mut history: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .map_err(|e| ImageGenError::InvalidResponse(format!("malformed history: {e}")))?;

        Ok(history
            .remove(prompt_id)
            .and_then(|mut entry| entry.outputs.remove(node))
            .map(|output| output.images)
            .unwrap_or_default())
    }

    /// Run a graph to completion
    ///
    /// Subscribes to the event stream first, then submits. Resolves once,
    /// with the output images or the first failure. There is no timeout: a
    /// backend that never finishes keeps this pending.
    ///
    /// # Errors
    ///
    /// Returns `GenerationFailed` when the backend fails the prompt or it
    /// finishes without images, `ConnectionError` when the stream drops
    pub async fn execute(&self, graph: &WorkflowGraph, observer: &dyn ExecutionObserver) -> Result<GenerationResult> {
        let mut completion = Completion::new(observer);

        let mut events = match events::subscribe(self.ws_url()?).await {
            Ok(events) => events,
            Err(e) => return Err(completion.abort(e)),
        };

        let prompt_id = match self.queue_prompt(graph).await {
            Ok(prompt_id) => prompt_id,
            Err(e) => return Err(completion.abort(e)),
        };

        let mut tracker = PromptTracker::new(prompt_id, graph.output_node());
        self.drive(&mut events, &mut tracker, &mut completion).await
    }

    async fn drive(
        &self,
        events: &mut EventStream,
        tracker: &mut PromptTracker,
        completion: &mut Completion<'_>,
    ) -> Result<GenerationResult> {
        loop {
            let message = match events.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(completion.abort(e)),
                None => {
                    return Err(completion.abort(ImageGenError::ConnectionError(
                        "event stream ended before the prompt finished".to_owned(),
                    )));
                }
            };

            let event = match tracker.handle(message) {
                Step::Ignore => continue,
                Step::Progress(progress) => ExecutionEvent::Progress(progress),
                Step::Failed(message) => ExecutionEvent::Failed(message),
                Step::Completed(images) => {
                    let images = if images.is_empty() {
                        self.history_images(tracker).await
                    } else {
                        images
                    };

                    ExecutionEvent::Finished(GenerationResult {
                        prompt_id: tracker.prompt_id().to_owned(),
                        images,
                    })
                }
            };

            if let Some(outcome) = completion.observe(event) {
                return outcome;
            }
        }
    }

    // Cached executions finish without an `executed` event for the output node
    async fn history_images(&self, tracker: &PromptTracker) -> Vec<ImageReference> {
        match self.output_images(tracker.prompt_id(), tracker.output_node()).await {
            Ok(images) => {
                tracing::debug!(prompt_id = tracker.prompt_id(), images = images.len(), "read outputs from history");
                images
            }
            Err(e) => {
                tracing::warn!(prompt_id = tracker.prompt_id(), error = %e, "failed to read outputs from history");
                Vec::new()
            }
        }
    }
}
