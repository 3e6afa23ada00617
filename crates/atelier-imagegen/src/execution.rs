//! Single-outcome execution tracking
//!
//! The backend reports progress and completion as a stream of loosely
//! ordered events. [`PromptTracker`] narrows that stream to one prompt and
//! [`Completion`] settles it exactly once.

use crate::{
    error::{ImageGenError, Result},
    events::ServerMessage,
    types::{GenerationProgress, GenerationResult, ImageReference},
};

/// Lifecycle of one submitted graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Submitted,
    Running,
    Finished,
    Failed,
}

impl ExecutionState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Events fed into a [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Progress(GenerationProgress),
    Finished(GenerationResult),
    Failed(String),
}

/// Hooks invoked as an execution advances
///
/// Terminal hooks fire at most once per execution, and never both.
pub trait ExecutionObserver: Send + Sync {
    fn on_progress(&self, _progress: &GenerationProgress) {}

    fn on_finished(&self, _result: &GenerationResult) {}

    fn on_failed(&self, _error: &str) {}
}

/// Logs execution events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_progress(&self, progress: &GenerationProgress) {
        tracing::debug!(
            node = progress.node_id.as_deref().unwrap_or("-"),
            "image generating... {}/{}",
            progress.current_step,
            progress.max_step
        );
    }

    fn on_finished(&self, result: &GenerationResult) {
        tracing::debug!(prompt_id = %result.prompt_id, images = result.images.len(), "image generation finished");
    }

    fn on_failed(&self, error: &str) {
        tracing::error!(error, "failed to generate image");
    }
}

/// Settles an execution exactly once
///
/// The first terminal event decides the outcome; anything after it is
/// dropped. `Finished` without images is turned into a failure.
pub struct Completion<'a> {
    state: ExecutionState,
    observer: &'a dyn ExecutionObserver,
}

impl<'a> Completion<'a> {
    pub fn new(observer: &'a dyn ExecutionObserver) -> Self {
        Self {
            state: ExecutionState::Submitted,
            observer,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Feed one event; returns the outcome when this event settles the execution
    pub fn observe(&mut self, event: ExecutionEvent) -> Option<Result<GenerationResult>> {
        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, "ignoring event after execution settled");
            return None;
        }

        match event {
            ExecutionEvent::Progress(progress) => {
                self.state = ExecutionState::Running;
                self.observer.on_progress(&progress);
                None
            }
            ExecutionEvent::Finished(result) if result.images.is_empty() => {
                self.fail("execution finished without output images".to_owned())
            }
            ExecutionEvent::Finished(result) => {
                self.state = ExecutionState::Finished;
                self.observer.on_finished(&result);
                Some(Ok(result))
            }
            ExecutionEvent::Failed(message) => self.fail(message),
        }
    }

    /// Settle with an error raised outside the event stream
    ///
    /// The observer hears about it only if the execution was still open.
    pub fn abort(&mut self, error: ImageGenError) -> ImageGenError {
        if !self.state.is_terminal() {
            self.state = ExecutionState::Failed;
            self.observer.on_failed(&error.to_string());
        }
        error
    }

    fn fail(&mut self, message: String) -> Option<Result<GenerationResult>> {
        self.state = ExecutionState::Failed;
        self.observer.on_failed(&message);
        Some(Err(ImageGenError::GenerationFailed(message)))
    }
}

/// What one backend message means for the tracked prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Ignore,
    Progress(GenerationProgress),
    /// Images collected from the output node so far, possibly none
    Completed(Vec<ImageReference>),
    Failed(String),
}

/// Filters backend messages down to one prompt and collects its output
#[derive(Debug)]
pub(crate) struct PromptTracker {
    prompt_id: String,
    output_node: String,
    images: Vec<ImageReference>,
}

impl PromptTracker {
    pub(crate) fn new(prompt_id: impl Into<String>, output_node: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            output_node: output_node.into(),
            images: Vec::new(),
        }
    }

    pub(crate) fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub(crate) fn output_node(&self) -> &str {
        &self.output_node
    }

    pub(crate) fn handle(&mut self, message: ServerMessage) -> Step {
        match message {
            ServerMessage::Progress {
                prompt_id,
                node,
                value,
                max,
            } if self.owns(prompt_id.as_deref()) => Step::Progress(GenerationProgress {
                node_id: node,
                current_step: value,
                max_step: max,
            }),
            ServerMessage::Executed {
                prompt_id,
                node,
                images,
            } if self.owns(prompt_id.as_deref()) => {
                if node == self.output_node {
                    self.images.extend(images);
                }
                Step::Ignore
            }
            ServerMessage::Executing { prompt_id, node: None } | ServerMessage::ExecutionSuccess { prompt_id }
                if self.owns(prompt_id.as_deref()) =>
            {
                Step::Completed(std::mem::take(&mut self.images))
            }
            ServerMessage::ExecutionError { prompt_id, message } if self.owns(prompt_id.as_deref()) => {
                Step::Failed(message)
            }
            ServerMessage::ExecutionInterrupted { prompt_id } if self.owns(prompt_id.as_deref()) => {
                Step::Failed("execution was interrupted".to_owned())
            }
            ServerMessage::Other(kind) => {
                tracing::trace!(kind = %kind, "ignoring backend event");
                Step::Ignore
            }
            _ => Step::Ignore,
        }
    }

    // Events without a prompt id are progress for whatever runs now
    fn owns(&self, prompt_id: Option<&str>) -> bool {
        prompt_id.is_none_or(|id| id == self.prompt_id)
    }
}
