//! Workflow templates and the typed slot registry
//!
//! A template is a backend graph in API format (node id -> `class_type` +
//! `inputs`) plus a registry mapping each [`Slot`] to the node input it
//! controls. Registries are validated once, when the template is loaded.

mod builder;

use std::{fmt, sync::OnceLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use builder::{GraphBuilder, WorkflowGraph};

use crate::error::{ImageGenError, Result};

/// Node graph in the backend's API format, keyed by node id
pub type Graph = Map<String, Value>;

const TXT2IMG_SD15: &str = include_str!("workflow/txt2img_sd15.json");

/// Symbolic names of the bindable workflow inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Positive,
    Negative,
    Checkpoint,
    Seed,
    Batch,
    Steps,
    Cfg,
    Sampler,
    Scheduler,
    Width,
    Height,
}

impl Slot {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Checkpoint => "checkpoint",
            Self::Seed => "seed",
            Self::Batch => "batch",
            Self::Steps => "steps",
            Self::Cfg => "cfg",
            Self::Sampler => "sampler",
            Self::Scheduler => "scheduler",
            Self::Width => "width",
            Self::Height => "height",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a slot lives: an input field of one node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotAddress {
    pub node: String,
    pub field: String,
}

/// The node whose execution produces the image references
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSlot {
    pub name: String,
    pub node: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateDocument {
    name: String,
    slots: IndexMap<Slot, SlotAddress>,
    output: OutputSlot,
    graph: Graph,
}

/// A validated, static workflow description
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    name: String,
    graph: Graph,
    slots: IndexMap<Slot, SlotAddress>,
    output: OutputSlot,
}

impl WorkflowTemplate {
    /// The bundled SD 1.5 text-to-image workflow
    pub fn txt2img_sd15() -> Self {
        static TEMPLATE: OnceLock<WorkflowTemplate> = OnceLock::new();

        TEMPLATE
            .get_or_init(|| Self::from_json(TXT2IMG_SD15).expect("bundled workflow template must be valid"))
            .clone()
    }

    /// Load a template document: `{ name, slots, output, graph }`
    ///
    /// # Errors
    ///
    /// Returns `InvalidTemplate` if the document does not parse, a node is
    /// malformed, or a slot or the output points at a missing node or field
    pub fn from_json(raw: &str) -> Result<Self> {
        let document: TemplateDocument = serde_json::from_str(raw)
            .map_err(|e| ImageGenError::InvalidTemplate(format!("failed to parse template document: {e}")))?;

        let template = Self {
            name: document.name,
            graph: document.graph,
            slots: document.slots,
            output: document.output,
        };

        template.validate()?;

        Ok(template)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declares(&self, slot: Slot) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn slot(&self, slot: Slot) -> Option<&SlotAddress> {
        self.slots.get(&slot)
    }

    /// Declared slots in registry order
    pub fn slots(&self) -> impl Iterator<Item = (Slot, &SlotAddress)> {
        self.slots.iter().map(|(slot, address)| (*slot, address))
    }

    pub fn output(&self) -> &OutputSlot {
        &self.output
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Start binding values into a fresh copy of this template
    pub fn builder(&self) -> GraphBuilder<'_> {
        GraphBuilder::new(self)
    }

    fn validate(&self) -> Result<()> {
        if self.graph.is_empty() {
            return Err(self.invalid("graph has no nodes"));
        }

        for (id, node) in &self.graph {
            let has_class = node.get("class_type").is_some_and(Value::is_string);
            let has_inputs = node.get("inputs").is_some_and(Value::is_object);

            if !has_class || !has_inputs {
                return Err(self.invalid(&format!("node '{id}' needs a string class_type and an inputs object")));
            }
        }

        for (slot, address) in &self.slots {
            let Some(inputs) = self.graph.get(&address.node).and_then(|node| node.get("inputs")) else {
                return Err(self.invalid(&format!("slot '{slot}' points at missing node '{}'", address.node)));
            };

            if inputs.get(&address.field).is_none() {
                return Err(self.invalid(&format!(
                    "slot '{slot}' points at missing field '{}' of node '{}'",
                    address.field, address.node
                )));
            }
        }

        if !self.graph.contains_key(&self.output.node) {
            return Err(self.invalid(&format!(
                "output '{}' points at missing node '{}'",
                self.output.name, self.output.node
            )));
        }

        Ok(())
    }

    fn invalid(&self, reason: &str) -> ImageGenError {
        ImageGenError::InvalidTemplate(format!("{}: {reason}", self.name))
    }
}
