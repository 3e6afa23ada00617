use indexmap::IndexMap;
use serde_json::Value;

use super::{Graph, Slot, WorkflowTemplate};
use crate::error::{ImageGenError, Result};

/// Binds runtime values into a template's declared slots
///
/// Binding is plain substitution into the node's `inputs`; a later binding
/// for the same slot replaces the earlier one. Nothing touches the template
/// until [`GraphBuilder::build`] succeeds.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    template: &'a WorkflowTemplate,
    bindings: IndexMap<Slot, Value>,
    undeclared: Vec<Slot>,
}

impl<'a> GraphBuilder<'a> {
    pub(super) fn new(template: &'a WorkflowTemplate) -> Self {
        Self {
            template,
            bindings: IndexMap::new(),
            undeclared: Vec::new(),
        }
    }

    /// Bind `value` at `slot`
    ///
    /// Binding a slot the template does not declare is a programming error
    /// and surfaces from `build` as `UndeclaredSlot`.
    #[must_use]
    pub fn bind(mut self, slot: Slot, value: impl Into<Value>) -> Self {
        if self.template.declares(slot) {
            self.bindings.insert(slot, value.into());
        } else {
            self.undeclared.push(slot);
        }
        self
    }

    /// Produce the executable graph
    ///
    /// # Errors
    ///
    /// `UndeclaredSlot` if a binding targeted an unknown slot,
    /// `BuildIncomplete` listing every declared slot left unbound
    pub fn build(self) -> Result<WorkflowGraph> {
        if let Some(slot) = self.undeclared.first() {
            return Err(ImageGenError::UndeclaredSlot {
                slot: *slot,
                template: self.template.name().to_owned(),
            });
        }

        let missing: Vec<Slot> = self
            .template
            .slots()
            .map(|(slot, _)| slot)
            .filter(|slot| !self.bindings.contains_key(slot))
            .collect();

        if !missing.is_empty() {
            return Err(ImageGenError::BuildIncomplete { missing });
        }

        let mut nodes = self.template.graph().clone();

        for (slot, value) in self.bindings {
            let Some(address) = self.template.slot(slot) else {
                continue;
            };

            let inputs = nodes
                .get_mut(&address.node)
                .and_then(|node| node.get_mut("inputs"))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    ImageGenError::InvalidTemplate(format!("slot '{slot}' lost its node '{}'", address.node))
                })?;

            inputs.insert(address.field.clone(), value);
        }

        Ok(WorkflowGraph {
            template: self.template.name().to_owned(),
            nodes,
            output_node: self.template.output().node.clone(),
        })
    }
}

/// A template with every slot bound, ready for submission
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    template: String,
    nodes: Graph,
    output_node: String,
}

impl WorkflowGraph {
    /// Name of the template this graph was built from
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn nodes(&self) -> &Graph {
        &self.nodes
    }

    /// Node id whose output carries the image references
    pub fn output_node(&self) -> &str {
        &self.output_node
    }

    /// Current value of a node input
    pub fn input(&self, node: &str, field: &str) -> Option<&Value> {
        self.nodes.get(node)?.get("inputs")?.get(field)
    }
}
