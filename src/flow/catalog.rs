//! Flow topologies declared in TOML.
//!
//! One flow per file:
//!
//! ```toml
//! [flow]
//! name = "order-flow"
//!
//! [[flow.steps]]
//! name = "start"
//! role = "entry"
//! emits = ["start.completed"]
//!
//! [[flow.steps]]
//! name = "ship"
//! subscribes = ["start.completed"]
//! ```
//!
//! Handlers are bound in code by step name when the flow is registered.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::graph::FlowGraph;
use crate::error::{Error, Result};
use crate::model::flow::FlowDefinition;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct FlowFile {
    flow: FlowDefinition,
}

/// Validated flow definitions, indexed by name.
#[derive(Debug, Default)]
pub struct FlowCatalog {
    flows: BTreeMap<String, (FlowDefinition, FlowGraph)>,
}

impl FlowCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load and validate every `.toml` file in `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::Config(format!("cannot read flow dir {}: {e}", dir.display())))?;

        let mut catalog = Self::empty();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let definition = parse(&content)
                    .map_err(|e| Error::Config(format!("bad flow file {}: {e}", path.display())))?;
                catalog.insert(definition)?;
            }
        }
        Ok(catalog)
    }

    /// Validate and add one definition. Names must be unique.
    pub fn insert(&mut self, definition: FlowDefinition) -> Result<()> {
        let graph = FlowGraph::analyze(&definition)?;
        if self.flows.contains_key(&definition.name) {
            return Err(Error::Validation(format!(
                "flow '{}' is defined more than once",
                definition.name
            )));
        }
        self.flows
            .insert(definition.name.clone(), (definition, graph));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name).map(|(definition, _)| definition)
    }

    pub fn graph(&self, name: &str) -> Option<&FlowGraph> {
        self.flows.get(name).map(|(_, graph)| graph)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowDefinition, &FlowGraph)> {
        self.flows.values().map(|(d, g)| (d, g))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Parse one flow file.
pub fn parse(content: &str) -> std::result::Result<FlowDefinition, toml::de::Error> {
    toml::from_str::<FlowFile>(content).map(|file| file.flow)
}
