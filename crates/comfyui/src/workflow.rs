//! Parameterizable workflow templates.
//!
//! A template file is a ComfyUI API-format graph plus a table of named
//! slots, each a dotted path into the graph:
//!
//! ```json
//! {
//!   "slots": { "prompt": "6.inputs.text", "seed": "3.inputs.seed" },
//!   "graph": { "3": { "class_type": "KSampler", "inputs": { "seed": 0 } } }
//! }
//! ```
//!
//! Rendering copies the graph and writes each supplied value at its slot's
//! path. Every path segment must already exist in the graph.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

/// Slot every template must declare.
pub const PROMPT_SLOT: &str = "prompt";

const BUILTIN_TXT2IMG: &str = include_str!("../workflows/txt2img.json");

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("Invalid workflow template '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Workflow '{workflow}' slot '{slot}' points at missing path '{path}'")]
    MissingSlot {
        workflow: String,
        slot: String,
        path: String,
    },

    #[error("Workflow '{workflow}' requires a value for slot '{slot}'")]
    MissingValue { workflow: String, slot: String },

    #[error("Failed to read workflow templates: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Deserialize)]
struct TemplateFile {
    slots: BTreeMap<String, String>,
    graph: Value,
}

/// One named, parameterizable workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTemplate {
    name: String,
    slots: BTreeMap<String, String>,
    graph: Value,
}

impl WorkflowTemplate {
    /// Parse a template document and check every slot path resolves.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, TemplateError> {
        let name = name.into();
        let file: TemplateFile = serde_json::from_str(json).map_err(|e| TemplateError::Invalid {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        if !file.graph.is_object() {
            return Err(TemplateError::Invalid {
                name,
                reason: "graph must be a JSON object".into(),
            });
        }
        if !file.slots.contains_key(PROMPT_SLOT) {
            return Err(TemplateError::Invalid {
                name,
                reason: format!("missing required slot '{PROMPT_SLOT}'"),
            });
        }

        let template = Self {
            name,
            slots: file.slots,
            graph: file.graph,
        };
        for (slot, path) in &template.slots {
            if lookup(&template.graph, path).is_none() {
                return Err(template.missing_slot(slot, path));
            }
        }
        Ok(template)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    pub fn slot_names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Fill the graph with `values`, keyed by slot name.
    ///
    /// Values for slots this template does not declare are ignored.
    pub fn render(&self, values: &BTreeMap<String, Value>) -> Result<Value, TemplateError> {
        if !values.contains_key(PROMPT_SLOT) {
            return Err(TemplateError::MissingValue {
                workflow: self.name.clone(),
                slot: PROMPT_SLOT.into(),
            });
        }

        let mut graph = self.graph.clone();
        for (slot, value) in values {
            let Some(path) = self.slots.get(slot) else {
                tracing::debug!(workflow = %self.name, slot = %slot, "Template has no such slot, skipping");
                continue;
            };
            let target = lookup_mut(&mut graph, path).ok_or_else(|| self.missing_slot(slot, path))?;
            *target = value.clone();
        }
        Ok(graph)
    }

    fn missing_slot(&self, slot: &str, path: &str) -> TemplateError {
        TemplateError::MissingSlot {
            workflow: self.name.clone(),
            slot: slot.to_string(),
            path: path.to_string(),
        }
    }
}

fn lookup<'a>(graph: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(graph, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(graph: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(graph, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Named templates available to image jobs.
#[derive(Debug, Clone, Default)]
pub struct WorkflowLibrary {
    templates: HashMap<String, Arc<WorkflowTemplate>>,
}

impl WorkflowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A library containing the built-in `txt2img` template.
    pub fn with_builtin() -> Result<Self, TemplateError> {
        let mut library = Self::new();
        library.insert(WorkflowTemplate::from_json("txt2img", BUILTIN_TXT2IMG)?);
        Ok(library)
    }

    /// Add or replace a template under its own name.
    pub fn insert(&mut self, template: WorkflowTemplate) {
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
    }

    /// Load every `*.json` file in `dir`, named after the file stem.
    ///
    /// Returns the number of templates loaded. A malformed file aborts
    /// the load so startup fails loudly.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, TemplateError> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let json = std::fs::read_to_string(&path)?;
            self.insert(WorkflowTemplate::from_json(name, &json)?);
            tracing::info!(workflow = name, path = %path.display(), "Loaded workflow template");
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Result<Arc<WorkflowTemplate>, TemplateError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownWorkflow(name.to_string()))
    }

    /// Template names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}
