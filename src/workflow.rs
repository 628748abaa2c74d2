use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::diagnostics::Diagnostics;
use crate::util::list_with_extension;

pub const DEFAULT_WORKFLOW_NAME: &str = "text2img_basic";
const WORKFLOW_EXTENSION: &str = "json";

/// A ComfyUI API-format graph: node id -> `{inputs, class_type, _meta}`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTemplate(Value);

/// `[nodeId, outputIndex]` link found in a node's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReference {
    pub from_node: String,
    pub input: String,
    pub target: String,
    pub output_index: u64,
}

impl WorkflowTemplate {
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Object(_) => Ok(Self(value)),
            other => Err(format!(
                "workflow must be a JSON object, found {}",
                kind_name(&other)
            )),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    fn nodes(&self) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
        self.0
            .as_object()
            .into_iter()
            .flat_map(|map| map.iter())
            .filter_map(|(id, node)| node.as_object().map(|node| (id, node)))
            .filter(|(_, node)| node.contains_key("class_type"))
    }

    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        self.0.get(node_id)?.get("class_type")?.as_str()
    }

    pub fn references(&self) -> Vec<NodeReference> {
        let mut refs = Vec::new();
        for (id, node) in self.nodes() {
            let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
                continue;
            };
            for (input, value) in inputs {
                if let Some((target, output_index)) = as_reference(value) {
                    refs.push(NodeReference {
                        from_node: id.clone(),
                        input: input.clone(),
                        target: target.to_string(),
                        output_index,
                    });
                }
            }
        }
        refs
    }

    /// References whose target node is missing from the graph.
    pub fn dangling_references(&self) -> Vec<NodeReference> {
        let root = self.0.as_object();
        self.references()
            .into_iter()
            .filter(|r| !root.map(|m| m.contains_key(&r.target)).unwrap_or(false))
            .collect()
    }

    /// Title and description from a top-level `_meta` block, if present.
    pub fn meta(&self) -> (Option<String>, Option<String>) {
        let meta = self.0.get("_meta");
        let field = |name: &str| {
            meta.and_then(|m| m.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        (field("title"), field("description"))
    }
}

fn as_reference(value: &Value) -> Option<(&str, u64)> {
    match value.as_array()?.as_slice() {
        [Value::String(target), Value::Number(index)] => Some((target.as_str(), index.as_u64()?)),
        _ => None,
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Checkpoint loader -> LoRA -> prompt encoders -> sampler -> decode -> save.
pub fn default_workflow() -> WorkflowTemplate {
    WorkflowTemplate(json!({
        "3": {
            "inputs": {
                "seed": "%seed%",
                "steps": "%steps%",
                "cfg": "%cfg_scale%",
                "sampler_name": "%sampler_name%",
                "scheduler": "%scheduler%",
                "denoise": "%denoise%",
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": ["5", 0]
            },
            "class_type": "KSampler",
            "_meta": { "title": "KSampler" }
        },
        "4": {
            "inputs": { "ckpt_name": "%MODEL_NAME%" },
            "class_type": "CheckpointLoaderSimple",
            "_meta": { "title": "Load Checkpoint" }
        },
        "5": {
            "inputs": {
                "width": "%width%",
                "height": "%height%",
                "batch_size": "%batch_size%"
            },
            "class_type": "EmptyLatentImage",
            "_meta": { "title": "Empty Latent Image" }
        },
        "6": {
            "inputs": { "text": "%prompt%", "clip": ["10", 1] },
            "class_type": "CLIPTextEncode",
            "_meta": { "title": "CLIP Text Encode (Prompt)" }
        },
        "7": {
            "inputs": { "text": "%negative_prompt%", "clip": ["10", 1] },
            "class_type": "CLIPTextEncode",
            "_meta": { "title": "CLIP Text Encode (Negative)" }
        },
        "8": {
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] },
            "class_type": "VAEDecode",
            "_meta": { "title": "VAE Decode" }
        },
        "9": {
            "inputs": { "filename_prefix": "ComfyUI", "images": ["8", 0] },
            "class_type": "SaveImage",
            "_meta": { "title": "Save Image" }
        },
        "10": {
            "inputs": {
                "lora_name": "%lora_name%",
                "strength_model": 1.0,
                "strength_clip": 1.0,
                "model": ["4", 0],
                "clip": ["4", 1]
            },
            "class_type": "LoraLoader",
            "_meta": { "title": "Load LoRA" }
        }
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    pub path: PathBuf,
}

/// Named workflow templates stored as `<dir>/<name>.json`.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    dir: PathBuf,
    diagnostics: Diagnostics,
}

impl WorkflowStore {
    pub fn new(dir: impl Into<PathBuf>, diagnostics: Diagnostics) -> Self {
        Self {
            dir: dir.into(),
            diagnostics,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn workflow_path(&self, name: &str) -> Result<PathBuf, String> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains(['/', '\\'])
            || trimmed.contains("..")
        {
            return Err(format!("invalid workflow name '{}'", name));
        }
        Ok(self.dir.join(format!("{}.{}", trimmed, WORKFLOW_EXTENSION)))
    }

    async fn read(&self, name: &str) -> Result<WorkflowTemplate, String> {
        let path = self.workflow_path(name)?;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| format!("failed to parse {}: {}", path.display(), e))?;
        let template = WorkflowTemplate::from_value(value)?;
        if template.node_count() == 0 {
            return Err(format!("{} contains no nodes", path.display()));
        }
        let dangling = template.dangling_references();
        if let Some(first) = dangling.first() {
            return Err(format!(
                "{}: node {} input '{}' references missing node {}",
                path.display(),
                first.from_node,
                first.input,
                first.target
            ));
        }
        Ok(template)
    }

    /// Loads `name`, falling back to [`default_workflow`] on any failure.
    pub async fn load(&self, name: &str) -> WorkflowTemplate {
        match self.read(name).await {
            Ok(template) => {
                debug!("Loaded workflow template '{}'", name);
                self.diagnostics.dump_json("Workflow template", template.as_value());
                template
            }
            Err(err) => {
                warn!(
                    "Failed to load workflow template '{}' ({}); using built-in default",
                    name, err
                );
                default_workflow()
            }
        }
    }

    pub async fn list(&self) -> std::io::Result<Vec<WorkflowEntry>> {
        if tokio::fs::metadata(&self.dir).await.is_err() {
            warn!("Workflows directory not found: {}", self.dir.display());
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for (id, path) in list_with_extension(&self.dir, WORKFLOW_EXTENSION).await? {
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .and_then(|value| WorkflowTemplate::from_value(value).ok());
            let entry = match parsed {
                Some(template) => {
                    let (title, description) = template.meta();
                    WorkflowEntry {
                        name: title.unwrap_or_else(|| id.clone()),
                        description: description.unwrap_or_default(),
                        id,
                        path,
                    }
                }
                None => {
                    warn!("Failed to read workflow {}", path.display());
                    WorkflowEntry {
                        name: id.clone(),
                        description: "Failed to load metadata".into(),
                        id,
                        path,
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placeholder::extract;

    fn store(dir: &Path) -> WorkflowStore {
        WorkflowStore::new(dir, Diagnostics::quiet())
    }

    #[test]
    fn default_workflow_is_consistent() {
        let template = default_workflow();
        assert_eq!(template.node_count(), 8);
        assert!(template.dangling_references().is_empty());
        assert_eq!(template.class_type("10"), Some("LoraLoader"));
        let keys = extract(template.as_value()).keys;
        assert!(keys.contains(&"prompt".to_string()));
        assert!(keys.contains(&"lora_name".to_string()));
    }

    #[test]
    fn dangling_references_are_reported() {
        let template = WorkflowTemplate::from_value(json!({
            "1": { "inputs": { "model": ["2", 0], "text": "x" }, "class_type": "A" }
        }))
        .unwrap();
        let dangling = template.dangling_references();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].target, "2");
        assert_eq!(dangling[0].input, "model");
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(WorkflowTemplate::from_value(json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn loads_named_template() {
        let dir = tempfile::tempdir().unwrap();
        let body = json!({
            "1": { "inputs": { "text": "%prompt%" }, "class_type": "CLIPTextEncode" }
        });
        std::fs::write(dir.path().join("mine.json"), body.to_string()).unwrap();
        let template = store(dir.path()).load("mine").await;
        assert_eq!(template.as_value(), &body);
    }

    #[tokio::test]
    async fn falls_back_on_missing_broken_or_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(
            dir.path().join("dangling.json"),
            json!({ "1": { "inputs": { "m": ["9", 0] }, "class_type": "A" } }).to_string(),
        )
        .unwrap();
        let store = store(dir.path());
        for name in ["absent", "broken", "dangling", "../broken", ""] {
            assert_eq!(store.load(name).await, default_workflow(), "{}", name);
        }
    }

    #[tokio::test]
    async fn lists_workflows_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("portrait.json"),
            json!({ "_meta": { "title": "Portrait", "description": "Head shots" } }).to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join("bad.json"), "nope").unwrap();
        let entries = store(dir.path()).list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "bad");
        assert_eq!(entries[0].description, "Failed to load metadata");
        assert_eq!(entries[1].name, "Portrait");
        assert_eq!(entries[1].description, "Head shots");
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let entries = store(&dir.path().join("nope")).list().await.unwrap();
        assert!(entries.is_empty());
    }
}
