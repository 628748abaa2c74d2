use std::str::FromStr;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::PipelineError;

pub const DEFAULT_NEGATIVE_PROMPT: &str = "lowres, bad anatomy, bad hands, text, error, missing fingers, extra digit, fewer digits, cropped, worst quality, low quality, normal quality, jpeg artifacts, signature, watermark, username, blurry";
pub const DEFAULT_SEED: u64 = 156680208700286;
pub const DEFAULT_MODEL_NAME: &str = "v1-5-pruned-emaonly.ckpt";

/// Placeholders the calling agent fills in per request.
pub const AGENT_GENERATED_KEYS: &[&str] = &["prompt", "negative_prompt"];

/// Placeholders the user tunes in settings; each has a built-in default.
pub const USER_CONFIGURABLE_KEYS: &[&str] = &[
    "seed",
    "steps",
    "cfg_scale",
    "sampler_name",
    "scheduler",
    "width",
    "height",
    "MODEL_NAME",
    "denoise",
    "batch_size",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaceholderCategory {
    AgentGenerated,
    UserConfigurable,
    Unknown,
}

impl PlaceholderCategory {
    pub fn of(key: &str) -> Self {
        if AGENT_GENERATED_KEYS.contains(&key) {
            Self::AgentGenerated
        } else if USER_CONFIGURABLE_KEYS.contains(&key) {
            Self::UserConfigurable
        } else {
            Self::Unknown
        }
    }
}

pub fn default_value(key: &str) -> Option<Value> {
    let value = match key {
        "prompt" => json!(""),
        "negative_prompt" => json!(DEFAULT_NEGATIVE_PROMPT),
        "seed" => json!(DEFAULT_SEED),
        "steps" => json!(20),
        "cfg_scale" => json!(7),
        "sampler_name" => json!("euler"),
        "scheduler" => json!("normal"),
        "width" => json!(1024),
        "height" => json!(1024),
        "MODEL_NAME" => json!(DEFAULT_MODEL_NAME),
        "denoise" => json!(1),
        "batch_size" => json!(1),
        _ => return None,
    };
    Some(value)
}

fn defaults_for(keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| default_value(key).map(|value| (key.to_string(), value)))
        .collect()
}

pub fn user_configurable_defaults() -> Map<String, Value> {
    defaults_for(USER_CONFIGURABLE_KEYS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    Select,
    Textarea,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

fn field_type(key: &str) -> FieldType {
    match key {
        "seed" | "steps" | "cfg_scale" | "width" | "height" | "denoise" | "batch_size" => {
            FieldType::Number
        }
        "sampler_name" | "scheduler" | "MODEL_NAME" => FieldType::Select,
        "prompt" | "negative_prompt" => FieldType::Textarea,
        _ => FieldType::Text,
    }
}

fn field_description(key: &str) -> &'static str {
    match key {
        "prompt" => "Positive prompt describing the image to generate",
        "negative_prompt" => "Negative prompt listing elements to avoid",
        "seed" => "Random seed controlling the variation of the result",
        "steps" => "Sampling steps; more steps trade time for quality",
        "cfg_scale" => "CFG guidance strength; how closely the model follows the prompt",
        "sampler_name" => "Sampler algorithm",
        "scheduler" => "Scheduler controlling the denoising curve",
        "width" => "Image width in pixels",
        "height" => "Image height in pixels",
        "MODEL_NAME" => "Checkpoint file name",
        "denoise" => "Denoising strength (0-1)",
        "batch_size" => "Number of images generated per job",
        _ => "",
    }
}

fn field_bounds(key: &str) -> Option<Bounds> {
    let (min, max, step) = match key {
        // Largest integer a JSON number carries exactly.
        "seed" => (0.0, 9_007_199_254_740_991.0, None),
        "steps" => (1.0, 150.0, None),
        "cfg_scale" => (0.1, 30.0, Some(0.1)),
        "width" | "height" => (64.0, 4096.0, Some(64.0)),
        "denoise" => (0.0, 1.0, Some(0.01)),
        "batch_size" => (1.0, 10.0, None),
        _ => return None,
    };
    Some(Bounds { min, max, step })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub readonly: bool,
    pub default_value: Value,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Bounds>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldGroup {
    pub title: String,
    pub description: String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplate {
    pub agent_generated: FieldGroup,
    pub user_configurable: FieldGroup,
}

fn describe(key: &str, readonly: bool) -> FieldDescriptor {
    FieldDescriptor {
        key: key.to_string(),
        field_type: if readonly { FieldType::Text } else { field_type(key) },
        readonly,
        default_value: default_value(key).unwrap_or(Value::Null),
        description: field_description(key).to_string(),
        validation: if readonly { None } else { field_bounds(key) },
    }
}

/// Field catalogue consumed by settings front ends.
pub fn config_template() -> ConfigTemplate {
    ConfigTemplate {
        agent_generated: FieldGroup {
            title: "Agent-generated parameters".into(),
            description: "Filled in by the agent for each request; not configured by hand".into(),
            fields: AGENT_GENERATED_KEYS
                .iter()
                .map(|key| describe(key, true))
                .collect(),
        },
        user_configurable: FieldGroup {
            title: "User-configurable parameters".into(),
            description: "Persisted in comfyui-settings.json and editable from the settings panel"
                .into(),
            fields: USER_CONFIGURABLE_KEYS
                .iter()
                .map(|key| describe(key, false))
                .collect(),
        },
    }
}

/// Parameter dialects accepted by [`convert_from_api`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    Automatic1111,
    NovelAi,
    Custom,
}

impl FromStr for ApiFlavor {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automatic1111" => Ok(Self::Automatic1111),
            "novelai" => Ok(Self::NovelAi),
            "custom" => Ok(Self::Custom),
            other => Err(PipelineError::InvalidArgument(format!(
                "Unsupported API type: {}",
                other
            ))),
        }
    }
}

pub fn map_sampler(name: Option<&str>) -> &'static str {
    match name {
        Some("Euler") => "euler",
        Some("Euler a") => "euler_ancestral",
        Some("DPM++ 2M") => "dpmpp_2m",
        Some("DPM++ SDE") => "dpmpp_sde",
        Some("DDIM") => "ddim",
        Some("LMS") => "lms",
        _ => "euler",
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn pick(data: &Map<String, Value>, key: &str, fallback: Value) -> Value {
    data.get(key)
        .filter(|value| truthy(value))
        .cloned()
        .unwrap_or(fallback)
}

/// Maps a parameter object written for another generator onto placeholder
/// values. Falsy source values fall back to that dialect's defaults.
pub fn convert_from_api(data: &Map<String, Value>, flavor: ApiFlavor) -> Map<String, Value> {
    let mut out = Map::new();
    match flavor {
        ApiFlavor::Automatic1111 => {
            out.insert("prompt".into(), pick(data, "prompt", json!("")));
            out.insert(
                "negative_prompt".into(),
                pick(data, "negative_prompt", json!("")),
            );
            out.insert("seed".into(), pick(data, "seed", json!(-1)));
            out.insert("steps".into(), pick(data, "steps", json!(20)));
            out.insert("cfg_scale".into(), pick(data, "cfg_scale", json!(7)));
            let sampler = [data.get("sampler_name"), data.get("sampler_index")]
                .into_iter()
                .flatten()
                .find(|value| truthy(value))
                .and_then(Value::as_str);
            out.insert("sampler_name".into(), json!(map_sampler(sampler)));
            out.insert("width".into(), pick(data, "width", json!(512)));
            out.insert("height".into(), pick(data, "height", json!(512)));
        }
        ApiFlavor::NovelAi => {
            out.insert("prompt".into(), pick(data, "input", json!("")));
            out.insert("negative_prompt".into(), pick(data, "uc", json!("")));
            out.insert("seed".into(), pick(data, "seed", json!(-1)));
            out.insert("steps".into(), pick(data, "steps", json!(28)));
            out.insert("cfg_scale".into(), pick(data, "scale", json!(11)));
            out.insert("width".into(), pick(data, "width", json!(512)));
            out.insert("height".into(), pick(data, "height", json!(512)));
        }
        ApiFlavor::Custom => out = data.clone(),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_fixed_tables() {
        assert_eq!(PlaceholderCategory::of("prompt"), PlaceholderCategory::AgentGenerated);
        assert_eq!(PlaceholderCategory::of("MODEL_NAME"), PlaceholderCategory::UserConfigurable);
        assert_eq!(PlaceholderCategory::of("model_name"), PlaceholderCategory::Unknown);
        assert_eq!(PlaceholderCategory::of("lora_name"), PlaceholderCategory::Unknown);
    }

    #[test]
    fn user_defaults_cover_every_configurable_key() {
        let defaults = user_configurable_defaults();
        assert_eq!(defaults.len(), USER_CONFIGURABLE_KEYS.len());
        assert_eq!(defaults["seed"], json!(156680208700286u64));
        assert_eq!(defaults["width"], json!(1024));
    }

    #[test]
    fn config_template_marks_agent_fields_readonly() {
        let template = config_template();
        assert!(template.agent_generated.fields.iter().all(|f| f.readonly));
        let steps = template
            .user_configurable
            .fields
            .iter()
            .find(|f| f.key == "steps")
            .unwrap();
        assert_eq!(steps.field_type, FieldType::Number);
        assert_eq!(steps.validation.unwrap().max, 150.0);

        let rendered = serde_json::to_value(&template).unwrap();
        assert_eq!(rendered["userConfigurable"]["fields"][0]["type"], "number");
        assert_eq!(rendered["agentGenerated"]["fields"][0]["readonly"], true);
    }

    #[test]
    fn automatic1111_conversion() {
        let data = json!({
            "prompt": "a fox",
            "seed": 0,
            "sampler_index": "Euler a",
            "width": 768
        });
        let out = convert_from_api(data.as_object().unwrap(), ApiFlavor::Automatic1111);
        assert_eq!(out["prompt"], "a fox");
        assert_eq!(out["seed"], -1);
        assert_eq!(out["steps"], 20);
        assert_eq!(out["sampler_name"], "euler_ancestral");
        assert_eq!(out["width"], 768);
        assert_eq!(out["height"], 512);
    }

    #[test]
    fn novelai_conversion() {
        let data = json!({ "input": "castle", "uc": "blurry", "scale": 5 });
        let out = convert_from_api(data.as_object().unwrap(), ApiFlavor::NovelAi);
        assert_eq!(out["prompt"], "castle");
        assert_eq!(out["negative_prompt"], "blurry");
        assert_eq!(out["cfg_scale"], 5);
        assert_eq!(out["steps"], 28);
    }

    #[test]
    fn custom_passthrough_and_unknown_flavor() {
        let data = json!({ "anything": [1, 2] });
        let out = convert_from_api(data.as_object().unwrap(), ApiFlavor::Custom);
        assert_eq!(Value::Object(out), data);
        assert!("midjourney".parse::<ApiFlavor>().is_err());
        assert_eq!("NovelAI".parse::<ApiFlavor>().unwrap(), ApiFlavor::NovelAi);
    }

    #[test]
    fn unknown_samplers_fall_back_to_euler() {
        assert_eq!(map_sampler(Some("DDIM")), "ddim");
        assert_eq!(map_sampler(Some("Heun")), "euler");
        assert_eq!(map_sampler(None), "euler");
    }
}
