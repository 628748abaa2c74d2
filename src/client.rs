use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;

use crate::diagnostics::Diagnostics;
use crate::error::{PipelineError, Result};
use crate::job::{JobSnapshot, OutputDescriptor, SubmitReceipt};

const USER_AGENT: &str = "VCPChat-ComfyUI-Client/1.0";
const PROMPT_ENDPOINT: &str = "/prompt";
const HISTORY_ENDPOINT: &str = "/history";
const VIEW_ENDPOINT: &str = "/view";
const QUEUE_ENDPOINT: &str = "/queue";
const OBJECT_INFO_ENDPOINT: &str = "/object_info";

/// Remote job server operations the pipeline depends on.
#[async_trait]
pub trait JobServer: Send + Sync {
    async fn submit(&self, workflow: &Value) -> Result<SubmitReceipt>;

    /// `Ok(None)` while the server has no history record for the job yet.
    async fn poll_status(&self, prompt_id: &str) -> Result<Option<JobSnapshot>>;

    async fn fetch_artifact_bytes(&self, output: &OutputDescriptor) -> Result<Vec<u8>>;
}

/// Upper bound for each kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub submit: Duration,
    pub poll: Duration,
    pub download: Duration,
    pub catalogue: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            submit: Duration::from_secs(30),
            poll: Duration::from_secs(10),
            download: Duration::from_secs(60),
            catalogue: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModelCatalog {
    pub models: Vec<String>,
    pub loras: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<usize>,
}

/// HTTP client for a ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyClient {
    base_url: String,
    http: Client,
    timeouts: Timeouts,
    diagnostics: Diagnostics,
}

fn comfy_http_client(api_key: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|_| {
            PipelineError::Configuration("API key contains characters not allowed in a header".into())
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .build()
        .map_err(|err| PipelineError::Configuration(format!("Failed to build HTTP client: {}", err)))
}

/// Names listed by `/object_info` for one loader input, e.g.
/// `CheckpointLoaderSimple.input.required.ckpt_name[0]`.
fn object_info_choices(info: &Value, node: &str, input: &str) -> Vec<String> {
    info.get(node)
        .and_then(|n| n.get("input"))
        .and_then(|i| i.get("required"))
        .and_then(|r| r.get(input))
        .and_then(|choices| choices.get(0))
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl ComfyClient {
    pub fn new(base_url: &str, api_key: Option<&str>, diagnostics: Diagnostics) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: comfy_http_client(api_key)?,
            timeouts: Timeouts::default(),
            diagnostics,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str, timeout: Duration) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, endpoint);
        self.http.request(method, url).timeout(timeout)
    }

    async fn get_json(&self, endpoint: &str, timeout: Duration) -> std::result::Result<Value, String> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .request(Method::GET, endpoint, timeout)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|err| format!("GET {} failed: {}", url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("GET {} returned status {}", url, status));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| format!("Failed to parse response from {}: {}", url, err))
    }

    pub async fn object_info(&self) -> Result<Value> {
        self.get_json(OBJECT_INFO_ENDPOINT, self.timeouts.catalogue)
            .await
            .map_err(PipelineError::Transport)
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let value = self
            .get_json(QUEUE_ENDPOINT, self.timeouts.catalogue)
            .await
            .map_err(PipelineError::Transport)?;
        serde_json::from_value(value)
            .map_err(|err| PipelineError::Transport(format!("Failed to parse queue snapshot: {}", err)))
    }

    /// Probes `/object_info`, then reports queue depth when available.
    pub async fn check_connection(&self) -> ConnectionReport {
        match self.object_info().await {
            Ok(_) => {
                let queue = self.queue_snapshot().await.ok();
                ConnectionReport {
                    success: true,
                    message: Some("Connection successful".into()),
                    error: None,
                    server_url: self.base_url.clone(),
                    pending: queue.as_ref().map(|q| q.queue_pending.len()),
                    running: queue.as_ref().map(|q| q.queue_running.len()),
                }
            }
            Err(err) => ConnectionReport {
                success: false,
                message: None,
                error: Some(format!("Connection failed: {}", err)),
                server_url: self.base_url.clone(),
                pending: None,
                running: None,
            },
        }
    }

    pub async fn list_models(&self) -> Result<ModelCatalog> {
        let info = self.object_info().await?;
        let catalog = ModelCatalog {
            models: object_info_choices(&info, "CheckpointLoaderSimple", "ckpt_name"),
            loras: object_info_choices(&info, "LoraLoader", "lora_name"),
        };
        debug!(
            "Found {} models and {} LoRAs",
            catalog.models.len(),
            catalog.loras.len()
        );
        Ok(catalog)
    }

    fn view_url(&self, output: &OutputDescriptor) -> std::result::Result<Url, String> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, VIEW_ENDPOINT))
            .map_err(|err| format!("invalid server URL {}: {}", self.base_url, err))?;
        url.query_pairs_mut()
            .append_pair("filename", &output.filename)
            .append_pair("subfolder", &output.subfolder)
            .append_pair("type", &output.kind);
        Ok(url)
    }
}

#[async_trait]
impl JobServer for ComfyClient {
    async fn submit(&self, workflow: &Value) -> Result<SubmitReceipt> {
        let client_id = Uuid::new_v4().to_string();
        let url = format!("{}{}", self.base_url, PROMPT_ENDPOINT);
        let body = json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        self.diagnostics.dump_json("Submitting prompt", &body);

        let response = self
            .request(Method::POST, PROMPT_ENDPOINT, self.timeouts.submit)
            .json(&body)
            .send()
            .await
            .map_err(|err| PipelineError::Submission(format!("POST {} failed: {}", url, err)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Submission(format!(
                "POST {} returned status {}: {}",
                url, status, text
            )));
        }
        let value: Value = response.json().await.map_err(|err| {
            PipelineError::Submission(format!("Failed to parse response from {}: {}", url, err))
        })?;
        let prompt_id = value
            .get("prompt_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                PipelineError::Submission("ComfyUI submission did not return a prompt_id.".into())
            })?;

        debug!("Queued with prompt_id {}", prompt_id);
        Ok(SubmitReceipt {
            prompt_id: prompt_id.to_string(),
            client_id,
        })
    }

    async fn poll_status(&self, prompt_id: &str) -> Result<Option<JobSnapshot>> {
        let endpoint = format!("{}/{}", HISTORY_ENDPOINT, prompt_id);
        let value = self
            .get_json(&endpoint, self.timeouts.poll)
            .await
            .map_err(PipelineError::Transport)?;
        Ok(value
            .get(prompt_id)
            .filter(|entry| !entry.is_null())
            .map(JobSnapshot::from_history_entry))
    }

    async fn fetch_artifact_bytes(&self, output: &OutputDescriptor) -> Result<Vec<u8>> {
        let failure = |reason: String| PipelineError::Download {
            filename: output.filename.clone(),
            reason,
        };
        let url = self.view_url(output).map_err(failure)?;
        debug!("Downloading image from {}", url);

        let response = self
            .http
            .get(url.clone())
            .timeout(self.timeouts.download)
            .send()
            .await
            .map_err(|err| failure(format!("GET {} failed: {}", url, err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("GET {} returned status {}", url, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| failure(format!("Failed to read body of {}: {}", url, err)))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_info_choices_are_read() {
        let info = json!({
            "CheckpointLoaderSimple": { "input": { "required": { "ckpt_name": [["a.ckpt", "b.safetensors"]] } } },
            "LoraLoader": { "input": { "required": { "lora_name": [[]] } } }
        });
        assert_eq!(
            object_info_choices(&info, "CheckpointLoaderSimple", "ckpt_name"),
            vec!["a.ckpt", "b.safetensors"]
        );
        assert!(object_info_choices(&info, "LoraLoader", "lora_name").is_empty());
        assert!(object_info_choices(&info, "Missing", "x").is_empty());
    }

    #[test]
    fn view_url_encodes_query() {
        let client = ComfyClient::new("http://127.0.0.1:8188/", None, Diagnostics::quiet()).unwrap();
        let url = client
            .view_url(&OutputDescriptor {
                node_id: "9".into(),
                filename: "my image.png".into(),
                subfolder: "a/b".into(),
                kind: "output".into(),
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8188/view?filename=my+image.png&subfolder=a%2Fb&type=output"
        );
    }

    #[test]
    fn default_timeouts_are_bounded() {
        let t = Timeouts::default();
        assert!(t.poll < t.submit);
        assert!(t.submit < t.download);
    }

    #[test]
    fn invalid_api_key_is_a_configuration_error() {
        let err = ComfyClient::new("http://x", Some("bad\nkey"), Diagnostics::quiet()).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
