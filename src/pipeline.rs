//! End-to-end generation: validate, resolve, template, submit, poll,
//! download, persist, summarize.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::artifact::{Artifact, ArtifactPersister, DownloadedArtifact, IMAGE_SUBDIR};
use crate::client::{ComfyClient, JobServer};
use crate::config::{ConfigResolver, ResolvedConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{PipelineError, Result};
use crate::job::Job;
use crate::placeholder;
use crate::poller::{CancelFlag, CompletionPoller, PollOutcome, Sleeper, TokioSleeper};
use crate::workflow::WorkflowStore;

const ALT_TEXT_CHARS: usize = 80;

/// A validated generation request: a non-empty `prompt` plus optional
/// placeholder overrides and a `workflow` name.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    params: Map<String, Value>,
}

impl GenerationRequest {
    pub fn from_value(value: Value) -> Result<Self> {
        let invalid = |value: &Value| {
            PipelineError::InvalidArgument(format!(
                "Required: prompt (string). Received: {}",
                value
            ))
        };
        let prompt_ok = value
            .get("prompt")
            .and_then(Value::as_str)
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false);
        match value {
            Value::Object(params) if prompt_ok => Ok(Self { params }),
            other => Err(invalid(&other)),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(PipelineError::InvalidArgument(
                "No input data received from stdin.".into(),
            ));
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| PipelineError::InvalidArgument(format!("Malformed request JSON: {}", err)))?;
        Self::from_value(value)
    }

    pub fn prompt(&self) -> &str {
        self.params
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub job: Job,
    pub workflow: String,
    pub artifacts: Vec<Artifact>,
    pub unresolved: Vec<String>,
    pub text: String,
}

/// Runs one request at a time; holds no state between calls.
pub struct Pipeline {
    resolver: ConfigResolver,
    diagnostics: Diagnostics,
    sleeper: Arc<dyn Sleeper>,
    cancel: Option<CancelFlag>,
}

impl Pipeline {
    pub fn new(resolver: ConfigResolver, diagnostics: Diagnostics) -> Self {
        Self {
            resolver,
            diagnostics,
            sleeper: Arc::new(TokioSleeper),
            cancel: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Validates `request`, resolves configuration and runs the job against
    /// the configured ComfyUI server.
    pub async fn generate(&self, request: Value) -> Result<ResultSummary> {
        let request = GenerationRequest::from_value(request)?;
        let config = self.resolver.resolve(request.params()).await?;
        let client = ComfyClient::new(
            &config.server.base_url,
            config.server.api_key.as_deref(),
            self.diagnostics,
        )?;
        self.run(&request, &config, &client).await
    }

    /// Same as [`Pipeline::generate`] with configuration already resolved
    /// and an explicit job server.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        config: &ResolvedConfig,
        server: &dyn JobServer,
    ) -> Result<ResultSummary> {
        let store = WorkflowStore::new(&self.resolver.sources().workflows_dir, self.diagnostics);
        let template = store.load(&config.server.workflow).await;

        for (key, reason) in placeholder::invalid_entries(config.params.values()) {
            warn!("Parameter '{}' failed validation: {}", key, reason);
        }

        let workflow = placeholder::substitute(template.as_value(), config.params.values());
        let unresolved = placeholder::unresolved(template.as_value(), config.params.values());
        if !unresolved.is_empty() {
            warn!(
                "Workflow '{}' references placeholders with no value: {}",
                config.server.workflow,
                unresolved.join(", ")
            );
        }

        let receipt = server.submit(&workflow).await?;
        let mut job = Job::submitted(receipt);
        info!("Submitted job {}", job.prompt_id);

        let mut poller =
            CompletionPoller::new(server, self.sleeper.as_ref(), config.server.poll);
        if let Some(cancel) = &self.cancel {
            poller = poller.with_cancel(cancel.clone());
        }
        let snapshot = match poller.wait(&mut job).await? {
            PollOutcome::Completed { snapshot, attempts } => {
                debug!("Job {} completed after {} checks", job.prompt_id, attempts);
                snapshot
            }
            PollOutcome::Failed { reason, .. } => {
                return Err(PipelineError::JobFailed {
                    prompt_id: job.prompt_id.clone(),
                    reason,
                })
            }
            PollOutcome::TimedOut { attempts } => return Err(PipelineError::TimedOut { attempts }),
        };

        if snapshot.outputs.is_empty() {
            return Err(PipelineError::NoArtifactsProduced);
        }

        let mut downloaded = Vec::with_capacity(snapshot.outputs.len());
        let mut last_failure = None;
        for output in snapshot.outputs {
            match server.fetch_artifact_bytes(&output).await {
                Ok(bytes) => downloaded.push(DownloadedArtifact { output, bytes }),
                Err(err) => {
                    warn!("{}", err);
                    last_failure = Some(err);
                }
            }
        }
        if downloaded.is_empty() {
            return Err(last_failure.unwrap_or(PipelineError::NoArtifactsProduced));
        }

        let persister =
            ArtifactPersister::new(config.storage.image_dir(), config.storage.url_template());
        let attempted = downloaded.len();
        let artifacts = persister.persist(downloaded).await;
        if artifacts.is_empty() {
            return Err(PipelineError::Persist {
                filename: format!("{} image(s)", attempted),
                reason: format!("nothing could be written to {}", persister.destination().display()),
            });
        }

        let text = render_summary(request.prompt(), &artifacts, &unresolved);
        self.diagnostics.dump("Result summary", &text);

        Ok(ResultSummary {
            job,
            workflow: config.server.workflow.clone(),
            artifacts,
            unresolved,
            text,
        })
    }
}

/// `prompt` cut to 80 characters, safe inside a double-quoted attribute.
pub fn alt_text(prompt: &str) -> String {
    let mut alt: String = prompt.chars().take(ALT_TEXT_CHARS).collect();
    if prompt.chars().count() > ALT_TEXT_CHARS {
        alt.push_str("...");
    }
    alt.replace('"', "&quot;")
}

/// Human-readable success text with one embeddable `<img>` per artifact.
pub fn render_summary(prompt: &str, artifacts: &[Artifact], unresolved: &[String]) -> String {
    let alt = alt_text(prompt);
    let mut text = format!(
        "ComfyUI image generation succeeded! Generated {} image(s)\n\nDetails:\n",
        artifacts.len()
    );
    for (index, artifact) in artifacts.iter().enumerate() {
        text.push_str(&format!("Image {}:\n", index + 1));
        text.push_str(&format!("- Image URL: {}\n", artifact.public_url));
        text.push_str(&format!(
            "- Server path: image/{}/{}\n",
            IMAGE_SUBDIR, artifact.local_filename
        ));
        text.push_str(&format!("- Filename: {}\n\n", artifact.local_filename));
    }
    if !unresolved.is_empty() {
        text.push_str(&format!(
            "Unresolved placeholders: {}\n\n",
            unresolved.join(", ")
        ));
    }
    text.push_str(
        "Show the images to the user with the HTML <img> tags below (width may be adjusted, 200-500 pixels recommended):\n",
    );
    for (index, artifact) in artifacts.iter().enumerate() {
        text.push_str(&format!(
            "<img src=\"{}\" alt=\"{} {}\" width=\"300\">\n",
            artifact.public_url,
            alt,
            index + 1
        ));
    }
    text
}
