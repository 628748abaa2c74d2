//! # comfyui_gen
//!
//! Image generation through a ComfyUI server. A request names a prompt and
//! optional overrides; the plugin fills a workflow template, queues it, waits
//! for the job and stores the resulting images where a local image server
//! publishes them.
//!
//! ```text
//! request ─► ConfigResolver ─► WorkflowStore ─► placeholder::substitute
//!                                                        │
//!        ResultSummary ◄─ ArtifactPersister ◄─ CompletionPoller ◄─ JobServer::submit
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | [`placeholder`] | `%key%` token scan, substitution and value validation |
//! | [`catalogue`] | Known placeholders, defaults, bounds and foreign parameter conversion |
//! | [`config`] | Tiered configuration: defaults, `config.env`, settings file, environment, request |
//! | [`workflow`] | Named templates on disk with a built-in fallback |
//! | [`client`] | HTTP client for the ComfyUI API behind the [`client::JobServer`] trait |
//! | [`job`] | Job lifecycle and history snapshot parsing |
//! | [`poller`] | Fixed-budget completion polling with an injectable sleeper |
//! | [`artifact`] | Writes images under fresh names and computes public URLs |
//! | [`pipeline`] | The orchestrator tying all of the above together |
//!
//! Errors are [`error::PipelineError`]; diagnostics go through the `log`
//! facade and never to stdout, which carries the response.

pub mod artifact;
pub mod catalogue;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod placeholder;
pub mod poller;
pub mod util;
pub mod workflow;

pub use error::{PipelineError, Result};
pub use pipeline::{GenerationRequest, Pipeline, ResultSummary};
