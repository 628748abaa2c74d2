use thiserror::Error;

/// Prefix carried by every error message that leaves the plugin.
pub const ERROR_PREFIX: &str = "ComfyUI Plugin Error:";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid arguments: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to submit workflow: {0}")]
    Submission(String),

    #[error("Failed to query job status: {0}")]
    Transport(String),

    #[error("Failed to download {filename}: {reason}")]
    Download { filename: String, reason: String },

    #[error("Failed to save {filename}: {reason}")]
    Persist { filename: String, reason: String },

    #[error("Generation timeout after {attempts} status checks - please check ComfyUI status")]
    TimedOut { attempts: u32 },

    #[error("ComfyUI reported a failed job {prompt_id}: {reason}")]
    JobFailed { prompt_id: String, reason: String },

    #[error("No images were generated")]
    NoArtifactsProduced,

    #[error("Polling cancelled for job {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Single-line, prefixed message suitable for the response channel.
    pub fn user_message(&self) -> String {
        prefixed(&self.to_string())
    }
}

/// Collapses `message` onto one line and prepends [`ERROR_PREFIX`] unless
/// it is already there.
pub fn prefixed(message: &str) -> String {
    let line = message
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if line.starts_with(ERROR_PREFIX) {
        line
    } else {
        format!("{} {}", ERROR_PREFIX, line)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_prefixed_and_single_line() {
        let err = PipelineError::Submission("POST /prompt returned 500:\nboom\n".into());
        assert_eq!(
            err.user_message(),
            "ComfyUI Plugin Error: Failed to submit workflow: POST /prompt returned 500: boom"
        );
    }

    #[test]
    fn prefix_is_not_doubled() {
        let msg = prefixed("ComfyUI Plugin Error: already there");
        assert_eq!(msg, "ComfyUI Plugin Error: already there");
    }

    #[test]
    fn timeout_names_attempts() {
        let err = PipelineError::TimedOut { attempts: 3 };
        assert!(err.user_message().contains("after 3 status checks"));
    }
}
