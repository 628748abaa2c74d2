use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }
}

/// Identifiers returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub prompt_id: String,
    pub client_id: String,
}

/// One generation job on the remote server, owned by a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub prompt_id: String,
    pub client_id: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl Job {
    pub fn submitted(receipt: SubmitReceipt) -> Self {
        let now = Utc::now();
        Self {
            prompt_id: receipt.prompt_id,
            client_id: receipt.client_id,
            submitted_at: now,
            updated_at: now,
            status: JobStatus::Queued,
        }
    }

    /// Moves to `next` unless the job already reached a terminal state.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Location of one output file on the job server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDescriptor {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Failed { reason: String },
}

/// A job's history record as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub status: SnapshotStatus,
    pub outputs: Vec<OutputDescriptor>,
}

impl JobSnapshot {
    pub fn is_completed(&self) -> bool {
        self.status == SnapshotStatus::Completed
    }

    pub fn from_history_entry(entry: &Value) -> Self {
        let status_obj = entry.get("status").and_then(Value::as_object);
        let status_str = status_obj
            .and_then(|obj| obj.get("status_str").and_then(Value::as_str))
            .unwrap_or("");
        let completed = status_obj
            .and_then(|obj| obj.get("completed").and_then(Value::as_bool))
            .unwrap_or(false);

        let status = if status_str.eq_ignore_ascii_case("error") {
            let reason = status_obj
                .and_then(|obj| obj.get("messages").and_then(Value::as_array))
                .map(|messages| describe_messages(messages))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "execution error".to_string());
            SnapshotStatus::Failed { reason }
        } else if completed {
            SnapshotStatus::Completed
        } else {
            SnapshotStatus::Pending
        };

        Self {
            status,
            outputs: extract_outputs(entry.get("outputs")),
        }
    }
}

/// Server messages come either as plain strings or as `[event, details]`.
fn describe_messages(messages: &[Value]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            Value::String(text) => Some(text.clone()),
            Value::Array(parts) => {
                let event = parts.first().and_then(Value::as_str)?;
                if !event.contains("error") && !event.contains("interrupted") {
                    return None;
                }
                let detail = parts
                    .get(1)
                    .and_then(|d| d.get("exception_message"))
                    .and_then(Value::as_str)
                    .map(str::trim);
                Some(match detail {
                    Some(detail) if !detail.is_empty() => format!("{}: {}", event, detail),
                    _ => event.to_string(),
                })
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Image entries from a history `outputs` map, in node order.
pub fn extract_outputs(outputs_value: Option<&Value>) -> Vec<OutputDescriptor> {
    let mut outputs = Vec::new();
    let Some(outputs_map) = outputs_value.and_then(Value::as_object) else {
        return outputs;
    };
    for (node_id, node_value) in outputs_map {
        let node = node_value.get("ui").unwrap_or(node_value);
        let Some(images) = node.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in images {
            let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                continue;
            };
            outputs.push(OutputDescriptor {
                node_id: node_id.clone(),
                filename: filename.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                kind: image
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("output")
                    .to_string(),
            });
        }
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_entry_with_images() {
        let entry = json!({
            "status": { "status_str": "success", "completed": true, "messages": [] },
            "outputs": {
                "9": { "images": [
                    { "filename": "x.png", "subfolder": "", "type": "output" },
                    { "filename": "y.png" }
                ] },
                "12": { "text": ["ignored"] }
            }
        });
        let snapshot = JobSnapshot::from_history_entry(&entry);
        assert!(snapshot.is_completed());
        assert_eq!(snapshot.outputs.len(), 2);
        assert_eq!(snapshot.outputs[0].node_id, "9");
        assert_eq!(snapshot.outputs[1].kind, "output");
        assert_eq!(snapshot.outputs[1].subfolder, "");
    }

    #[test]
    fn incomplete_entry_is_pending() {
        let entry = json!({ "status": { "status_str": "running", "completed": false } });
        let snapshot = JobSnapshot::from_history_entry(&entry);
        assert_eq!(snapshot.status, SnapshotStatus::Pending);
        assert!(snapshot.outputs.is_empty());
    }

    #[test]
    fn error_entry_carries_reason() {
        let entry = json!({
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [
                    ["execution_start", { "prompt_id": "abc" }],
                    ["execution_error", { "exception_message": "ckpt not found\n" }]
                ]
            }
        });
        let snapshot = JobSnapshot::from_history_entry(&entry);
        assert_eq!(
            snapshot.status,
            SnapshotStatus::Failed {
                reason: "execution_error: ckpt not found".into()
            }
        );
    }

    #[test]
    fn ui_wrapped_outputs_are_read() {
        let outputs = json!({ "3": { "ui": { "images": [{ "filename": "a.webp", "subfolder": "s", "type": "temp" }] } } });
        let found = extract_outputs(Some(&outputs));
        assert_eq!(found[0].filename, "a.webp");
        assert_eq!(found[0].subfolder, "s");
        assert_eq!(found[0].kind, "temp");
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut job = Job::submitted(SubmitReceipt {
            prompt_id: "abc".into(),
            client_id: "c".into(),
        });
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.transition(JobStatus::Running));
        assert!(!job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
        assert!(!job.transition(JobStatus::Failed));
        assert_eq!(job.status, JobStatus::Completed);
    }
}
