use mockito::{Matcher, Server};
use serde_json::json;

use comfyui_gen::client::{ComfyClient, JobServer};
use comfyui_gen::diagnostics::Diagnostics;
use comfyui_gen::job::{OutputDescriptor, SnapshotStatus};
use comfyui_gen::PipelineError;

fn client(url: &str) -> ComfyClient {
    ComfyClient::new(url, None, Diagnostics::quiet()).unwrap()
}

fn output(filename: &str) -> OutputDescriptor {
    OutputDescriptor {
        node_id: "9".into(),
        filename: filename.into(),
        subfolder: String::new(),
        kind: "output".into(),
    }
}

#[tokio::test]
async fn submit_sends_prompt_and_client_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/prompt")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Regex(r#""client_id":"[0-9a-f-]{36}""#.into()))
        .with_body(r#"{"prompt_id":"abc"}"#)
        .create_async()
        .await;

    let receipt = client(&server.url())
        .submit(&json!({ "3": { "class_type": "KSampler", "inputs": {} } }))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(receipt.prompt_id, "abc");
    assert_eq!(receipt.client_id.len(), 36);
}

#[tokio::test]
async fn submit_without_prompt_id_is_an_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/prompt")
        .with_body(r#"{"node_errors":{}}"#)
        .create_async()
        .await;

    let err = client(&server.url()).submit(&json!({})).await.unwrap_err();
    assert!(matches!(err, PipelineError::Submission(ref msg) if msg.contains("prompt_id")));
}

#[tokio::test]
async fn unauthorized_submission_is_an_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/prompt")
        .with_status(401)
        .with_body("Unauthorized")
        .create_async()
        .await;

    let err = client(&server.url()).submit(&json!({})).await.unwrap_err();
    assert!(matches!(err, PipelineError::Submission(ref msg) if msg.contains("401")));
}

#[tokio::test]
async fn unknown_job_has_no_snapshot() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/history/abc")
        .with_body("{}")
        .create_async()
        .await;
    server
        .mock("GET", "/history/nil")
        .with_body(r#"{"nil": null}"#)
        .create_async()
        .await;

    let client = client(&server.url());
    assert_eq!(client.poll_status("abc").await.unwrap(), None);
    assert_eq!(client.poll_status("nil").await.unwrap(), None);
}

#[tokio::test]
async fn running_job_is_pending() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/history/abc")
        .with_body(json!({ "abc": { "status": { "completed": false }, "outputs": {} } }).to_string())
        .create_async()
        .await;

    let snapshot = client(&server.url()).poll_status("abc").await.unwrap().unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Pending);
}

#[tokio::test]
async fn history_server_error_is_a_transport_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/history/abc")
        .with_status(500)
        .create_async()
        .await;

    let err = client(&server.url()).poll_status("abc").await.unwrap_err();
    assert!(matches!(err, PipelineError::Transport(_)));
}

#[tokio::test]
async fn download_returns_body_bytes() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/view")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("filename".into(), "x.png".into()),
            Matcher::UrlEncoded("subfolder".into(), "".into()),
            Matcher::UrlEncoded("type".into(), "output".into()),
        ]))
        .with_body(vec![1u8, 2, 3])
        .create_async()
        .await;

    let bytes = client(&server.url())
        .fetch_artifact_bytes(&output("x.png"))
        .await
        .unwrap();
    assert_eq!(bytes, vec![1, 2, 3]);
}

#[tokio::test]
async fn missing_artifact_is_a_download_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/view")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let err = client(&server.url())
        .fetch_artifact_bytes(&output("gone.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Download { ref filename, .. } if filename == "gone.png"));
}

#[tokio::test]
async fn models_come_from_object_info() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/object_info")
        .with_body(
            json!({
                "CheckpointLoaderSimple": { "input": { "required": { "ckpt_name": [["sd15.ckpt", "sdxl.safetensors"]] } } },
                "LoraLoader": { "input": { "required": { "lora_name": [["detail.safetensors"]] } } }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let catalog = client(&server.url()).list_models().await.unwrap();
    assert_eq!(catalog.models, vec!["sd15.ckpt", "sdxl.safetensors"]);
    assert_eq!(catalog.loras, vec!["detail.safetensors"]);
}

#[tokio::test]
async fn connection_check_reports_queue_depth() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/object_info")
        .with_body("{}")
        .create_async()
        .await;
    server
        .mock("GET", "/queue")
        .with_body(json!({ "queue_running": [[0, "a"]], "queue_pending": [] }).to_string())
        .create_async()
        .await;

    let report = client(&server.url()).check_connection().await;
    assert!(report.success);
    assert_eq!(report.running, Some(1));
    assert_eq!(report.pending, Some(0));
}

#[tokio::test]
async fn connection_check_reports_failure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/object_info")
        .with_status(503)
        .create_async()
        .await;

    let report = client(&server.url()).check_connection().await;
    assert!(!report.success);
    assert!(report.error.unwrap().starts_with("Connection failed"));
}
