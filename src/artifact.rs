use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::job::OutputDescriptor;
use crate::util::extension_or;

/// Directory under `<project>/image/` that holds generated images, also the
/// first segment of their public path.
pub const IMAGE_SUBDIR: &str = "comfyuigen";
pub const DEFAULT_EXTENSION: &str = ".png";
const URL_PATH_SLOT: &str = "{path}";

/// Bytes fetched for one reported output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub output: OutputDescriptor,
    pub bytes: Vec<u8>,
}

/// A generated image written to local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub remote_filename: String,
    pub subfolder: String,
    pub kind: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub local_filename: String,
    pub local_path: PathBuf,
    /// Path relative to the project root, e.g. `image/comfyuigen/<file>`.
    pub server_path: String,
    pub public_url: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactPersister {
    destination: PathBuf,
    url_template: String,
}

impl ArtifactPersister {
    /// `url_template` must contain a `{path}` slot, which receives
    /// `comfyuigen/<local filename>`.
    pub fn new(destination: impl Into<PathBuf>, url_template: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            url_template: url_template.into(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn public_url(&self, local_filename: &str) -> String {
        let relative = format!("{}/{}", IMAGE_SUBDIR, local_filename);
        if self.url_template.contains(URL_PATH_SLOT) {
            self.url_template.replace(URL_PATH_SLOT, &relative)
        } else {
            format!("{}/{}", self.url_template.trim_end_matches('/'), relative)
        }
    }

    /// Writes one artifact under a fresh name. Never overwrites.
    pub async fn persist_one(&self, downloaded: DownloadedArtifact) -> Result<Artifact> {
        let DownloadedArtifact { output, bytes } = downloaded;
        let failure = |reason: String| PipelineError::Persist {
            filename: output.filename.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&self.destination)
            .await
            .map_err(|e| failure(format!("cannot create {}: {}", self.destination.display(), e)))?;

        let local_filename = format!(
            "{}{}",
            Uuid::new_v4(),
            extension_or(&output.filename, DEFAULT_EXTENSION)
        );
        let local_path = self.destination.join(&local_filename);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&local_path)
            .await
            .map_err(|e| failure(format!("cannot create {}: {}", local_path.display(), e)))?;
        write_or_discard(&local_path, file, &bytes)
            .await
            .map_err(|e| failure(format!("cannot write {}: {}", local_path.display(), e)))?;
        debug!("Image saved to {}", local_path.display());

        Ok(Artifact {
            public_url: self.public_url(&local_filename),
            server_path: format!("image/{}/{}", IMAGE_SUBDIR, local_filename),
            remote_filename: output.filename,
            subfolder: output.subfolder,
            kind: output.kind,
            bytes,
            local_filename,
            local_path,
        })
    }

    /// Persists each artifact independently; failures are logged and skipped.
    pub async fn persist(&self, downloaded: Vec<DownloadedArtifact>) -> Vec<Artifact> {
        let mut saved = Vec::with_capacity(downloaded.len());
        for item in downloaded {
            match self.persist_one(item).await {
                Ok(artifact) => saved.push(artifact),
                Err(err) => warn!("{}", err),
            }
        }
        saved
    }
}

/// Writes `bytes` through `writer`; on failure the partial file at `path`
/// is removed so it is never published.
async fn write_or_discard<W>(path: &Path, mut writer: W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    }
    .await;
    if written.is_err() {
        drop(writer);
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove partial file {}: {}", path.display(), err);
        }
    }
    written
}
