use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;

use crate::audit::{Artifact, AuditLog};
use crate::error::FilterError;

/// Writes audit artifacts as `<prefix>_<id>.txt` files below one directory.
pub struct FsAuditLog {
    dir: Utf8PathBuf,
}

impl FsAuditLog {
    pub fn new<P: AsRef<Utf8Path>>(dir: P) -> Self {
        FsAuditLog {
            dir: dir.as_ref().to_owned(),
        }
    }

    pub fn file_path(&self, artifact: Artifact, id: &str) -> Utf8PathBuf {
        self.dir.join(format!("{}_{}.txt", artifact.prefix(), id))
    }

    async fn write(&self, artifact: Artifact, id: &str, parts: &[&[u8]]) -> Result<Utf8PathBuf, FilterError> {
        let path = self.file_path(artifact, id);
        let to_error = |source| FilterError::Audit {
            path: path.to_string(),
            source,
        };

        // The directory may be cleaned up while the daemon runs.
        fs::create_dir_all(&self.dir).await.map_err(to_error)?;
        fs::write(&path, parts.concat()).await.map_err(to_error)?;
        Ok(path)
    }
}

#[async_trait]
impl AuditLog for FsAuditLog {
    async fn transcript(&self, id: &str, transcript: &[u8]) -> Result<Utf8PathBuf, FilterError> {
        self.write(Artifact::Transcript, id, &[transcript]).await
    }

    async fn decoded(&self, id: &str, decoded: &[u8]) -> Result<Utf8PathBuf, FilterError> {
        self.write(Artifact::Decoded, id, &[decoded]).await
    }

    async fn spam(
        &self,
        id: &str,
        decoded: &[u8],
        evidence: &str,
    ) -> Result<Utf8PathBuf, FilterError> {
        self.write(Artifact::Spam, id, &[decoded, evidence.as_bytes(), &b"\r\n"[..]])
            .await
    }
}
