use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::error::FilterError;

pub mod fs_audit;

pub use fs_audit::FsAuditLog;

/// Kind of artifact persisted for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// Tagged transcript of the relayed dialogue.
    Transcript,
    /// Decoded message as the rules saw it.
    Decoded,
    /// Decoded message followed by the verdict that rejected it.
    Spam,
}

impl Artifact {
    pub fn prefix(&self) -> &'static str {
        match self {
            Artifact::Transcript => "smtp",
            Artifact::Decoded => "sdec",
            Artifact::Spam => "spam",
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn transcript(&self, id: &str, transcript: &[u8]) -> Result<Utf8PathBuf, FilterError>;
    async fn decoded(&self, id: &str, decoded: &[u8]) -> Result<Utf8PathBuf, FilterError>;
    async fn spam(&self, id: &str, decoded: &[u8], evidence: &str)
        -> Result<Utf8PathBuf, FilterError>;
}
