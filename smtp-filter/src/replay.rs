use camino::Utf8Path;
use miette::{Context, IntoDiagnostic, Result};

use crate::audit::AuditLog;
use crate::rules::{Snapshot, Verdict};

/// Id under which one-shot artifacts are written.
pub const REPLAY_ID: &str = "0";

/// Decodes and classifies a captured message file the same way a live
/// session would, writing `sdec_0.txt` (and `spam_0.txt` for spam).
pub async fn replay_file(
    path: &Utf8Path,
    snapshot: &Snapshot,
    audit: &dyn AuditLog,
    snippet_len: usize,
) -> Result<Verdict> {
    let raw = tokio::fs::read(path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("reading {}", path))?;

    let message = smtp::decode_message(&raw);
    audit
        .decoded(REPLAY_ID, &message.body)
        .await
        .wrap_err("writing decoded message")?;

    let verdict = snapshot.classify(&message, snippet_len);
    verdict.log(REPLAY_ID);
    if verdict.is_spam() && snapshot.debug_level >= 1 {
        audit
            .spam(REPLAY_ID, &message.body, &verdict.to_string())
            .await
            .wrap_err("writing spam evidence")?;
    }

    Ok(verdict)
}
