//! Local outbox delivery used when no delivery command is configured.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::info;

use super::DeliveryChannel;
use crate::error::StageError;
use crate::meeting::{Meeting, User};

/// Copies each report into `<outbox>/<recipient key>/` next to a JSON
/// envelope naming the recipient, for a mailer to pick up.
pub struct LocalOutbox {
    dir: PathBuf,
}

impl LocalOutbox {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StageError {
    let message = format!("Failed to {} {:?}: {}", action, path, err);
    if err.kind() == std::io::ErrorKind::NotFound {
        StageError::permanent(message)
    } else {
        StageError::transient(message)
    }
}

#[async_trait]
impl DeliveryChannel for LocalOutbox {
    async fn send(
        &self,
        meeting: &Meeting,
        report_ref: &str,
        recipient: &User,
    ) -> Result<String, StageError> {
        let source = Path::new(report_ref);
        let file_name = source
            .file_name()
            .ok_or_else(|| StageError::permanent(format!("Invalid report path: {}", report_ref)))?;

        let dir = self.dir.join(&recipient.hash_key);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, e))?;

        let target = dir.join(file_name);
        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| io_error("copy report", source, e))?;

        let envelope = json!({
            "meeting_id": meeting.id,
            "title": meeting.display_title(),
            "to": recipient.email,
            "name": recipient.name,
            "attachment": target,
        });
        let envelope_path = target.with_extension("json");
        tokio::fs::write(&envelope_path, envelope.to_string())
            .await
            .map_err(|e| io_error("write", &envelope_path, e))?;

        info!(
            "Queued report for meeting {} to {} in {:?}",
            meeting.id, recipient.email, dir
        );
        Ok(format!("outbox:{}", envelope_path.to_string_lossy()))
    }
}
