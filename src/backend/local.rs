//! Directory-backed backend for tests and the demo.
//!
//! Each submission gets a working directory under the backend root, named by
//! its idempotency tag. The "external system" is anything that writes a
//! `result.json` into that directory; until then the submission polls as
//! Running. This mirrors how a batch backend behaves without needing one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::ContentStatus;
use crate::error::BackendError;
use crate::metadata::{FileSpec, OutputDescriptor};

use super::{Backend, ExternalStatus, PollResult, SubmitContext};

const JOB_FILE: &str = "job.json";
const RESULT_FILE: &str = "result.json";
const CANCEL_MARKER: &str = "cancelled";

/// What `submit` records about a submission.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    tag: String,
    scope: String,
    input_dataset: String,
    files: Vec<FileSpec>,
    command: Option<String>,
}

/// What the executor writes when a submission ends.
#[derive(Debug, Serialize, Deserialize)]
struct ResultRecord {
    /// "completed" or "failed".
    status: String,
    #[serde(default)]
    files: HashMap<String, ContentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
}

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_dir(&self, external_id: &str) -> PathBuf {
        self.root.join(external_id)
    }

    /// Mark a submission completed, with per-file statuses and an output
    /// document. The executor side of the contract.
    pub async fn complete(
        &self,
        external_id: &str,
        files: HashMap<String, ContentStatus>,
        output: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.write_result(
            external_id,
            &ResultRecord {
                status: "completed".into(),
                files,
                output: Some(output),
            },
        )
        .await
    }

    /// Mark a submission failed.
    pub async fn fail(
        &self,
        external_id: &str,
        files: HashMap<String, ContentStatus>,
    ) -> Result<(), BackendError> {
        self.write_result(
            external_id,
            &ResultRecord {
                status: "failed".into(),
                files,
                output: None,
            },
        )
        .await
    }

    async fn write_result(
        &self,
        external_id: &str,
        record: &ResultRecord,
    ) -> Result<(), BackendError> {
        let text = serde_json::to_string_pretty(record)
            .map_err(|e| BackendError::Fatal(format!("serializing result: {e}")))?;
        tokio::fs::write(self.job_dir(external_id).join(RESULT_FILE), text)
            .await
            .map_err(|e| BackendError::Transient(format!("writing result: {e}")))
    }

    async fn read_result(&self, path: &Path) -> Result<ResultRecord, BackendError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            // A declared output that is not there will never appear; treat it
            // like any other unreadable output, not a transient glitch.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::Parse(format!(
                    "missing output file {}",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(BackendError::Transient(format!(
                    "reading {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| BackendError::Parse(format!("malformed {}: {e}", path.display())))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, ctx: &SubmitContext) -> Result<String, BackendError> {
        let dir = self.job_dir(&ctx.tag);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackendError::Transient(format!("creating job dir: {e}")))?;
        let record = JobRecord {
            tag: ctx.tag.clone(),
            scope: ctx.scope.clone(),
            input_dataset: ctx.input_dataset.clone(),
            files: ctx.files.clone(),
            command: ctx.command.clone(),
        };
        let text = serde_json::to_string_pretty(&record)
            .map_err(|e| BackendError::Fatal(format!("serializing job: {e}")))?;
        tokio::fs::write(dir.join(JOB_FILE), text)
            .await
            .map_err(|e| BackendError::Transient(format!("writing job record: {e}")))?;
        Ok(ctx.tag.clone())
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<String>, BackendError> {
        let exists = tokio::fs::try_exists(self.job_dir(tag).join(JOB_FILE))
            .await
            .map_err(|e| BackendError::Transient(format!("probing job dir: {e}")))?;
        Ok(exists.then(|| tag.to_string()))
    }

    async fn poll(&self, external_id: &str) -> Result<PollResult, BackendError> {
        let dir = self.job_dir(external_id);
        let known = tokio::fs::try_exists(dir.join(JOB_FILE))
            .await
            .map_err(|e| BackendError::Transient(format!("probing job dir: {e}")))?;
        if !known {
            return Err(BackendError::Fatal(format!(
                "unknown submission {external_id}"
            )));
        }
        if tokio::fs::try_exists(dir.join(CANCEL_MARKER))
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?
        {
            return Ok(PollResult::status_only(ExternalStatus::Failed));
        }

        let result_path = dir.join(RESULT_FILE);
        if !tokio::fs::try_exists(&result_path)
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?
        {
            return Ok(PollResult::status_only(ExternalStatus::Running));
        }

        let record = self.read_result(&result_path).await?;
        let status = match record.status.as_str() {
            "completed" => ExternalStatus::Completed,
            "failed" => ExternalStatus::Failed,
            _ => ExternalStatus::Unknown,
        };
        let output = (status == ExternalStatus::Completed).then(|| OutputDescriptor {
            path: result_path.display().to_string(),
        });
        Ok(PollResult {
            status,
            file_statuses: record.files,
            output,
        })
    }

    async fn cancel(&self, external_id: &str) -> Result<(), BackendError> {
        let dir = self.job_dir(external_id);
        if !tokio::fs::try_exists(dir.join(JOB_FILE))
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?
        {
            return Ok(());
        }
        tokio::fs::write(dir.join(CANCEL_MARKER), b"")
            .await
            .map_err(|e| BackendError::Transient(format!("writing cancel marker: {e}")))
    }

    async fn parse_outputs(
        &self,
        external_id: &str,
        output: &OutputDescriptor,
    ) -> Result<serde_json::Value, BackendError> {
        let record = self.read_result(Path::new(&output.path)).await?;
        record.output.ok_or_else(|| {
            BackendError::Parse(format!("submission {external_id} declared no output"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(tag: &str) -> SubmitContext {
        SubmitContext {
            tag: tag.into(),
            scope: "user.test".into(),
            input_dataset: "user.test.dataset1".into(),
            files: vec![FileSpec {
                scope: "user.test".into(),
                name: "file1".into(),
                min_id: None,
                max_id: None,
            }],
            command: Some("run.sh".into()),
        }
    }

    #[tokio::test]
    async fn submit_then_find_by_tag() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        assert_eq!(backend.find_by_tag("idds-proc-1").await.unwrap(), None);
        let external_id = backend.submit(&ctx("idds-proc-1")).await.unwrap();
        assert_eq!(
            backend.find_by_tag("idds-proc-1").await.unwrap(),
            Some(external_id)
        );
    }

    #[tokio::test]
    async fn runs_until_result_appears_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let id = backend.submit(&ctx("idds-proc-2")).await.unwrap();

        let poll = backend.poll(&id).await.unwrap();
        assert_eq!(poll.status, ExternalStatus::Running);

        let mut files = HashMap::new();
        files.insert("user.test:file1".to_string(), ContentStatus::Available);
        backend
            .complete(&id, files, json!({"result": 42}))
            .await
            .unwrap();

        let poll = backend.poll(&id).await.unwrap();
        assert_eq!(poll.status, ExternalStatus::Completed);
        assert_eq!(
            poll.file_statuses.get("user.test:file1"),
            Some(&ContentStatus::Available)
        );
        let output = poll.output.unwrap();
        let parsed = backend.parse_outputs(&id, &output).await.unwrap();
        assert_eq!(parsed, json!({"result": 42}));
    }

    #[tokio::test]
    async fn failed_submission_polls_failed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let id = backend.submit(&ctx("idds-proc-3")).await.unwrap();

        let mut files = HashMap::new();
        files.insert("user.test:file1".to_string(), ContentStatus::Failed);
        backend.fail(&id, files).await.unwrap();

        let poll = backend.poll(&id).await.unwrap();
        assert_eq!(poll.status, ExternalStatus::Failed);
        assert!(poll.output.is_none());
    }

    #[tokio::test]
    async fn cancel_marks_submission_failed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let id = backend.submit(&ctx("idds-proc-4")).await.unwrap();

        backend.cancel(&id).await.unwrap();
        backend.cancel(&id).await.unwrap();
        let poll = backend.poll(&id).await.unwrap();
        assert_eq!(poll.status, ExternalStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_submission_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend.poll("nope").await.unwrap_err();
        assert!(matches!(err, BackendError::Fatal(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn missing_output_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let descriptor = OutputDescriptor {
            path: dir.path().join("gone").join(RESULT_FILE).display().to_string(),
        };
        let err = backend.parse_outputs("idds-proc-9", &descriptor).await.unwrap_err();
        assert!(matches!(err, BackendError::Parse(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malformed_result_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let id = backend.submit(&ctx("idds-proc-5")).await.unwrap();
        tokio::fs::write(dir.path().join(&id).join(RESULT_FILE), "not json")
            .await
            .unwrap();
        let err = backend.poll(&id).await.unwrap_err();
        assert!(matches!(err, BackendError::Parse(_)));
    }
}
