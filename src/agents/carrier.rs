//! Carrier: the processing-level agent.
//!
//! The only agent that talks to external systems. Submits processings
//! through their backend plugin, polls them, maps per-file progress onto
//! output contents, creates supplementary stage-in rules for files that
//! overrun their waiting budget, and settles each processing's terminal
//! status.
//!
//! Submission is made idempotent by committing `Submitting` before the
//! external call and tagging every submission, so a worker that crashes
//! after submit but before commit recovers the external id through
//! `find_by_tag` instead of submitting twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::backend::{Backend, BackendRegistry, ExternalStatus, PollResult, SubmitContext};
use crate::catalog::{Catalog, ClaimOptions, ContentUpdate, ProcessingUpdate, TransformUpdate};
use crate::entities::{
    CollectionRelationType, Content, Message, MessageDestination, MessageLevel, Processing,
    ProcessingStatus, Rollup, message_type, rollup_contents,
};
use crate::error::{BackendError, Result};
use crate::eventbus::{EventBus, EventType};
use crate::lease::LockOwner;
use crate::metadata::{ProcessingMeta, TransformMeta, WorkKind};
use crate::scheduler::AgentHandler;

/// Supplementary rules created for one stage-in processing before it is
/// declared failed.
const MAX_NEW_RULES: usize = 3;

pub struct Carrier {
    catalog: Arc<dyn Catalog>,
    bus: Arc<EventBus>,
    registry: Arc<BackendRegistry>,
    owner: LockOwner,
    options: ClaimOptions,
    poll_period_secs: i64,
}

impl Carrier {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        bus: Arc<EventBus>,
        registry: Arc<BackendRegistry>,
        options: ClaimOptions,
        poll_period_secs: i64,
    ) -> Self {
        Self {
            catalog,
            bus,
            registry,
            owner: LockOwner::current("carrier"),
            options,
            poll_period_secs,
        }
    }

    fn reschedule(&self) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(self.poll_period_secs)
    }

    async fn handle_processing(&self, processing: &Processing) -> Result<()> {
        match processing.status {
            ProcessingStatus::New => {
                // Commit intent before the external call; if we crash between
                // the two, the next holder resolves the tag instead of
                // double-submitting.
                self.catalog.update_processing(
                    processing.id,
                    ProcessingUpdate {
                        status: Some(ProcessingStatus::Submitting),
                        ..Default::default()
                    },
                )?;
                let mut submitting = processing.clone();
                submitting.status = ProcessingStatus::Submitting;
                self.submit(&submitting).await
            }
            ProcessingStatus::Submitting => self.submit(processing).await,
            ProcessingStatus::Submitted | ProcessingStatus::Running => {
                self.poll(processing).await
            }
            ProcessingStatus::Cancel => self.cancel(processing).await,
            _ => self.defer(processing.id),
        }
    }

    async fn submit(&self, processing: &Processing) -> Result<()> {
        let transform = self.catalog.get_transform(processing.transform_id)?;
        let mut meta = TransformMeta::from_value(&transform.transform_metadata)?;
        let backend = match self.registry.get(&processing.submitter) {
            Ok(backend) => backend,
            Err(error) => return self.fail(processing, &error.to_string(), ProcessingStatus::Failed),
        };

        let tag = processing.submission_tag();
        let external_id = match backend.find_by_tag(&tag).await {
            Ok(Some(id)) => {
                info!(processing_id = processing.id, external_id = %id, "adopted prior submission");
                id
            }
            Ok(None) => {
                if transform.is_expired() {
                    return self.fail(processing, "transform expired before submission", ProcessingStatus::Failed);
                }
                let ctx = SubmitContext {
                    tag: tag.clone(),
                    scope: meta.work.scope.clone(),
                    input_dataset: meta.work.input_dataset.clone(),
                    files: meta.work.files.clone(),
                    command: meta.work.command.clone(),
                };
                match backend.submit(&ctx).await {
                    Ok(id) => id,
                    Err(error) if error.is_transient() => {
                        warn!(processing_id = processing.id, %error, "submit deferred");
                        return self.defer(processing.id);
                    }
                    Err(error) => {
                        return self.fail(processing, &error.to_string(), ProcessingStatus::Failed);
                    }
                }
            }
            Err(error) if error.is_transient() => {
                warn!(processing_id = processing.id, %error, "tag lookup deferred");
                return self.defer(processing.id);
            }
            Err(error) => {
                return self.fail(processing, &error.to_string(), ProcessingStatus::Failed);
            }
        };

        // Record the submission on the transform: first submission timestamp
        // starts the stage-in waiting budget, and stage-in keeps its basic
        // rule id for supplementary-rule bookkeeping.
        let mut meta_changed = false;
        if meta.first_submitted_at.is_none() {
            meta.first_submitted_at = Some(Utc::now());
            meta_changed = true;
        }
        if meta.work.kind == WorkKind::StageIn && meta.basic_rule_id.is_none() {
            meta.basic_rule_id = Some(external_id.clone());
            meta_changed = true;
        }
        if meta_changed {
            self.catalog.update_transform(
                transform.id,
                TransformUpdate {
                    transform_metadata: Some(meta.to_value()?),
                    ..Default::default()
                },
            )?;
        }

        info!(processing_id = processing.id, external_id = %external_id, "submitted");
        self.catalog.update_processing(
            processing.id,
            ProcessingUpdate {
                status: Some(ProcessingStatus::Submitted),
                submitted_id: Some(external_id),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    async fn poll(&self, processing: &Processing) -> Result<()> {
        let Some(external_id) = processing.submitted_id.clone() else {
            // Claimed in Submitted without an external id: the submit commit
            // was lost; go back through the submission path.
            return self.submit(processing).await;
        };
        let backend = match self.registry.get(&processing.submitter) {
            Ok(backend) => backend,
            Err(error) => return self.fail(processing, &error.to_string(), ProcessingStatus::Failed),
        };

        let result = match backend.poll(&external_id).await {
            Ok(result) => result,
            Err(error) if error.is_transient() => {
                warn!(processing_id = processing.id, %error, "poll deferred");
                return self.defer(processing.id);
            }
            Err(BackendError::Fatal(reason)) => {
                // The external system no longer knows the submission.
                return self.fail(processing, &reason, ProcessingStatus::Lost);
            }
            Err(error) => {
                return self.fail(processing, &error.to_string(), ProcessingStatus::Failed);
            }
        };

        let contents = self.apply_file_statuses(processing, &result).await?;

        match result.status {
            ExternalStatus::Pending | ExternalStatus::Running | ExternalStatus::Unknown => {
                if self.check_stagein_budget(processing, &contents).await? {
                    // The waiting budget ran out; the processing is settled.
                    return Ok(());
                }
                self.catalog.update_processing(
                    processing.id,
                    ProcessingUpdate {
                        status: Some(ProcessingStatus::Running),
                        next_poll_at: Some(self.reschedule()),
                        processing_metadata: Some(self.meta_with_stats(processing, &contents, None)?),
                        unlock: true,
                        ..Default::default()
                    },
                )
            }
            ExternalStatus::Completed => self.complete(processing, &backend, &result, &contents).await,
            ExternalStatus::Failed => {
                self.fail(processing, "external execution failed", ProcessingStatus::Failed)
            }
        }
    }

    /// Terminal handling for a completed submission. Completion gates on the
    /// declared outputs: a completed run whose outputs cannot be read or
    /// parsed is a failure, not a success.
    async fn complete(
        &self,
        processing: &Processing,
        backend: &Arc<dyn Backend>,
        result: &PollResult,
        contents: &[Content],
    ) -> Result<()> {
        let output_value = match &result.output {
            Some(descriptor) => {
                match backend
                    .parse_outputs(processing.submitted_id.as_deref().unwrap_or_default(), descriptor)
                    .await
                {
                    Ok(value) => Some(value),
                    Err(error) if error.is_transient() => {
                        warn!(processing_id = processing.id, %error, "output read deferred");
                        return self.defer(processing.id);
                    }
                    Err(error) => {
                        return self.fail(
                            processing,
                            &format!("completed but outputs unreadable: {error}"),
                            ProcessingStatus::Failed,
                        );
                    }
                }
            }
            None => None,
        };

        // Iterative work signals a follow-on iteration in its output.
        let continue_requested = output_value
            .as_ref()
            .and_then(|v| v.get("continue"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let status = if continue_requested {
            ProcessingStatus::FinishedOnExec
        } else if contents.is_empty() {
            ProcessingStatus::Finished
        } else {
            let rollup: Rollup = rollup_contents(contents.iter().map(|c| c.status));
            rollup.into()
        };

        self.catalog.update_processing(
            processing.id,
            ProcessingUpdate {
                status: Some(status),
                output_metadata: output_value,
                processing_metadata: Some(self.meta_with_stats(processing, contents, None)?),
                ..Default::default()
            },
        )?;
        self.bus.publish(EventType::UpdateTransform, processing.transform_id);
        info!(processing_id = processing.id, %status, "processing completed");

        if !contents.is_empty() {
            let transform = self.catalog.get_transform(processing.transform_id)?;
            let meta = TransformMeta::from_value(&transform.transform_metadata)?;
            self.catalog.add_message(
                Message::new(
                    message_type(meta.work.kind, MessageLevel::File),
                    MessageDestination::Outside,
                    json!({
                        "request_id": processing.request_id,
                        "transform_id": processing.transform_id,
                        "processing_id": processing.id,
                        "files": contents
                            .iter()
                            .map(|c| json!({"key": c.key(), "status": c.status.to_string(), "path": c.path}))
                            .collect::<Vec<_>>(),
                    }),
                )
                .for_work(processing.request_id, processing.transform_id, Some(processing.id)),
            )?;
        }
        Ok(())
    }

    async fn cancel(&self, processing: &Processing) -> Result<()> {
        if let Some(external_id) = &processing.submitted_id {
            let backend = self.registry.get(&processing.submitter)?;
            match backend.cancel(external_id).await {
                Ok(()) => {}
                Err(error) if error.is_transient() => {
                    warn!(processing_id = processing.id, %error, "cancel deferred");
                    return self.defer(processing.id);
                }
                // The submission is gone either way.
                Err(error) => warn!(processing_id = processing.id, %error, "cancel failed"),
            }
        }
        self.catalog.update_processing(
            processing.id,
            ProcessingUpdate {
                status: Some(ProcessingStatus::Cancelled),
                ..Default::default()
            },
        )?;
        self.bus.publish(EventType::UpdateTransform, processing.transform_id);
        Ok(())
    }

    /// Map the backend's per-file report onto output contents. Returns the
    /// refreshed output contents of the owning transform.
    async fn apply_file_statuses(
        &self,
        processing: &Processing,
        result: &PollResult,
    ) -> Result<Vec<Content>> {
        let mut contents = self.output_contents(processing.transform_id)?;
        if !result.file_statuses.is_empty() {
            let mut updates = Vec::new();
            for content in &contents {
                if let Some(&status) = result.file_statuses.get(&content.key())
                    && content.status != status
                    && content.status.allows(status)
                {
                    updates.push(ContentUpdate {
                        id: content.id,
                        status: Some(status),
                        path: None,
                    });
                }
            }
            if !updates.is_empty() {
                self.catalog.update_contents(updates)?;
                contents = self.output_contents(processing.transform_id)?;
            }
        }
        Ok(contents)
    }

    /// Stage-in only: when the basic rule has run past `max_waiting_time`
    /// with files still missing, create a supplementary rule for exactly the
    /// missing files. After [`MAX_NEW_RULES`] supplementary rules the
    /// processing is declared failed instead of waiting forever.
    ///
    /// Returns true when the processing was settled (failed) here.
    async fn check_stagein_budget(
        &self,
        processing: &Processing,
        contents: &[Content],
    ) -> Result<bool> {
        let transform = self.catalog.get_transform(processing.transform_id)?;
        let mut meta = TransformMeta::from_value(&transform.transform_metadata)?;
        if meta.work.kind != WorkKind::StageIn {
            return Ok(false);
        }
        let Some(max_waiting) = meta.work.max_waiting_time else {
            return Ok(false);
        };
        let Some(first_submitted_at) = meta.first_submitted_at else {
            return Ok(false);
        };
        if Utc::now() - first_submitted_at <= Duration::seconds(max_waiting) {
            return Ok(false);
        }

        let missing: Vec<_> = contents
            .iter()
            .filter(|c| !c.status.is_terminal())
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }

        if meta.new_rule_ids.len() >= MAX_NEW_RULES {
            self.fail(
                processing,
                &format!(
                    "stage-in stalled: {} files missing after rules [{}]",
                    missing.len(),
                    meta.all_rule_ids().join(", ")
                ),
                ProcessingStatus::Failed,
            )?;
            return Ok(true);
        }

        let backend = self.registry.get(&processing.submitter)?;
        let tag = format!(
            "{}-supp-{}",
            processing.submission_tag(),
            meta.new_rule_ids.len() + 1
        );
        let rule_id = match backend.find_by_tag(&tag).await {
            Ok(Some(id)) => id,
            Err(error) if error.is_transient() => {
                warn!(processing_id = processing.id, %error, "supplementary tag lookup deferred");
                return Ok(false);
            }
            Err(error) => return Err(error.into()),
            Ok(None) => {
                let ctx = SubmitContext {
                    tag,
                    scope: meta.work.scope.clone(),
                    input_dataset: meta.work.input_dataset.clone(),
                    files: meta
                        .work
                        .files
                        .iter()
                        .filter(|f| missing.iter().any(|c| c.key() == f.key()))
                        .cloned()
                        .collect(),
                    command: None,
                };
                match backend.submit(&ctx).await {
                    Ok(id) => id,
                    Err(error) if error.is_transient() => {
                        warn!(processing_id = processing.id, %error, "supplementary rule deferred");
                        return Ok(false);
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        };

        info!(
            processing_id = processing.id,
            rule_id = %rule_id,
            missing = missing.len(),
            "created supplementary stage-in rule"
        );
        meta.new_rule_ids.push(rule_id);
        // Restart the waiting budget for the new rule.
        meta.first_submitted_at = Some(Utc::now());
        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
                transform_metadata: Some(meta.to_value()?),
                ..Default::default()
            },
        )?;
        Ok(false)
    }

    fn meta_with_stats(
        &self,
        processing: &Processing,
        contents: &[Content],
        errors: Option<String>,
    ) -> Result<serde_json::Value> {
        let mut meta = if processing.processing_metadata.is_null() {
            ProcessingMeta::default()
        } else {
            ProcessingMeta::from_value(&processing.processing_metadata)?
        };
        let mut stats: HashMap<String, usize> = HashMap::new();
        for content in contents {
            *stats.entry(content.status.name().to_string()).or_insert(0) += 1;
        }
        meta.content_status_statistics = stats;
        if errors.is_some() {
            meta.errors = errors;
        }
        meta.to_value()
    }

    fn fail(&self, processing: &Processing, errors: &str, status: ProcessingStatus) -> Result<()> {
        warn!(processing_id = processing.id, errors, %status, "processing failed");
        let contents = self.output_contents(processing.transform_id)?;
        self.catalog.update_processing(
            processing.id,
            ProcessingUpdate {
                status: Some(status),
                processing_metadata: Some(self.meta_with_stats(
                    processing,
                    &contents,
                    Some(errors.to_string()),
                )?),
                ..Default::default()
            },
        )?;
        self.bus.publish(EventType::UpdateTransform, processing.transform_id);
        Ok(())
    }

    fn defer(&self, processing_id: u64) -> Result<()> {
        self.catalog.update_processing(
            processing_id,
            ProcessingUpdate {
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn output_contents(&self, transform_id: u64) -> Result<Vec<Content>> {
        let mut contents = Vec::new();
        for collection in self
            .catalog
            .get_collections_by_transform(transform_id, Some(CollectionRelationType::Output))?
        {
            contents.extend(self.catalog.get_contents_by_collection(collection.id)?);
        }
        Ok(contents)
    }
}

#[async_trait]
impl AgentHandler for Carrier {
    fn name(&self) -> &'static str {
        "carrier"
    }

    async fn run_cycle(&self) -> Result<usize> {
        for event_type in [EventType::NewProcessing, EventType::UpdateProcessing] {
            for event in self.bus.drain(event_type, self.options.bulk_size) {
                let _ = self.catalog.update_processing(
                    event.actual_id,
                    ProcessingUpdate {
                        next_poll_at: Some(Utc::now()),
                        ..Default::default()
                    },
                );
            }
        }

        let processings = self.catalog.claim_processings(
            &[
                ProcessingStatus::New,
                ProcessingStatus::Submitting,
                ProcessingStatus::Submitted,
                ProcessingStatus::Running,
                ProcessingStatus::Cancel,
            ],
            &self.owner,
            self.options,
        )?;
        let handled = processings.len();
        for processing in processings {
            if let Err(error) = self.handle_processing(&processing).await {
                warn!(processing_id = processing.id, %error, "processing handling failed");
                self.fail(&processing, &error.to_string(), ProcessingStatus::Failed)?;
            }
        }
        Ok(handled)
    }
}
