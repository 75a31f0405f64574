//! Transformer: the transform-level agent.
//!
//! Materializes a new transform's collections and contents, creates its
//! first processing, chains follow-on processings for iterative work, and
//! aggregates output-content statuses into the transform outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{Catalog, ClaimOptions, ProcessingUpdate, TransformUpdate};
use crate::entities::{
    Collection, CollectionRelationType, Content, ContentStatus, Message, MessageDestination,
    MessageLevel, Processing, ProcessingStatus, Rollup, Transform, TransformStatus, message_type,
    rollup_contents,
};
use crate::error::{Error, Result};
use crate::eventbus::{EventBus, EventType};
use crate::lease::LockOwner;
use crate::metadata::TransformMeta;
use crate::scheduler::AgentHandler;

pub struct Transformer {
    catalog: Arc<dyn Catalog>,
    bus: Arc<EventBus>,
    owner: LockOwner,
    options: ClaimOptions,
    poll_period_secs: i64,
}

impl Transformer {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        bus: Arc<EventBus>,
        options: ClaimOptions,
        poll_period_secs: i64,
    ) -> Self {
        Self {
            catalog,
            bus,
            owner: LockOwner::current("transformer"),
            options,
            poll_period_secs,
        }
    }

    fn reschedule(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::seconds(self.poll_period_secs)
    }

    fn handle_transform(&self, transform: &Transform) -> Result<()> {
        match transform.status {
            TransformStatus::New => self.materialize(transform),
            TransformStatus::Transforming => self.poll_processings(transform),
            TransformStatus::ToCancel => self.propagate_cancel(transform),
            TransformStatus::Cancelling => self.finish_cancel(transform),
            _ => self.catalog.update_transform(
                transform.id,
                TransformUpdate {
                    next_poll_at: Some(self.reschedule()),
                    unlock: true,
                    ..Default::default()
                },
            ),
        }
    }

    /// New transform: create its input/output collections, register the input
    /// files as contents, and start the first processing.
    fn materialize(&self, transform: &Transform) -> Result<()> {
        let meta = TransformMeta::from_value(&transform.transform_metadata)?;
        let work = &meta.work;

        // A reclaimed transform may already have been partially materialized
        // by a crashed worker; collections and the first processing are only
        // created once.
        let existing = self.catalog.get_collections_by_transform(transform.id, None)?;
        if existing.is_empty() {
            let input_id = self.catalog.add_collection(Collection::new(
                transform.id,
                &work.scope,
                &work.input_dataset,
                CollectionRelationType::Input,
            ))?;
            let output_id = self.catalog.add_collection(Collection::new(
                transform.id,
                &work.scope,
                &work.input_dataset,
                CollectionRelationType::Output,
            ))?;

            // Input files already exist at the source; the output side tracks
            // the per-file progress the carrier reports.
            let mut inputs = Vec::with_capacity(work.files.len());
            let mut outputs = Vec::with_capacity(work.files.len());
            for file in &work.files {
                let mut input = Content::new(input_id, &file.scope, &file.name);
                input.min_id = file.min_id;
                input.max_id = file.max_id;
                input.status = ContentStatus::Available;
                inputs.push(input);

                let mut output = Content::new(output_id, &file.scope, &file.name);
                output.min_id = file.min_id;
                output.max_id = file.max_id;
                outputs.push(output);
            }
            self.catalog.add_contents(inputs)?;
            self.catalog.add_contents(outputs)?;
        }

        match self.catalog.add_processing(Processing::new(
            transform.id,
            transform.request_id,
            &work.backend,
        )) {
            Ok(processing_id) => {
                self.bus.publish(EventType::NewProcessing, processing_id);
                info!(
                    transform_id = transform.id,
                    processing_id,
                    files = work.files.len(),
                    "transform materialized"
                );
            }
            // An active processing already exists from a previous attempt.
            Err(Error::Conflict(_)) => {}
            Err(error) => return Err(error),
        }

        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
                status: Some(TransformStatus::Transforming),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    /// Running transform: wait for its processings; once all are terminal,
    /// either chain a follow-on (iterative work that ended FinishedOnExec
    /// with budget left) or aggregate the outcome.
    fn poll_processings(&self, transform: &Transform) -> Result<()> {
        let mut processings = self.catalog.get_processings_by_transform(transform.id)?;
        processings.sort_by_key(|p| p.id);

        let all_terminal = !processings.is_empty() && processings.iter().all(|p| p.status.is_terminal());
        if all_terminal {
            let last = &processings[processings.len() - 1];
            if last.status == ProcessingStatus::FinishedOnExec
                && let Some(chained) = self.try_chain(transform, last)?
            {
                info!(
                    transform_id = transform.id,
                    processing_id = chained,
                    "chained follow-on processing"
                );
                return self.catalog.update_transform(
                    transform.id,
                    TransformUpdate {
                        next_poll_at: Some(self.reschedule()),
                        unlock: true,
                        ..Default::default()
                    },
                );
            }
            return self.aggregate(transform, last);
        }

        if transform.is_expired() {
            for processing in &processings {
                if !processing.status.is_terminal() {
                    self.catalog.update_processing(
                        processing.id,
                        ProcessingUpdate {
                            status: Some(ProcessingStatus::Cancel),
                            next_poll_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )?;
                    self.bus.publish(EventType::UpdateProcessing, processing.id);
                }
            }
            warn!(transform_id = transform.id, "transform expired");
            return self.catalog.update_transform(
                transform.id,
                TransformUpdate {
                    status: Some(TransformStatus::Failed),
                    errors: Some("transform expired".into()),
                    ..Default::default()
                },
            );
        }

        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    /// Chain a follow-on processing when the iteration budget allows it.
    ///
    /// The chain counter lives in the transform metadata and is advanced with
    /// a compare-and-set on the transform version, so two replicas observing
    /// the same FinishedOnExec cannot both chain. Returns the new processing
    /// id, or `None` when the budget is exhausted.
    fn try_chain(&self, transform: &Transform, last: &Processing) -> Result<Option<u64>> {
        let mut meta = TransformMeta::from_value(&transform.transform_metadata)?;
        let budget = meta.work.max_chained_processings.unwrap_or(0);
        if meta.chained_processings >= budget {
            return Ok(None);
        }

        meta.chained_processings += 1;
        match self.catalog.update_transform_guarded(
            transform.id,
            transform.version,
            TransformUpdate {
                transform_metadata: Some(meta.to_value()?),
                ..Default::default()
            },
        ) {
            Ok(()) => {}
            Err(Error::StaleVersion { .. }) => {
                // A replica advanced the chain first; let it create the row.
                return Ok(None);
            }
            Err(error) => return Err(error),
        }

        let processing_id = self.catalog.add_processing(Processing::new(
            transform.id,
            transform.request_id,
            &last.submitter,
        ))?;
        self.bus.publish(EventType::NewProcessing, processing_id);
        Ok(Some(processing_id))
    }

    /// Derive the transform outcome. File-granular work rolls up over its
    /// output contents; work without contents maps the final processing
    /// status directly.
    fn aggregate(&self, transform: &Transform, last: &Processing) -> Result<()> {
        let output_contents = self.output_contents(transform.id)?;
        let status = if output_contents.is_empty() {
            match last.status {
                ProcessingStatus::Finished | ProcessingStatus::FinishedOnExec => {
                    TransformStatus::Finished
                }
                ProcessingStatus::SubFinished => TransformStatus::SubFinished,
                ProcessingStatus::Cancelled => TransformStatus::Cancelled,
                _ => TransformStatus::Failed,
            }
        } else {
            let rollup: Rollup = rollup_contents(output_contents.iter().map(|c| c.status));
            // A cancelled run never reports success, whatever the files say.
            if last.status == ProcessingStatus::Cancelled {
                TransformStatus::Cancelled
            } else {
                rollup.into()
            }
        };

        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
                status: Some(status),
                ..Default::default()
            },
        )?;

        let meta = TransformMeta::from_value(&transform.transform_metadata)?;
        self.catalog.add_message(
            Message::new(
                message_type(meta.work.kind, MessageLevel::Work),
                MessageDestination::Outside,
                json!({
                    "request_id": transform.request_id,
                    "transform_id": transform.id,
                    "status": status.to_string(),
                    "output": last.output_metadata,
                    "files": {
                        "total": output_contents.len(),
                        "available": output_contents.iter().filter(|c| c.status == ContentStatus::Available).count(),
                    },
                }),
            )
            .for_work(transform.request_id, transform.id, Some(last.id)),
        )?;
        self.bus.publish(EventType::UpdateRequest, transform.request_id);
        info!(transform_id = transform.id, %status, "transform finished");
        Ok(())
    }

    fn propagate_cancel(&self, transform: &Transform) -> Result<()> {
        for processing in self.catalog.get_processings_by_transform(transform.id)? {
            if !processing.status.is_terminal() {
                self.catalog.update_processing(
                    processing.id,
                    ProcessingUpdate {
                        status: Some(ProcessingStatus::Cancel),
                        next_poll_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )?;
                self.bus.publish(EventType::UpdateProcessing, processing.id);
            }
        }
        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
                status: Some(TransformStatus::Cancelling),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn finish_cancel(&self, transform: &Transform) -> Result<()> {
        let processings = self.catalog.get_processings_by_transform(transform.id)?;
        if processings.iter().all(|p| p.status.is_terminal()) {
            self.catalog.update_transform(
                transform.id,
                TransformUpdate {
                    status: Some(TransformStatus::Cancelled),
                    ..Default::default()
                },
            )?;
            self.bus.publish(EventType::UpdateRequest, transform.request_id);
            return Ok(());
        }
        self.catalog.update_transform(
            transform.id,
            TransformUpdate {
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

    fn fail_transform(&self, transform_id: u64, errors: &str) -> Result<()> {
        warn!(transform_id, errors, "transform failed");
        self.catalog.update_transform(
            transform_id,
            TransformUpdate {
                status: Some(TransformStatus::Failed),
                errors: Some(errors.to_string()),
                ..Default::default()
            },
        )
    }
}

#[async_trait]
impl AgentHandler for Transformer {
    fn name(&self) -> &'static str {
        "transformer"
    }

    async fn run_cycle(&self) -> Result<usize> {
        // Change hints shortcut the poll delay for the named rows.
        for event_type in [EventType::NewTransform, EventType::UpdateTransform] {
            for event in self.bus.drain(event_type, self.options.bulk_size) {
                let _ = self.catalog.update_transform(
                    event.actual_id,
                    TransformUpdate {
                        next_poll_at: Some(Utc::now()),
                        ..Default::default()
                    },
                );
            }
        }

        let transforms = self.catalog.claim_transforms(
            &[
                TransformStatus::New,
                TransformStatus::Transforming,
                TransformStatus::ToCancel,
                TransformStatus::Cancelling,
            ],
            &self.owner,
            self.options,
        )?;
        let handled = transforms.len();
        for transform in transforms {
            if let Err(error) = self.handle_transform(&transform) {
                warn!(transform_id = transform.id, %error, "transform handling failed");
                self.fail_transform(transform.id, &error.to_string())?;
            }
        }
        Ok(handled)
    }
}
