//! Clerk: the request-level agent.
//!
//! Decomposes a new request's workflow envelope into transforms, aggregates
//! terminal transform statuses back into the request outcome, and executes
//! operator commands (abort, resume, processing overrides).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{Catalog, ClaimOptions, RequestUpdate, TransformUpdate};
use crate::entities::{
    Command, CommandKind, CommandStatus, Message, MessageDestination, ProcessingStatus, Request,
    RequestStatus, Transform, TransformStatus, rollup_transforms,
};
use crate::error::Result;
use crate::eventbus::{EventBus, EventType};
use crate::lease::LockOwner;
use crate::metadata::{TransformMeta, WorkflowEnvelope};
use crate::scheduler::AgentHandler;

/// Default lifetime granted by the Extend command.
const EXTEND_DAYS: i64 = 30;

pub struct Clerk {
    catalog: Arc<dyn Catalog>,
    bus: Arc<EventBus>,
    owner: LockOwner,
    options: ClaimOptions,
    /// Reschedule delay between polls of the same request.
    poll_period_secs: i64,
}

impl Clerk {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        bus: Arc<EventBus>,
        options: ClaimOptions,
        poll_period_secs: i64,
    ) -> Self {
        Self {
            catalog,
            bus,
            owner: LockOwner::current("clerk"),
            options,
            poll_period_secs,
        }
    }

    fn reschedule(&self) -> chrono::DateTime<Utc> {
        Utc::now() + Duration::seconds(self.poll_period_secs)
    }

    fn handle_request(&self, request: &Request) -> Result<()> {
        match request.status {
            RequestStatus::New | RequestStatus::ReQueue | RequestStatus::Extend => {
                self.generate_transforms(request)
            }
            RequestStatus::Transforming => self.aggregate(request),
            RequestStatus::ToCancel => self.propagate_cancel(request),
            RequestStatus::Cancelling => self.finish_cancel(request),
            RequestStatus::ToSuspend | RequestStatus::Suspending => self.suspend(request),
            RequestStatus::ToResume => self.resume(request),
            _ => self.catalog.update_request(
                request.id,
                RequestUpdate {
                    next_poll_at: Some(self.reschedule()),
                    unlock: true,
                    ..Default::default()
                },
            ),
        }
    }

    /// New request: parse the workflow envelope and create one transform per
    /// work. Re-queued requests re-open their failed transforms instead of
    /// creating duplicates.
    fn generate_transforms(&self, request: &Request) -> Result<()> {
        if request.is_expired() {
            return self.fail_request(request.id, "request expired before transforming");
        }

        let existing = self.catalog.get_transforms_by_request(request.id)?;
        if existing.is_empty() {
            let envelope = match WorkflowEnvelope::from_value(&request.request_metadata) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(request_id = request.id, %error, "unparseable workflow envelope");
                    return self.fail_request(request.id, &format!("bad workflow: {error}"));
                }
            };
            if envelope.payload.works.is_empty() {
                return self.fail_request(request.id, "workflow contains no works");
            }
            for work in envelope.payload.works {
                let kind = work.kind;
                let meta = TransformMeta::new(work);
                let transform_id = self.catalog.add_transform(Transform::new(
                    request.id,
                    kind,
                    meta.to_value()?,
                ))?;
                self.bus.publish(EventType::NewTransform, transform_id);
                info!(request_id = request.id, transform_id, "transform created");
            }
        } else {
            // Re-queue path: push failed transforms back to New.
            for transform in existing {
                if transform.status == TransformStatus::Failed {
                    self.catalog.update_transform(
                        transform.id,
                        TransformUpdate {
                            status: Some(TransformStatus::New),
                            via_command: true,
                            ..Default::default()
                        },
                    )?;
                    self.bus.publish(EventType::UpdateTransform, transform.id);
                }
            }
        }

        self.catalog.update_request(
            request.id,
            RequestUpdate {
                status: Some(RequestStatus::Transforming),
                next_poll_at: Some(self.reschedule()),
                expired_at: (request.status == RequestStatus::Extend)
                    .then(|| Utc::now() + Duration::days(EXTEND_DAYS)),
                via_command: request.status != RequestStatus::New,
                unlock: true,
                ..Default::default()
            },
        )
    }

    /// Running request: once every transform is terminal, roll their statuses
    /// up into the request outcome and emit the request-level notification.
    fn aggregate(&self, request: &Request) -> Result<()> {
        let transforms = self.catalog.get_transforms_by_request(request.id)?;
        if transforms.is_empty() {
            return self.fail_request(request.id, "request has no transforms");
        }

        if transforms.iter().all(|t| t.status.is_terminal()) {
            let status: RequestStatus =
                rollup_transforms(transforms.iter().map(|t| t.status)).into();
            self.catalog.update_request(
                request.id,
                RequestUpdate {
                    status: Some(status),
                    next_poll_at: Some(self.reschedule()),
                    ..Default::default()
                },
            )?;
            let transform_statuses: Vec<serde_json::Value> = transforms
                .iter()
                .map(|t| json!({"transform_id": t.id, "status": t.status.to_string()}))
                .collect();
            self.catalog.add_message(
                Message::new(
                    "request_status",
                    MessageDestination::Outside,
                    json!({
                        "request_id": request.id,
                        "workload_id": request.workload_id,
                        "status": status.to_string(),
                        "transforms": transform_statuses,
                    }),
                )
                .for_work(request.id, 0, None),
            )?;
            info!(request_id = request.id, %status, "request finished");
            return Ok(());
        }

        if request.is_expired() {
            // Stop waiting: cancel what is still running, fail the request.
            for transform in &transforms {
                if !transform.status.is_terminal() {
                    self.catalog.update_transform(
                        transform.id,
                        TransformUpdate {
                            status: Some(TransformStatus::ToCancel),
                            ..Default::default()
                        },
                    )?;
                }
            }
            return self.fail_request(request.id, "request expired while transforming");
        }

        self.catalog.update_request(
            request.id,
            RequestUpdate {
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn propagate_cancel(&self, request: &Request) -> Result<()> {
        for transform in self.catalog.get_transforms_by_request(request.id)? {
            if !transform.status.is_terminal() {
                self.catalog.update_transform(
                    transform.id,
                    TransformUpdate {
                        status: Some(TransformStatus::ToCancel),
                        ..Default::default()
                    },
                )?;
                self.bus.publish(EventType::UpdateTransform, transform.id);
            }
        }
        self.catalog.update_request(
            request.id,
            RequestUpdate {
                status: Some(RequestStatus::Cancelling),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn finish_cancel(&self, request: &Request) -> Result<()> {
        let transforms = self.catalog.get_transforms_by_request(request.id)?;
        if transforms.iter().all(|t| t.status.is_terminal()) {
            return self.catalog.update_request(
                request.id,
                RequestUpdate {
                    status: Some(RequestStatus::Cancelled),
                    ..Default::default()
                },
            );
        }
        self.catalog.update_request(
            request.id,
            RequestUpdate {
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn suspend(&self, request: &Request) -> Result<()> {
        for transform in self.catalog.get_transforms_by_request(request.id)? {
            if !transform.status.is_terminal() && transform.status != TransformStatus::Suspended {
                self.catalog.update_transform(
                    transform.id,
                    TransformUpdate {
                        status: Some(TransformStatus::Suspended),
                        ..Default::default()
                    },
                )?;
            }
        }
        self.catalog.update_request(
            request.id,
            RequestUpdate {
                status: Some(RequestStatus::Suspended),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn resume(&self, request: &Request) -> Result<()> {
        for transform in self.catalog.get_transforms_by_request(request.id)? {
            if transform.status == TransformStatus::Suspended {
                self.catalog.update_transform(
                    transform.id,
                    TransformUpdate {
                        status: Some(TransformStatus::Transforming),
                        ..Default::default()
                    },
                )?;
                self.bus.publish(EventType::UpdateTransform, transform.id);
            }
        }
        self.catalog.update_request(
            request.id,
            RequestUpdate {
                status: Some(RequestStatus::Transforming),
                next_poll_at: Some(self.reschedule()),
                unlock: true,
                ..Default::default()
            },
        )
    }

    fn fail_request(&self, request_id: u64, errors: &str) -> Result<()> {
        warn!(request_id, errors, "request failed");
        self.catalog.update_request(
            request_id,
            RequestUpdate {
                status: Some(RequestStatus::Failed),
                errors: Some(errors.to_string()),
                ..Default::default()
            },
        )
    }

    /// Execute pending operator commands. Commands bypass the bottom-up
    /// aggregation through the catalog's `via_command` path.
    fn process_commands(&self) -> Result<usize> {
        let commands = self.catalog.claim_commands(self.options.bulk_size)?;
        let handled = commands.len();
        for command in commands {
            let outcome = self.execute_command(&command);
            match outcome {
                Ok(()) => {
                    self.catalog
                        .update_command(command.id, CommandStatus::Processed, None)?;
                }
                Err(error) => {
                    warn!(command_id = command.id, %error, "command failed");
                    self.catalog.update_command(
                        command.id,
                        CommandStatus::Failed,
                        Some(error.to_string()),
                    )?;
                }
            }
        }
        Ok(handled)
    }

    fn execute_command(&self, command: &Command) -> Result<()> {
        match command.cmd_type {
            CommandKind::AbortRequest => {
                let request = self.catalog.get_request(command.request_id)?;
                if request.status.is_terminal() {
                    // Nothing left to abort.
                    return Ok(());
                }
                self.catalog.update_request(
                    command.request_id,
                    RequestUpdate {
                        status: Some(RequestStatus::ToCancel),
                        next_poll_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
            }
            CommandKind::ResumeRequest => self.catalog.update_request(
                command.request_id,
                RequestUpdate {
                    status: Some(RequestStatus::ReQueue),
                    next_poll_at: Some(Utc::now()),
                    via_command: true,
                    ..Default::default()
                },
            ),
            CommandKind::UpdateProcessing => {
                let processing_id = command.processing_id.ok_or_else(|| {
                    crate::error::Error::Config("UpdateProcessing command without processing_id".into())
                })?;
                let status: ProcessingStatus =
                    serde_json::from_value(command.payload["status"].clone())?;
                self.catalog.update_processing(
                    processing_id,
                    crate::catalog::ProcessingUpdate {
                        status: Some(status),
                        via_command: true,
                        ..Default::default()
                    },
                )?;
                self.bus.publish(EventType::UpdateProcessing, processing_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AgentHandler for Clerk {
    fn name(&self) -> &'static str {
        "clerk"
    }

    async fn run_cycle(&self) -> Result<usize> {
        // Change hints shortcut the poll delay for the named requests.
        for event in self
            .bus
            .drain(EventType::UpdateRequest, self.options.bulk_size)
        {
            let _ = self.catalog.update_request(
                event.actual_id,
                RequestUpdate {
                    next_poll_at: Some(Utc::now()),
                    ..Default::default()
                },
            );
        }

        let mut handled = self.process_commands()?;

        let requests = self.catalog.claim_requests(
            &[
                RequestStatus::New,
                RequestStatus::ReQueue,
                RequestStatus::Extend,
                RequestStatus::Transforming,
                RequestStatus::ToCancel,
                RequestStatus::Cancelling,
                RequestStatus::ToSuspend,
                RequestStatus::Suspending,
                RequestStatus::ToResume,
            ],
            &self.owner,
            self.options,
        )?;
        handled += requests.len();
        for request in requests {
            if let Err(error) = self.handle_request(&request) {
                warn!(request_id = request.id, %error, "request handling failed");
                self.fail_request(request.id, &error.to_string())?;
            }
        }
        Ok(handled)
    }
}
