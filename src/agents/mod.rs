//! The four agents that drive the state machine: clerk (requests),
//! transformer (transforms), carrier (processings, the only agent touching
//! external systems) and conductor (outbound messages).

pub mod carrier;
pub mod clerk;
pub mod conductor;
pub mod transformer;

pub use carrier::Carrier;
pub use clerk::Clerk;
pub use conductor::Conductor;
pub use transformer::Transformer;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::backend::{Backend, BackendRegistry, LocalBackend, SubmitContext};
    use crate::catalog::{Catalog, ClaimOptions, MemoryCatalog, MessageUpdate, ProcessingUpdate};
    use crate::entities::{
        Command, CommandKind, ContentStatus, MessageStatus, ProcessingStatus, Request,
        RequestStatus, TransformStatus,
    };
    use crate::eventbus::EventBus;
    use crate::metadata::{FileSpec, WorkKind, WorkSpec, WorkflowEnvelope, WorkflowSpec};
    use crate::notifier::testing::FlakyNotifier;
    use crate::retry::RetryPolicy;
    use crate::scheduler::AgentHandler;

    struct Harness {
        catalog: Arc<MemoryCatalog>,
        backend: Arc<LocalBackend>,
        clerk: Clerk,
        transformer: Transformer,
        carrier: Carrier,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::new());
        let bus = Arc::new(EventBus::new());
        let backend = Arc::new(LocalBackend::new(dir.path()));
        let mut registry = BackendRegistry::new();
        registry.register(Arc::clone(&backend) as Arc<dyn crate::backend::Backend>);
        let registry = Arc::new(registry);
        // Zero poll period so every cycle sees every due row immediately.
        let options = ClaimOptions::default();
        Harness {
            clerk: Clerk::new(
                Arc::clone(&catalog) as Arc<dyn Catalog>,
                Arc::clone(&bus),
                options,
                0,
            ),
            transformer: Transformer::new(
                Arc::clone(&catalog) as Arc<dyn Catalog>,
                Arc::clone(&bus),
                options,
                0,
            ),
            carrier: Carrier::new(
                Arc::clone(&catalog) as Arc<dyn Catalog>,
                Arc::clone(&bus),
                registry,
                options,
                0,
            ),
            catalog,
            backend,
            _dir: dir,
        }
    }

    fn stagein_work(files: &[&str]) -> WorkSpec {
        WorkSpec {
            name: "stage dataset".into(),
            kind: WorkKind::StageIn,
            backend: "local".into(),
            scope: "user.test".into(),
            input_dataset: "user.test.dataset1".into(),
            files: files
                .iter()
                .map(|name| FileSpec {
                    scope: "user.test".into(),
                    name: (*name).into(),
                    min_id: None,
                    max_id: None,
                })
                .collect(),
            command: None,
            max_waiting_time: None,
            max_chained_processings: None,
        }
    }

    fn submit_request(catalog: &MemoryCatalog, works: Vec<WorkSpec>) -> u64 {
        let envelope = WorkflowEnvelope::new(WorkflowSpec { works });
        catalog
            .add_request(Request::new(
                "user.test",
                "req1",
                "panda",
                Some(1234),
                envelope.to_value().unwrap(),
            ))
            .unwrap()
    }

    async fn run_all(h: &Harness, rounds: usize) {
        for _ in 0..rounds {
            h.clerk.run_cycle().await.unwrap();
            h.transformer.run_cycle().await.unwrap();
            h.carrier.run_cycle().await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_lifecycle_success() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1", "f2"])]);

        // Clerk decomposes, transformer materializes, carrier submits.
        run_all(&h, 3).await;

        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        assert_eq!(transforms.len(), 1);
        assert_eq!(transforms[0].status, TransformStatus::Transforming);
        let processings = h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap();
        assert_eq!(processings.len(), 1);
        let processing = &processings[0];
        let external_id = processing.submitted_id.clone().unwrap();
        assert_eq!(external_id, processing.submission_tag());

        // The external system finishes with all files staged and an output.
        let mut files = HashMap::new();
        files.insert("user.test:f1".to_string(), ContentStatus::Available);
        files.insert("user.test:f2".to_string(), ContentStatus::Available);
        h.backend
            .complete(&external_id, files, json!({"result": 42}))
            .await
            .unwrap();

        run_all(&h, 3).await;

        let processing = h.catalog.get_processing(processing.id).unwrap();
        assert_eq!(processing.status, ProcessingStatus::Finished);
        assert_eq!(processing.output_metadata, Some(json!({"result": 42})));
        assert!(processing.finished_at.is_some());

        let transform = h.catalog.get_transform(transforms[0].id).unwrap();
        assert_eq!(transform.status, TransformStatus::Finished);

        let request = h.catalog.get_request(request_id).unwrap();
        assert_eq!(request.status, RequestStatus::Finished);

        // Work-level and request-level messages were queued for the outside.
        let counts = h.catalog.counts().unwrap();
        assert!(counts.messages >= 2);
    }

    #[tokio::test]
    async fn full_lifecycle_failure() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1"])]);

        run_all(&h, 3).await;

        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        let processing = &h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap()[0];
        let external_id = processing.submitted_id.clone().unwrap();

        let mut files = HashMap::new();
        files.insert("user.test:f1".to_string(), ContentStatus::Failed);
        h.backend.fail(&external_id, files).await.unwrap();

        run_all(&h, 3).await;

        assert_eq!(
            h.catalog.get_processing(processing.id).unwrap().status,
            ProcessingStatus::Failed
        );
        assert_eq!(
            h.catalog.get_transform(transforms[0].id).unwrap().status,
            TransformStatus::Failed
        );
        assert_eq!(
            h.catalog.get_request(request_id).unwrap().status,
            RequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn partial_results_roll_up_subfinished() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1", "f2"])]);
        run_all(&h, 3).await;

        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        let processing = &h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap()[0];
        let external_id = processing.submitted_id.clone().unwrap();

        let mut files = HashMap::new();
        files.insert("user.test:f1".to_string(), ContentStatus::Available);
        files.insert("user.test:f2".to_string(), ContentStatus::Failed);
        h.backend
            .complete(&external_id, files, json!({"result": "partial"}))
            .await
            .unwrap();

        run_all(&h, 3).await;

        assert_eq!(
            h.catalog.get_processing(processing.id).unwrap().status,
            ProcessingStatus::SubFinished
        );
        assert_eq!(
            h.catalog.get_transform(transforms[0].id).unwrap().status,
            TransformStatus::SubFinished
        );
        assert_eq!(
            h.catalog.get_request(request_id).unwrap().status,
            RequestStatus::SubFinished
        );
    }

    #[tokio::test]
    async fn iterative_work_chains_follow_on_processing() {
        let h = harness();
        let mut work = stagein_work(&[]);
        work.kind = WorkKind::ActiveLearning;
        work.max_chained_processings = Some(1);
        let request_id = submit_request(&h.catalog, vec![work]);

        run_all(&h, 3).await;
        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        let first = &h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap()[0];
        let first_external = first.submitted_id.clone().unwrap();

        // First iteration asks for another round.
        h.backend
            .complete(
                &first_external,
                HashMap::new(),
                json!({"continue": true, "loss": 0.8}),
            )
            .await
            .unwrap();
        run_all(&h, 3).await;

        assert_eq!(
            h.catalog.get_processing(first.id).unwrap().status,
            ProcessingStatus::FinishedOnExec
        );
        let processings = h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap();
        assert_eq!(processings.len(), 2, "follow-on processing was chained");
        let second = processings.iter().find(|p| p.id != first.id).unwrap();

        run_all(&h, 2).await;
        let second = h.catalog.get_processing(second.id).unwrap();
        let second_external = second.submitted_id.clone().unwrap();
        h.backend
            .complete(
                &second_external,
                HashMap::new(),
                json!({"continue": true, "loss": 0.1}),
            )
            .await
            .unwrap();
        run_all(&h, 3).await;

        // Budget of one chain is spent; another "continue" does not chain.
        let processings = h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap();
        assert_eq!(processings.len(), 2);
        assert_eq!(
            h.catalog.get_transform(transforms[0].id).unwrap().status,
            TransformStatus::Finished
        );
        assert_eq!(
            h.catalog.get_request(request_id).unwrap().status,
            RequestStatus::Finished
        );
    }

    #[tokio::test]
    async fn reclaimed_submitting_processing_adopts_prior_submission() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1"])]);
        h.clerk.run_cycle().await.unwrap();
        h.transformer.run_cycle().await.unwrap();

        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        let processing = &h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap()[0];
        assert_eq!(processing.status, ProcessingStatus::New);

        // A previous holder committed Submitting, made the external call,
        // then died before recording the external id.
        let tag = processing.submission_tag();
        h.backend
            .submit(&SubmitContext {
                tag: tag.clone(),
                scope: "user.test".into(),
                input_dataset: "user.test.dataset1".into(),
                files: vec![],
                command: Some("original.sh".into()),
            })
            .await
            .unwrap();
        h.catalog
            .update_processing(
                processing.id,
                ProcessingUpdate {
                    status: Some(ProcessingStatus::Submitting),
                    unlock: true,
                    ..Default::default()
                },
            )
            .unwrap();

        h.carrier.run_cycle().await.unwrap();

        let recovered = h.catalog.get_processing(processing.id).unwrap();
        assert_eq!(recovered.status, ProcessingStatus::Submitted);
        assert_eq!(recovered.submitted_id, Some(tag.clone()));

        // The job record from the first call is untouched; a second submit
        // would have rewritten it with the work's own (missing) command.
        let job = std::fs::read_to_string(h._dir.path().join(&tag).join("job.json")).unwrap();
        assert!(job.contains("original.sh"), "prior submission was adopted, not repeated");
    }

    #[tokio::test]
    async fn abort_command_cancels_the_whole_tree() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1"])]);
        run_all(&h, 3).await;

        h.catalog
            .add_command(Command::new(
                CommandKind::AbortRequest,
                request_id,
                serde_json::Value::Null,
            ))
            .unwrap();

        run_all(&h, 4).await;

        let request = h.catalog.get_request(request_id).unwrap();
        assert_eq!(request.status, RequestStatus::Cancelled);
        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        assert_eq!(transforms[0].status, TransformStatus::Cancelled);
        let processings = h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap();
        assert_eq!(processings[0].status, ProcessingStatus::Cancelled);
    }

    #[tokio::test]
    async fn malformed_envelope_fails_the_request() {
        let h = harness();
        let request_id = h
            .catalog
            .add_request(Request::new(
                "user.test",
                "bad",
                "panda",
                None,
                json!({"kind": "pickle", "version": 1}),
            ))
            .unwrap();

        h.clerk.run_cycle().await.unwrap();

        let request = h.catalog.get_request(request_id).unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert!(request.errors.as_deref().unwrap_or("").contains("workflow"));
    }

    #[tokio::test]
    async fn conductor_replays_failed_deliveries() {
        let h = harness();
        let catalog = Arc::clone(&h.catalog) as Arc<dyn Catalog>;
        let notifier = Arc::new(FlakyNotifier::failing(1));
        let conductor = Conductor::new(
            Arc::clone(&catalog),
            Arc::clone(&notifier) as Arc<dyn crate::notifier::Notifier>,
            RetryPolicy::default(),
            10,
        );

        let msg_id = h
            .catalog
            .add_message(crate::entities::Message::new(
                "work_stagein",
                crate::entities::MessageDestination::Outside,
                json!({"hello": "world"}),
            ))
            .unwrap();

        // First cycle: delivery fails, message stays unconfirmed.
        conductor.run_cycle().await.unwrap();
        assert_eq!(notifier.attempts(), 1);
        let msg = h.catalog.get_message(msg_id).unwrap();
        assert_eq!(msg.status, MessageStatus::Fetched);
        assert_eq!(msg.retries, 1);

        // Force the retry delay to elapse, then replay succeeds.
        h.catalog
            .update_message(
                msg_id,
                MessageUpdate {
                    next_retry_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        conductor.run_cycle().await.unwrap();
        assert_eq!(notifier.attempts(), 2);
        let msg = h.catalog.get_message(msg_id).unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(
            notifier.delivered.lock().unwrap().as_slice(),
            &[msg_id]
        );

        // Confirmation stops further replays.
        conductor.confirm(msg_id).unwrap();
        h.catalog
            .update_message(
                msg_id,
                MessageUpdate {
                    next_retry_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        conductor.run_cycle().await.unwrap();
        assert_eq!(notifier.attempts(), 2);
    }

    #[tokio::test]
    async fn resume_command_requeues_a_failed_request() {
        let h = harness();
        let request_id = submit_request(&h.catalog, vec![stagein_work(&["f1"])]);
        run_all(&h, 3).await;

        let transforms = h.catalog.get_transforms_by_request(request_id).unwrap();
        let processing = &h
            .catalog
            .get_processings_by_transform(transforms[0].id)
            .unwrap()[0];
        let external_id = processing.submitted_id.clone().unwrap();
        let mut files = HashMap::new();
        files.insert("user.test:f1".to_string(), ContentStatus::Failed);
        h.backend.fail(&external_id, files).await.unwrap();
        run_all(&h, 3).await;
        assert_eq!(
            h.catalog.get_request(request_id).unwrap().status,
            RequestStatus::Failed
        );

        h.catalog
            .add_command(Command::new(
                CommandKind::ResumeRequest,
                request_id,
                serde_json::Value::Null,
            ))
            .unwrap();
        run_all(&h, 2).await;

        // The request is transforming again and the failed transform was
        // re-opened; a fresh processing cannot be created while the failed
        // one's collection state says otherwise, so just check the re-open.
        let request = h.catalog.get_request(request_id).unwrap();
        assert_eq!(request.status, RequestStatus::Transforming);
        let transform = h.catalog.get_transform(transforms[0].id).unwrap();
        assert_ne!(transform.status, TransformStatus::Failed);
    }
}
