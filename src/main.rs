use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use idds::agents::{Carrier, Clerk, Conductor, Transformer};
use idds::backend::{Backend, BackendRegistry, LocalBackend};
use idds::catalog::{Catalog, MemoryCatalog};
use idds::cli::{Cli, Command};
use idds::config::IddsConfig;
use idds::entities::{ContentStatus, ProcessingStatus, Request};
use idds::eventbus::EventBus;
use idds::health::overall_ok;
use idds::metadata::{WorkflowEnvelope, WorkflowSpec};
use idds::notifier::{LogNotifier, Notifier};
use idds::scheduler::{spawn_agent, spawn_janitor};

fn init_tracing(verbose: bool) {
    let default = if verbose { "idds=debug" } else { "idds=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = IddsConfig::load(cli.config.as_deref().map(Path::new))
        .context("loading configuration")?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Submit {
            file,
            scope,
            name,
            workload_id,
            priority,
            lifetime_days,
        } => submit(&file, &scope, &name, workload_id, priority, lifetime_days),
        Command::Status => status(),
        Command::Demo => demo(config).await,
    }
}

struct Service {
    catalog: Arc<MemoryCatalog>,
    join: JoinSet<()>,
    cancel: CancellationToken,
}

/// Wire the catalog, event bus, backends and all four agents.
fn start_service(config: &IddsConfig, backend_root: &Path) -> Service {
    let catalog = Arc::new(MemoryCatalog::new());
    let bus = Arc::new(EventBus::new());
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(LocalBackend::new(backend_root)) as Arc<dyn Backend>);
    let registry = Arc::new(registry);
    let notifier = Arc::new(LogNotifier) as Arc<dyn Notifier>;

    let cancel = CancellationToken::new();
    let mut join = JoinSet::new();
    let lock_ttl = config.retry.lock_ttl_secs;
    let heartbeat = config.heartbeat_interval_secs;
    let shared = Arc::clone(&catalog) as Arc<dyn Catalog>;

    spawn_agent(
        &mut join,
        Arc::new(Clerk::new(
            Arc::clone(&shared),
            Arc::clone(&bus),
            config.clerk.claim_options(lock_ttl),
            config.clerk.poll_period_secs,
        )),
        Arc::clone(&shared),
        config.clerk.schedule(heartbeat),
        cancel.clone(),
    );
    spawn_agent(
        &mut join,
        Arc::new(Transformer::new(
            Arc::clone(&shared),
            Arc::clone(&bus),
            config.transformer.claim_options(lock_ttl),
            config.transformer.poll_period_secs,
        )),
        Arc::clone(&shared),
        config.transformer.schedule(heartbeat),
        cancel.clone(),
    );
    spawn_agent(
        &mut join,
        Arc::new(Carrier::new(
            Arc::clone(&shared),
            Arc::clone(&bus),
            registry,
            config.carrier.claim_options(lock_ttl),
            config.carrier.poll_period_secs,
        )),
        Arc::clone(&shared),
        config.carrier.schedule(heartbeat),
        cancel.clone(),
    );
    spawn_agent(
        &mut join,
        Arc::new(Conductor::new(
            Arc::clone(&shared),
            notifier,
            config.retry.clone(),
            config.conductor.bulk_size,
        )),
        Arc::clone(&shared),
        config.conductor.schedule(heartbeat),
        cancel.clone(),
    );
    spawn_janitor(
        &mut join,
        Arc::clone(&shared),
        config.janitor.schedule(lock_ttl),
        cancel.clone(),
    );

    Service {
        catalog,
        join,
        cancel,
    }
}

async fn run(config: IddsConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.workdir).context("creating working directory")?;
    let workdir = config.workdir.clone();
    let mut service = start_service(&config, Path::new(&workdir));
    info!(%workdir, "idds started; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    service.cancel.cancel();
    while service.join.join_next().await.is_some() {}
    Ok(())
}

/// Validate a workflow file and print the request that would be queued.
fn submit(
    file: &str,
    scope: &str,
    name: &str,
    workload_id: Option<u64>,
    priority: i32,
    lifetime_days: i64,
) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    let value: serde_json::Value = serde_json::from_str(&contents).context("parsing workflow")?;

    // Accept either a bare workflow spec or a full envelope.
    let envelope = match WorkflowEnvelope::from_value(&value) {
        Ok(envelope) => envelope,
        Err(_) => {
            let spec: WorkflowSpec =
                serde_json::from_value(value).context("parsing workflow spec")?;
            WorkflowEnvelope::new(spec)
        }
    };

    let request = Request::new(scope, name, "cli", workload_id, envelope.to_value()?)
        .with_priority(priority)
        .with_lifetime(lifetime_days);
    println!("{}", serde_json::to_string_pretty(&request)?);
    println!(
        "workflow valid: {} work(s), kinds: {:?}",
        envelope.payload.works.len(),
        envelope
            .payload
            .works
            .iter()
            .map(|w| w.kind.name())
            .collect::<Vec<_>>()
    );
    Ok(())
}

fn status() -> anyhow::Result<()> {
    let catalog = MemoryCatalog::new();
    let counts = catalog.counts()?;
    println!("requests:           {}", counts.requests);
    println!("transforms:         {}", counts.transforms);
    println!("processings:        {}", counts.processings);
    println!("collections:        {}", counts.collections);
    println!("contents:           {}", counts.contents);
    println!("messages:           {}", counts.messages);
    println!("commands:           {}", counts.commands);
    println!("archived requests:  {}", counts.archived_requests);

    let heartbeats = catalog.get_heartbeats()?;
    println!("agents alive:       {}", heartbeats.len());
    for record in &heartbeats {
        println!(
            "  {} workers={} hung={} last={}",
            record.key(),
            record.num_active_workers,
            record.num_hang_workers,
            record.last_heartbeat
        );
    }
    println!(
        "overall:            {}",
        if overall_ok(&heartbeats, 600) { "ok" } else { "not ok" }
    );
    Ok(())
}

/// Drive one built-in stage-in workflow through the full lifecycle against
/// the local backend, acting as the external executor ourselves.
async fn demo(mut config: IddsConfig) -> anyhow::Result<()> {
    // Tight loops so the demo finishes in a few seconds.
    for agent in [
        &mut config.clerk,
        &mut config.transformer,
        &mut config.carrier,
        &mut config.conductor,
    ] {
        agent.poll_interval_secs = 1;
        agent.poll_period_secs = 1;
        agent.jitter_secs = 0;
    }

    let workdir = std::env::temp_dir().join(format!("idds-demo-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&workdir).context("creating demo workdir")?;
    let executor_backend = LocalBackend::new(&workdir);
    let mut service = start_service(&config, &workdir);

    let workflow: WorkflowSpec = serde_json::from_value(serde_json::json!({
        "works": [{
            "name": "stage demo dataset",
            "kind": "StageIn",
            "backend": "local",
            "scope": "demo",
            "input_dataset": "demo.dataset",
            "files": [
                {"scope": "demo", "name": "file1"},
                {"scope": "demo", "name": "file2"}
            ]
        }]
    }))?;
    let request_id = service.catalog.add_request(Request::new(
        "demo",
        "demo-request",
        "demo",
        Some(1),
        WorkflowEnvelope::new(workflow).to_value()?,
    ))?;
    info!(request_id, "demo request queued");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let mut completed = false;
    loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("demo timed out");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Play the external system: finish any submission the carrier made.
        if !completed {
            for transform in service.catalog.get_transforms_by_request(request_id)? {
                for processing in service.catalog.get_processings_by_transform(transform.id)? {
                    if processing.status == ProcessingStatus::Submitted
                        || processing.status == ProcessingStatus::Running
                    {
                        let external_id = processing.submitted_id.clone().unwrap_or_default();
                        let mut files = HashMap::new();
                        files.insert("demo:file1".to_string(), ContentStatus::Available);
                        files.insert("demo:file2".to_string(), ContentStatus::Available);
                        executor_backend
                            .complete(&external_id, files, serde_json::json!({"result": 42}))
                            .await?;
                        info!(%external_id, "demo executor completed the submission");
                        completed = true;
                    }
                }
            }
        }

        let request = service.catalog.get_request(request_id)?;
        if request.status.is_terminal() {
            info!(request_id, status = %request.status, "demo finished");
            println!("request {request_id} ended as {}", request.status);
            for transform in service.catalog.get_transforms_by_request(request_id)? {
                println!("  transform {} -> {}", transform.id, transform.status);
                for processing in service.catalog.get_processings_by_transform(transform.id)? {
                    println!(
                        "    processing {} -> {} output={}",
                        processing.id,
                        processing.status,
                        processing
                            .output_metadata
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "none".into())
                    );
                }
            }
            break;
        }
    }

    service.cancel.cancel();
    while service.join.join_next().await.is_some() {}
    let _ = std::fs::remove_dir_all(&workdir);
    Ok(())
}
