use std::sync::Arc;

use clap::Parser;
use fleetwatch::{
    actors::CheckEngineHandle,
    alerts::AlertCoordinator,
    checks::{CheckEngine, CheckReport, TaskOutcome},
    config::{Config, read_config_file},
    dispatcher::CommandDispatcher,
    link::{AgentLink, NatsTransport},
    models::PendingActionReport,
    notify::WebhookNotifier,
    queue::WorkerPool,
    storage::MemoryStore,
};
use futures::StreamExt;
use tokio::spawn;
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleetwatch", LevelFilter::TRACE),
        ("fleetwatch_hub", LevelFilter::TRACE),
        ("audit", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    dotenv::dotenv().ok();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?.with_env_overrides();

    let store = Arc::new(MemoryStore::new());
    seed_store(&store, &config).await;

    let notifier = WebhookNotifier::shared(config.notifications.clone());
    let alerts = AlertCoordinator::new(
        store.clone(),
        notifier.clone(),
        config.notifications.policy(),
    );
    let engine = CheckEngineHandle::spawn(CheckEngine::new(store.clone(), alerts));
    for check in config.fleet.checks.clone() {
        if let Err(e) = engine.create_check(check).await {
            error!("skipping check from config: {e}");
        }
    }

    let transport =
        Arc::new(NatsTransport::connect(&config.nats.url, config.nats.inbox_prefix.clone()).await?);
    let link = AgentLink::connect(transport.clone(), config.link.grace()).await?;

    let (pool, receiver) = WorkerPool::new();
    let dispatcher = CommandDispatcher::new(link, store.clone(), Arc::new(pool), notifier);
    spawn(receiver.run(Arc::new(dispatcher.clone()), config.workers.concurrency));

    spawn(ping_fleet(dispatcher.clone(), config.clone()));

    let results = transport
        .client()
        .subscribe(config.nats.results_subject.clone())
        .await?;
    let tasks = transport
        .client()
        .subscribe(config.nats.task_results_subject.clone())
        .await?;
    let pending = transport
        .client()
        .subscribe(config.nats.pending_results_subject.clone())
        .await?;
    info!(
        "listening for results on {}, {} and {}",
        config.nats.results_subject,
        config.nats.task_results_subject,
        config.nats.pending_results_subject
    );

    tokio::select! {
        _ = ingest_results(results, engine.clone()) => warn!("result subscription ended"),
        _ = ingest_task_outcomes(tasks, engine.clone()) => warn!("task subscription ended"),
        _ = complete_pending_actions(pending, dispatcher) => warn!("pending subscription ended"),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    engine.shutdown().await;
    Ok(())
}

async fn seed_store(store: &MemoryStore, config: &Config) {
    for agent in config.fleet.agents.clone() {
        store.insert_agent(agent).await;
    }
    for script in config.fleet.scripts.clone() {
        store.insert_script(script).await;
    }
    for field in config.fleet.custom_fields.clone() {
        store.insert_custom_field(field).await;
    }
    debug!("seeded {} agents", config.fleet.agents.len());
}

#[instrument(skip_all)]
async fn ping_fleet(dispatcher: CommandDispatcher, config: Config) {
    for agent in &config.fleet.agents {
        match dispatcher.ping(&agent.agent_id).await {
            Ok(status) => info!("{} is {}", status.hostname, status.status),
            Err(e) => error!("{}: {e}", agent.agent_id),
        }
    }
}

#[instrument(skip_all)]
async fn ingest_results(mut results: async_nats::Subscriber, engine: CheckEngineHandle) {
    while let Some(message) = results.next().await {
        let report = match serde_json::from_slice::<CheckReport>(&message.payload) {
            Ok(report) => report,
            Err(e) => {
                warn!("undecodable check result: {e}");
                continue;
            }
        };

        if let Err(e) = engine.submit(report).await {
            error!("{e}");
            break;
        }
    }
}

#[instrument(skip_all)]
async fn ingest_task_outcomes(mut tasks: async_nats::Subscriber, engine: CheckEngineHandle) {
    while let Some(message) = tasks.next().await {
        let outcome = match serde_json::from_slice::<TaskOutcome>(&message.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("undecodable task outcome: {e}");
                continue;
            }
        };

        if let Err(e) = engine.submit_task(outcome).await {
            error!("{e}");
            break;
        }
    }
}

#[instrument(skip_all)]
async fn complete_pending_actions(
    mut reports: async_nats::Subscriber,
    dispatcher: CommandDispatcher,
) {
    while let Some(message) = reports.next().await {
        let report = match serde_json::from_slice::<PendingActionReport>(&message.payload) {
            Ok(report) => report,
            Err(e) => {
                warn!("undecodable pending action report: {e}");
                continue;
            }
        };

        if let Err(e) = dispatcher.complete_pending_action(report).await {
            warn!("{e}");
        }
    }
}
