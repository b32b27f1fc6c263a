//! Control-plane daemon entrypoint: parses CLI flags, loads
//! [`config::MeridianConfig`], builds the backend registry and the store,
//! registers the four reconciler loops with a
//! [`meridian_runtime::dispatcher::Dispatcher`] and runs it until signalled
//! to stop. Mirrors the teacher's `kubectl`-adjacent controller binaries:
//! a thin `clap` front door over a library crate that does the real work.

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::MeridianConfig;
use meridian_backends::cache::OfferCache;
use meridian_backends::{backends, ComputeBackend, FederatedBackend, LocalBackend};
use meridian_core::entities::backend::BackendKind;
use meridian_core::entities::fleet::Fleet;
use meridian_core::entities::instance::Instance;
use meridian_core::entities::job::Job;
use meridian_core::entities::run::Run;
use meridian_core::{Error as CoreError, SystemClock};
use meridian_runtime::dispatcher::{Dispatcher, Handler, TaskSchedule};
use meridian_runtime::healthcheck::HealthCheck;
use meridian_runtime::reconcilers::{fleet as fleet_reconciler, instance as instance_reconciler, job as job_reconciler, run as run_reconciler};
use meridian_runtime::{ReconcileContext, ReconcileError};
use meridian_store::{EntityStore, SqlStore};
use tokio_util::sync::CancellationToken;

/// Multi-cloud workload orchestrator control plane.
#[derive(Debug, Parser)]
#[command(name = "meridian", version, about)]
struct Cli {
    /// Path to a TOML config file. Falls back to defaults plus
    /// `MERIDIAN_DATABASE_URL` when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single pass over every schedule, then exit, instead of looping
    /// forever. Useful for cron-driven deployments and smoke tests.
    #[arg(long)]
    once: bool,

    /// Load and validate configuration (including connecting the store and
    /// constructing the backend registry), print a summary, and exit
    /// without registering or running any reconciler.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = MeridianConfig::load(cli.config.as_deref())?;
    tracing::info!(node_id = %config.node_id, worker_cap = config.worker_cap, "loaded configuration");

    let backends = build_backends(&config)?;
    tracing::info!(backends = backends.len(), "backend registry ready");

    if cli.dry_run {
        tracing::info!("dry run: configuration and backend registry are valid, not connecting to the store");
        return Ok(());
    }

    let store = Arc::new(SqlStore::connect(&config.store_dsn, config.node_id.clone()).await?);
    tracing::info!("store connected");

    let context = ReconcileContext {
        clock: Arc::new(SystemClock),
        backends: Arc::new(backends),
        healthcheck: build_healthcheck(&config),
        offer_cache: Arc::new(OfferCache::new()),
    };

    let mut dispatcher = Dispatcher::new(context.clock.clone(), context.clone(), config.worker_cap);
    dispatcher.register(instance_schedule(&config, store.clone()));
    dispatcher.register(job_schedule(&config, store.clone(), store.clone()));
    dispatcher.register(run_schedule(&config, store.clone(), store.clone()));
    dispatcher.register(fleet_schedule(&config, store.clone(), store.clone(), store.clone()));

    let shutdown = CancellationToken::new();
    if cli.once {
        let longest = [
            config.instance_schedule.interval(),
            config.job_schedule.interval(),
            config.run_schedule.interval(),
            config.fleet_schedule.interval(),
        ]
        .into_iter()
        .max()
        .unwrap_or(Duration::from_secs(5));
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(longest + Duration::from_secs(1)).await;
            shutdown.cancel();
        });
    } else {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_termination().await;
            tracing::info!("shutdown signal received, draining in-flight reconciles");
            shutdown.cancel();
        });
    }

    dispatcher.run(shutdown).await;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = interrupt.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

fn build_healthcheck(config: &MeridianConfig) -> Arc<dyn HealthCheck> {
    Arc::new(meridian_runtime::healthcheck::ShimHealthCheck::new(
        config.healthcheck.port,
        config.healthcheck.path.clone(),
        Duration::from_secs(config.healthcheck.timeout_secs),
    ))
}

/// One constructor call per configured [`BackendKind`] (spec.md §9's
/// `BackendKind -> factory(config, credentials)`); `local` is always present
/// even when unconfigured since SSH-attached fleets need it regardless of
/// which clouds the deployment also reaches.
fn build_backends(config: &MeridianConfig) -> anyhow::Result<HashMap<BackendKind, Arc<dyn ComputeBackend>>> {
    let client = reqwest::Client::builder()
        .timeout(meridian_core::defaults::CALL_DEADLINE)
        .build()?;
    let mut registry: HashMap<BackendKind, Arc<dyn ComputeBackend>> = HashMap::new();

    for (&kind, cfg) in &config.backends {
        let backend: Arc<dyn ComputeBackend> = match kind {
            BackendKind::Aws => Arc::new(backends::aws(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::Azure => Arc::new(backends::azure(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::Gcp => Arc::new(backends::gcp(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::DataCrunch => Arc::new(backends::datacrunch(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::Lambda => Arc::new(backends::lambda(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::Nebius => Arc::new(backends::nebius(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::TensorDock => Arc::new(backends::tensordock(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::VastAi => Arc::new(backends::vastai(client.clone(), cfg.base_url.clone(), cfg.region.clone())),
            BackendKind::Local => Arc::new(LocalBackend::new()),
            BackendKind::Federated => {
                let token = cfg
                    .bearer_token
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("backend.federated.bearer_token is required"))?;
                Arc::new(FederatedBackend::new(client.clone(), cfg.base_url.clone(), token))
            }
        };
        registry.insert(kind, backend);
    }

    registry.entry(BackendKind::Local).or_insert_with(|| Arc::new(LocalBackend::new()) as Arc<dyn ComputeBackend>);
    Ok(registry)
}

fn instance_schedule(config: &MeridianConfig, store: Arc<SqlStore>) -> TaskSchedule<Instance> {
    let handler: Handler<Instance> = Arc::new(move |mut instance: Instance, ctx: ReconcileContext| {
        Box::pin(async move {
            instance_reconciler::reconcile(&mut instance, &ctx).await?;
            Ok(instance)
        })
    });
    TaskSchedule {
        name: "instance",
        interval: config.instance_schedule.interval(),
        batch_size: config.instance_schedule.batch_size,
        store,
        handler,
    }
}

fn job_schedule(config: &MeridianConfig, job_store: Arc<SqlStore>, run_store: Arc<SqlStore>) -> TaskSchedule<Job> {
    let instance_store: Arc<dyn EntityStore<Instance>> = job_store.clone();
    let run_store: Arc<dyn EntityStore<Run>> = run_store;

    let handler: Handler<Job> = Arc::new(move |mut job: Job, ctx: ReconcileContext| {
        let instance_store = instance_store.clone();
        let run_store = run_store.clone();
        Box::pin(async move {
            let run = run_store
                .load_by_id(job.run_id)
                .await?
                .ok_or_else(|| ReconcileError::Core(CoreError::Configuration(format!("job {} references a missing run", job.id))))?;
            let deps = job_reconciler::JobDeps { instance_store, run };
            job_reconciler::reconcile(&mut job, &ctx, &deps).await?;
            Ok(job)
        })
    });

    TaskSchedule {
        name: "job",
        interval: config.job_schedule.interval(),
        batch_size: config.job_schedule.batch_size,
        store: job_store,
        handler,
    }
}

fn run_schedule(config: &MeridianConfig, run_store: Arc<SqlStore>, instance_store: Arc<SqlStore>) -> TaskSchedule<Run> {
    let job_store: Arc<dyn EntityStore<Job>> = run_store.clone();
    let instance_store: Arc<dyn EntityStore<Instance>> = instance_store;

    let handler: Handler<Run> = Arc::new(move |mut run: Run, ctx: ReconcileContext| {
        let deps = run_reconciler::RunDeps {
            job_store: job_store.clone(),
            instance_store: instance_store.clone(),
        };
        Box::pin(async move {
            run_reconciler::reconcile(&mut run, ctx.clock.now(), &deps).await?;
            Ok(run)
        })
    });

    TaskSchedule {
        name: "run",
        interval: config.run_schedule.interval(),
        batch_size: config.run_schedule.batch_size,
        store: run_store,
        handler,
    }
}

fn fleet_schedule(
    config: &MeridianConfig,
    fleet_store: Arc<SqlStore>,
    instance_store: Arc<SqlStore>,
    run_store: Arc<SqlStore>,
) -> TaskSchedule<Fleet> {
    let instance_store: Arc<dyn EntityStore<Instance>> = instance_store;
    let run_store: Arc<dyn EntityStore<Run>> = run_store;

    let handler: Handler<Fleet> = Arc::new(move |mut fleet: Fleet, ctx: ReconcileContext| {
        let instance_store = instance_store.clone();
        let run_store = run_store.clone();
        Box::pin(async move {
            fleet_reconciler::reconcile(&mut fleet, &ctx, instance_store.as_ref(), run_store.as_ref()).await?;
            Ok(fleet)
        })
    });

    TaskSchedule {
        name: "fleet",
        interval: config.fleet_schedule.interval(),
        batch_size: config.fleet_schedule.batch_size,
        store: fleet_store,
        handler,
    }
}
