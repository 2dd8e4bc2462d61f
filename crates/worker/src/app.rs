use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::info;

use firstsip_infra::config::WorkerConfig;
use firstsip_infra::generator::{self, BriefingGenerator};
use firstsip_infra::handlers::{ExecutePluginHandler, GenerateBriefingHandler, SchedulerTickHandler};
use firstsip_infra::jobs::{
    ExecutorStats, InMemoryJobStore, JobClient, JobServer, JobServerConfig, JobServerHandle,
    JobStore,
};
use firstsip_infra::read_model::{
    BriefingStore, InMemoryBriefingStore, InMemoryRunStore, RunStore,
};
use firstsip_infra::scheduler::{
    CronEvaluator, InMemoryScheduleCache, InMemoryScheduleSource, RegistrarHandle,
    ScheduleCache, ScheduleSource, SchedulerTick, TickRegistrar,
};
use firstsip_infra::workers::result_consumer;
use firstsip_streams::{ConsumerHandle, InMemoryStreamLog, Producer, StreamLog};

/// Backends every component of the worker is built from.
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub runs: Arc<dyn RunStore>,
    pub briefings: Arc<dyn BriefingStore>,
    pub schedules: Arc<dyn ScheduleSource>,
    pub cache: Arc<dyn ScheduleCache>,
    pub log: Arc<dyn StreamLog>,
    pub generator: Arc<dyn BriefingGenerator>,
}

impl Services {
    pub fn client(&self) -> JobClient<Arc<dyn JobStore>> {
        JobClient::new(self.jobs.clone())
    }
}

/// Concrete in-memory backends, kept so callers can seed and inspect them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackends {
    pub jobs: Arc<InMemoryJobStore>,
    pub runs: Arc<InMemoryRunStore>,
    pub briefings: Arc<InMemoryBriefingStore>,
    pub schedules: Arc<InMemoryScheduleSource>,
    pub cache: Arc<InMemoryScheduleCache>,
    pub log: Arc<InMemoryStreamLog>,
}

impl InMemoryBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self, generator: Arc<dyn BriefingGenerator>) -> Services {
        Services {
            jobs: self.jobs.clone(),
            runs: self.runs.clone(),
            briefings: self.briefings.clone(),
            schedules: self.schedules.clone(),
            cache: self.cache.clone(),
            log: self.log.clone(),
            generator,
        }
    }
}

pub fn build_in_memory_services(config: &WorkerConfig) -> Result<Services> {
    let generator = generator::from_config(&config.generator).context("failed to build briefing generator")?;
    Ok(InMemoryBackends::new().services(generator))
}

/// Open the Postgres pool when persistent stores are requested.
pub async fn connect_postgres(config: &WorkerConfig) -> Result<Option<PgPool>> {
    if !config.use_persistent_stores {
        return Ok(None);
    }
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let pool = PgPool::connect(url).await.context("failed to connect to Postgres")?;
    Ok(Some(pool))
}

#[cfg(feature = "redis")]
pub fn build_persistent_services(config: &WorkerConfig, pool: PgPool, handle: Handle) -> Result<Services> {
    use firstsip_infra::bridge::RedisStreamLog;
    use firstsip_infra::jobs::RedisJobStore;
    use firstsip_infra::read_model::{PostgresBriefingStore, PostgresRunStore, PostgresScheduleSource};
    use firstsip_infra::scheduler::RedisScheduleCache;

    let redis_url = config
        .redis_url
        .as_deref()
        .context("REDIS_URL must be set when USE_PERSISTENT_STORES=true")?;

    let jobs = RedisJobStore::new(redis_url).context("failed to create Redis job store")?;
    let log = RedisStreamLog::new(redis_url)
        .context("failed to create Redis stream log")?
        .with_io_timeout(config.streams.io_timeout);
    let cache = RedisScheduleCache::new(redis_url).context("failed to create Redis schedule cache")?;
    let generator = generator::from_config(&config.generator).context("failed to build briefing generator")?;

    Ok(Services {
        jobs: Arc::new(jobs),
        runs: Arc::new(PostgresRunStore::new(pool.clone(), handle.clone())),
        briefings: Arc::new(PostgresBriefingStore::new(pool.clone(), handle.clone())),
        schedules: Arc::new(PostgresScheduleSource::new(pool, handle)),
        cache: Arc::new(cache),
        log: Arc::new(log),
        generator,
    })
}

/// Pick persistent or in-memory backends.
///
/// Must run off the async runtime: the HTTP generator uses a blocking client.
pub fn build_services(config: &WorkerConfig, pool: Option<PgPool>, handle: Handle) -> Result<Services> {
    match pool {
        #[cfg(feature = "redis")]
        Some(pool) => build_persistent_services(config, pool, handle),
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            let _ = handle;
            tracing::warn!("USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory");
            build_in_memory_services(config)
        }
        None => build_in_memory_services(config),
    }
}

/// The running worker: job server, tick registrar and result consumer.
pub struct Worker {
    server: JobServerHandle,
    registrar: RegistrarHandle,
    consumer: ConsumerHandle,
}

impl Worker {
    pub fn start(services: Services, config: &WorkerConfig) -> Result<Self> {
        let client = services.client();
        let mut server = JobServer::new(services.jobs.clone());

        GenerateBriefingHandler::new(services.briefings.clone(), services.generator.clone())
            .register(&mut server);
        ExecutePluginHandler::new(
            services.runs.clone(),
            Producer::new(services.log.clone())
                .with_stream(&config.streams.request_stream)
                .with_max_len(config.streams.max_len),
        )
        .register(&mut server);
        SchedulerTickHandler::new(SchedulerTick::new(
            services.schedules.clone(),
            services.cache.clone(),
            client.clone(),
            CronEvaluator::new(config.scheduler_tick),
        ))
        .register(&mut server);

        let consumer = result_consumer::spawn(services.log.clone(), services.runs.clone(), &config.streams)
            .context("failed to start result consumer")?;

        let server = server.spawn(
            JobServerConfig::default()
                .with_name("firstsip-jobs")
                .with_concurrency(config.concurrency)
                .with_shutdown_timeout(config.shutdown_timeout),
        );
        let registrar = TickRegistrar::new(client, config.scheduler_tick).spawn("tick-registrar");

        info!(
            concurrency = config.concurrency,
            tick_secs = config.scheduler_tick.as_secs(),
            request_stream = %config.streams.request_stream,
            result_stream = %config.streams.result_stream,
            "worker started"
        );

        Ok(Self {
            server,
            registrar,
            consumer,
        })
    }

    pub fn stats(&self) -> ExecutorStats {
        self.server.stats()
    }

    /// Stop registering ticks, stop consuming results, then drain the job server.
    pub fn shutdown(self) {
        self.registrar.shutdown();
        self.consumer.shutdown();
        self.server.shutdown();
        info!("worker stopped");
    }
}
