// Bootstrap wiring for the job server binary
// Builds storage, scheduler, execution engine and back-channel from settings

use crate::backchannel::BackChannelServer;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::executor::{ExecutionEngine, ExecutorConfig, ForkedProcessLauncher, ProcessLauncher};
use crate::scheduler::{JobScheduler, SchedulerConfig, SchedulerEvent};
use crate::storage::{InMemoryJobStorage, JobRepository, SeedFile};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Initialize job storage, seeding it when a seed file is configured
#[tracing::instrument(skip(settings))]
pub async fn init_storage(settings: &Settings) -> Result<Arc<InMemoryJobStorage>> {
    let storage = match &settings.storage.seed_file {
        Some(path) => {
            info!(seed_file = %path.display(), "Loading seed file");
            let seed = SeedFile::load(path)
                .await
                .with_context(|| format!("Failed to read seed file {}", path.display()))?;
            InMemoryJobStorage::from_seed(seed)
                .await
                .context("Failed to seed job storage")?
        }
        None => {
            info!("No seed file configured, starting with empty storage");
            InMemoryJobStorage::new()
        }
    };

    Ok(Arc::new(storage))
}

/// Scheduler, execution engine and back-channel wired together
pub struct JobServer {
    scheduler: Arc<JobScheduler>,
    engine: Arc<ExecutionEngine>,
    server: BackChannelServer,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
}

impl JobServer {
    /// Build from settings with seeded storage, forked processes and the system clock
    pub async fn build(settings: &Settings) -> Result<Self> {
        let storage = init_storage(settings).await?;
        let launcher = Arc::new(ForkedProcessLauncher::new(
            &settings.executor.job_runner_executable,
        ));
        Self::build_with(settings, storage, launcher, Arc::new(SystemClock)).await
    }

    /// Build with explicit collaborators
    pub async fn build_with(
        settings: &Settings,
        repository: Arc<dyn JobRepository>,
        launcher: Arc<dyn ProcessLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let server = BackChannelServer::bind(settings.backchannel.address.as_deref())
            .await
            .context("Failed to start back-channel listener")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(ExecutionEngine::new(
            ExecutorConfig::from(&settings.executor),
            repository.clone(),
            launcher,
            clock.clone(),
            server.url(),
            events_tx.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig::from(&settings.scheduler),
            repository,
            engine.clone(),
            clock,
        ));

        info!(backchannel_url = %server.url(), "Job server built");
        Ok(Self {
            scheduler,
            engine,
            server,
            events_tx,
            events_rx,
        })
    }

    /// Sender for trigger lifecycle notifications
    pub fn events(&self) -> mpsc::UnboundedSender<SchedulerEvent> {
        self.events_tx.clone()
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        self.scheduler.clone()
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine.clone()
    }

    pub fn backchannel_url(&self) -> String {
        self.server.url()
    }

    /// Run until `shutdown` resolves
    ///
    /// Child processes still running at shutdown are left alone; their runs
    /// keep their last persisted state.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let JobServer {
            scheduler,
            engine,
            server,
            events_tx,
            events_rx,
        } = self;
        // Keep the channel open while serving
        let _events_tx = events_tx;

        let engine_handle = engine.start();

        scheduler
            .start()
            .await
            .context("Failed to create initial plan")?;

        let event_handle = scheduler.spawn_event_loop(events_rx);

        let served = server.serve(engine.clone(), shutdown).await;

        info!("Shutting down job server");
        scheduler.stop();
        engine.stop();
        if let Err(e) = event_handle.await {
            error!(error = %e, "Scheduler event loop panicked");
        }
        if let Err(e) = engine_handle.await {
            error!(error = %e, "Execution engine loop panicked");
        }

        served.context("Back-channel server failed")?;
        info!("Job server stopped");
        Ok(())
    }
}
