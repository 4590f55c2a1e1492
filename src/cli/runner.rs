//! Command dispatch, signal handling and exit status

use crate::cli::args::{Cli, Command};
use crate::config::Config;
use crate::error::{Result, SyncFailure, SyncerError};
use crate::logging::Logger;
use crate::registry::{ConfiguredRegistries, RegistryFactory, RegistryResolver};
use crate::scheduler::{Scheduler, SyncJob};
use crate::store::ContentStore;
use crate::sync::{SyncReport, Syncer};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Prints the report of every scheduled run
struct ReportingJob {
    syncer: Arc<Syncer>,
    logger: Logger,
}

#[async_trait]
impl SyncJob for ReportingJob {
    async fn run(&self, cancel: &CancellationToken) -> std::result::Result<SyncReport, SyncFailure> {
        let result = self.syncer.sync_all(cancel).await;
        match &result {
            Ok(report) => self.logger.report(report),
            Err(failure) => {
                self.logger.report(&failure.report);
                self.logger.error(&failure.error.to_string());
            }
        }
        result
    }
}

pub struct Runner {
    cli: Cli,
    logger: Logger,
}

impl Runner {
    pub fn new(cli: Cli) -> Self {
        let logger = Logger::new(cli.verbose, cli.quiet);
        Self { cli, logger }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub async fn run(&self) -> Result<()> {
        let config = Config::load(self.cli.config.as_deref())?;
        match self.cli.command {
            Command::Sync { once: true } => self.sync_once(&config).await,
            Command::Sync { once: false } => self.run_scheduled(&config).await,
            Command::Check => self.check(&config).await,
        }
    }

    async fn sync_once(&self, config: &Config) -> Result<()> {
        self.logger.section("SyncerD");
        self.logger.info("Running sync once...");
        let syncer = Syncer::new(config)?;

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                warn!("interrupted, cancelling sync run");
                cancel.cancel();
            }
        });

        let started = Instant::now();
        let result = syncer.sync_all(&cancel).await;
        watcher.abort();

        match result {
            Ok(report) => {
                self.logger.report(&report);
                self.logger.success(&format!(
                    "Sync completed in {}",
                    self.logger.format_duration(started.elapsed())
                ));
                Ok(())
            }
            Err(failure) => {
                self.logger.report(&failure.report);
                if failure.error == SyncerError::Cancelled {
                    self.logger.warning("Sync run interrupted before it finished");
                }
                Err(failure.error)
            }
        }
    }

    async fn run_scheduled(&self, config: &Config) -> Result<()> {
        let syncer = Arc::new(Syncer::new(config)?);
        let job = Arc::new(ReportingJob {
            syncer,
            logger: self.logger.clone(),
        });
        let scheduler = Scheduler::new(config.schedule(), job)?;

        self.logger.section("SyncerD");
        self.logger
            .info(&format!("Starting SyncerD with schedule: {}", scheduler.expression()));
        scheduler.start();
        if let Some(next) = scheduler.next_fire() {
            self.logger.detail(&format!("Next scheduled run at {}", next.to_rfc3339()));
        }

        shutdown_signal().await;
        self.logger
            .info("Shutdown requested, waiting for the current sync to finish (signal again to abort)");

        let stop = scheduler.stop();
        tokio::pin!(stop);
        let aborted = tokio::select! {
            _ = &mut stop => false,
            _ = shutdown_signal() => true,
        };
        if aborted {
            self.logger.warning("Second signal received, aborting the sync in progress");
            scheduler.abort();
            stop.await;
        }

        self.logger.success("SyncerD stopped");
        Ok(())
    }

    async fn check(&self, config: &Config) -> Result<()> {
        self.logger.section("Connection Check");
        let store = Arc::new(ContentStore::temporary()?);
        let factory = RegistryFactory::new(store, config.sync.timeout())?;
        let resolver = ConfiguredRegistries::new(factory, config);
        let cancel = CancellationToken::new();

        let mut targets = vec![(format!("source ({})", config.source.registry), resolver.source())];
        for destination in &config.destinations {
            targets.push((
                format!("destination {} ({})", destination.name, destination.registry),
                resolver.destination(&destination.name).await,
            ));
        }

        let total = targets.len();
        let mut failures = 0;
        for (label, registry) in targets {
            let result = match registry {
                Ok(registry) => {
                    resolver
                        .factory()
                        .test_connection(&cancel, registry.as_ref())
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => self.logger.success(&format!("{}: reachable", label)),
                Err(e) => {
                    failures += 1;
                    self.logger.error(&format!("{}: {}", label, e));
                }
            }
        }

        if failures > 0 {
            return Err(SyncerError::Sync(format!(
                "{} of {} registries failed the connection check",
                failures, total
            )));
        }
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
