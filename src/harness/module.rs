use super::super::library::{BoxedError, EmptyResult};
use super::{DeathReason, Heart, JobScheduler};
use async_trait::async_trait;
use std::any::type_name;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Long running component with a startup, operation and shutdown phase
///
/// Implementations are driven by a [`ModuleRunner`], which enforces the order of the phases
/// and cleans up background jobs spawned during operation.
#[async_trait]
pub trait Module {
    /// Acquires resources like broker connections before anything else happens
    async fn pre_startup(&mut self) -> EmptyResult {
        Ok(())
    }

    /// Does the actual work of the module
    ///
    /// Modules that hand their work to jobs on the [`JobScheduler`] return a [`Heart`] whose death
    /// marks the end of operation. Returning `None` means all work is done once this returns.
    async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError>;

    /// Called once every job has been stopped, regardless of how the module terminated
    #[instrument(skip(self))]
    async fn post_shutdown(&mut self, reason: &ModuleTerminationReason) {
        if reason.is_failure() {
            error!(%reason, "Module failed");
        } else {
            info!(%reason, "Module finished");
        }
    }
}

/// Outcome of running a [`Module`]
#[derive(Error, Debug)]
pub enum ModuleTerminationReason {
    /// `pre_startup` returned an error
    #[error("failed to start up")]
    StartupFailed(#[source] BoxedError),
    /// `run` returned an error
    #[error("failed during operation")]
    OperationalError(#[source] BoxedError),
    /// The [`Heart`] returned by `run` stopped beating
    #[error("heart stopped: {0}")]
    HeartDied(DeathReason),
    /// `run` completed without handing out a heart
    #[error("work completed")]
    ExitedNormally,
    /// A phase did not complete within its time limit
    #[error("phase exceeded its time limit")]
    Timeout,
}

impl ModuleTerminationReason {
    /// Whether the module terminated due to an error
    ///
    /// Modules only kill their own heart when something they depend on went away,
    /// thus a killed heart counts as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ModuleTerminationReason::ExitedNormally
                | ModuleTerminationReason::HeartDied(DeathReason::LifetimeExceeded)
                | ModuleTerminationReason::HeartDied(DeathReason::Terminated)
        )
    }
}

const DEFAULT_PHASE_LIMIT: Duration = Duration::from_secs(60);

/// Drives a [`Module`] through its phases
pub struct ModuleRunner {
    startup_limit: Duration,
    shutdown_limit: Duration,
}

impl Default for ModuleRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PHASE_LIMIT, DEFAULT_PHASE_LIMIT)
    }
}

impl ModuleRunner {
    /// Creates a runner with custom time limits for startup and shutdown
    ///
    /// The shutdown limit applies both to stopping jobs and to the `post_shutdown` hook.
    pub fn new(startup_limit: Duration, shutdown_limit: Duration) -> Self {
        Self {
            startup_limit,
            shutdown_limit,
        }
    }

    /// Runs all phases of the module and reports how it ended
    #[instrument(skip(self, module), fields(module = type_name::<M>()))]
    pub async fn run<M: Module + Send + Sync>(&self, mut module: M) -> ModuleTerminationReason {
        let scheduler = JobScheduler::default();

        let reason = match self.start(&mut module).await {
            Ok(()) => Self::operate(&mut module, &scheduler).await,
            Err(reason) => reason,
        };

        debug!("Stopping jobs");
        scheduler.terminate_jobs(self.shutdown_limit).await;

        debug!("Shutting down");
        if timeout(self.shutdown_limit, module.post_shutdown(&reason))
            .await
            .is_err()
        {
            warn!(limit = ?self.shutdown_limit, "Shutdown hook did not finish in time");
        }

        reason
    }

    async fn start<M: Module + Send + Sync>(
        &self,
        module: &mut M,
    ) -> Result<(), ModuleTerminationReason> {
        debug!("Starting up");

        match timeout(self.startup_limit, module.pre_startup()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                error!(%error, "Startup failed");
                Err(ModuleTerminationReason::StartupFailed(error))
            }
            Err(_) => {
                error!(limit = ?self.startup_limit, "Startup did not finish in time");
                Err(ModuleTerminationReason::Timeout)
            }
        }
    }

    async fn operate<M: Module + Send + Sync>(
        module: &mut M,
        scheduler: &JobScheduler,
    ) -> ModuleTerminationReason {
        debug!("Operating");

        match module.run(scheduler).await {
            Ok(None) => ModuleTerminationReason::ExitedNormally,
            Ok(Some(mut heart)) => {
                debug!("Waiting for heart to stop");
                let reason = heart.death().await;
                info!(%reason, "Heart stopped");
                ModuleTerminationReason::HeartDied(reason)
            }
            Err(error) => {
                error!(%error, "Operation failed");
                ModuleTerminationReason::OperationalError(error)
            }
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        fail_startup: bool,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Recorder {
        async fn pre_startup(&mut self) -> EmptyResult {
            if self.fail_startup {
                Err("broker unreachable".into())
            } else {
                Ok(())
            }
        }

        async fn run(&mut self, scheduler: &JobScheduler) -> Result<Option<Heart>, BoxedError> {
            let (heart, mut stone) = Heart::new();

            scheduler.spawn_job("suicide", move |_| async move {
                stone.kill("done").await;
                Ok(())
            });

            Ok(Some(heart))
        }

        async fn post_shutdown(&mut self, _: &ModuleTerminationReason) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn report_why_the_heart_died() {
        let module = Recorder::default();
        let shutdowns = module.shutdowns.clone();

        let reason = ModuleRunner::default().run(module).await;

        assert!(matches!(
            reason,
            ModuleTerminationReason::HeartDied(DeathReason::Killed(ref why)) if why == "done"
        ));
        assert!(reason.is_failure());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shut_down_after_failed_startup() {
        let module = Recorder {
            fail_startup: true,
            ..Default::default()
        };
        let shutdowns = module.shutdowns.clone();

        let reason = ModuleRunner::default().run(module).await;

        assert!(matches!(reason, ModuleTerminationReason::StartupFailed(_)));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn treat_lifetime_expiry_as_success() {
        assert!(!ModuleTerminationReason::ExitedNormally.is_failure());
        assert!(!ModuleTerminationReason::HeartDied(DeathReason::LifetimeExceeded).is_failure());
        assert!(ModuleTerminationReason::Timeout.is_failure());
    }
}
