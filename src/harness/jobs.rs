//! Background jobs spawned by modules

use super::super::library::EmptyResult;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

struct Job {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Spawns jobs in the background and terminates them on shutdown
///
/// Each job receives a [`CancellationToken`] which is cancelled once [`terminate_jobs`](JobScheduler::terminate_jobs)
/// is called. Jobs that do not return within the grace period are aborted.
#[derive(Default)]
pub struct JobScheduler {
    token: CancellationToken,
    jobs: Mutex<Vec<Job>>,
}

impl JobScheduler {
    /// Runs a job until it completes or the scheduler terminates it
    pub fn spawn_job<F, Fut>(&self, name: &'static str, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = EmptyResult> + Send + 'static,
    {
        let future = job(self.token.child_token());
        let span = tracing::info_span!("job", name);

        let handle = tokio::spawn(
            async move {
                debug!("Job started");

                match future.await {
                    Ok(()) => debug!("Job finished"),
                    Err(e) => error!(error = %e, "Job failed"),
                }
            }
            .instrument(span),
        );

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Job { name, handle });
    }

    /// Signals all jobs to stop and waits at most `grace_period` for each of them
    pub async fn terminate_jobs(&self, grace_period: Duration) {
        self.token.cancel();

        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner));

        for Job { name, mut handle } in jobs {
            match timeout(grace_period, &mut handle).await {
                Ok(Ok(())) => debug!(job = name, "Job terminated"),
                Ok(Err(e)) if e.is_cancelled() => debug!(job = name, "Job was aborted"),
                Ok(Err(e)) => error!(job = name, error = %e, "Job panicked"),
                Err(_) => {
                    warn!(job = name, "Job did not terminate in time, aborting it");
                    handle.abort();
                }
            }
        }

        info!("All jobs terminated");
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_jobs_on_termination() {
        let scheduler = JobScheduler::default();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        scheduler.spawn_job("waiting", move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        scheduler.terminate_jobs(Duration::from_secs(1)).await;

        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stubborn_jobs() {
        let scheduler = JobScheduler::default();

        scheduler.spawn_job("stubborn", |_| async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        // Returns after the grace period instead of hanging
        scheduler.terminate_jobs(Duration::from_secs(5)).await;
    }
}
