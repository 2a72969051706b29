//! Keeps a module alive until it is told to stop, sits idle for too long, or the process is signalled

use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::signal::ctrl_c;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Why [`Heart::death`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// A [`HeartStone`] asked for it, with the given explanation
    Killed(String),
    /// No lifetime reset happened within the configured lifetime
    LifetimeExceeded,
    /// The process received SIGINT or SIGTERM
    Terminated,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Killed(reason) => write!(f, "killed: {}", reason),
            DeathReason::LifetimeExceeded => write!(f, "idle for longer than its lifetime"),
            DeathReason::Terminated => write!(f, "terminated by signal"),
        }
    }
}

/// Message sent from a [`HeartStone`] to its [`Heart`]
#[derive(Debug)]
pub enum HeartInteraction {
    /// Stop beating
    Kill(String),
    /// Restart the lifetime countdown
    ResetLifetime,
}

/// Resolves once the owning module should stop
///
/// A heart with a lifetime doubles as an idle timer: every [`HeartStone::reset_lifetime`]
/// pushes the moment of death further into the future.
pub struct Heart {
    rx: Receiver<HeartInteraction>,
    last_reset: Arc<Mutex<Instant>>,
    lifetime: Option<Duration>,
}

impl Heart {
    /// Heart that only dies when killed or signalled
    pub fn new() -> (Self, HeartStone) {
        Heart::build(None)
    }

    /// Heart that additionally dies after being idle for `lifetime`
    pub fn with_lifetime(lifetime: Duration) -> (Self, HeartStone) {
        Heart::build(Some(lifetime))
    }

    /// Combination of [`Heart::new`] and [`Heart::with_lifetime`]
    pub fn with_optional_lifetime(lifetime: Option<Duration>) -> (Self, HeartStone) {
        Heart::build(lifetime)
    }

    /// Waits until the heart stops beating
    pub async fn death(&mut self) -> DeathReason {
        let lifetime = self.lifetime;
        let last_reset = self.last_reset.clone();
        let age = async move {
            match lifetime {
                Some(lifetime) => expire(lifetime, last_reset).await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(age);

        let termination = termination_signal();
        tokio::pin!(termination);

        // Once every stone is dropped, nobody can interact with the heart anymore
        let mut reachable = true;

        debug!("Heart is beating");

        loop {
            tokio::select! {
                interaction = self.rx.next(), if reachable => match interaction {
                    Some(HeartInteraction::Kill(reason)) => return DeathReason::Killed(reason),
                    Some(HeartInteraction::ResetLifetime) => {
                        *lock(&self.last_reset) = Instant::now();
                    }
                    None => reachable = false,
                },
                () = &mut age => return DeathReason::LifetimeExceeded,
                () = &mut termination => return DeathReason::Terminated,
            }
        }
    }

    fn build(lifetime: Option<Duration>) -> (Self, HeartStone) {
        if let Some(lifetime) = lifetime {
            info!(?lifetime, "Stopping when idle");
        }

        let (tx, rx) = channel(2);
        let heart = Self {
            rx,
            last_reset: Arc::new(Mutex::new(Instant::now())),
            lifetime,
        };

        (heart, HeartStone { remote: tx })
    }
}

fn lock(start: &Mutex<Instant>) -> std::sync::MutexGuard<'_, Instant> {
    start.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = ctrl_c() => {},
                }
                return;
            }
            Err(e) => warn!(error = %e, "Unable to listen for SIGTERM"),
        }
    }

    if let Err(e) = ctrl_c().await {
        error!(error = %e, "Unable to listen for SIGINT");
        futures::future::pending::<()>().await;
    }
}

async fn expire(lifetime: Duration, last_reset: Arc<Mutex<Instant>>) {
    loop {
        let deadline = *lock(&last_reset) + lifetime;

        if Instant::now() >= deadline {
            return;
        }

        sleep_until(deadline).await;
    }
}

/// Handle to control a [`Heart`] from other tasks
#[derive(Clone)]
pub struct HeartStone {
    remote: Sender<HeartInteraction>,
}

impl HeartStone {
    /// Makes the heart die with the given explanation
    pub async fn kill(&mut self, reason: impl Into<String>) {
        self.send(HeartInteraction::Kill(reason.into())).await;
    }

    /// Restarts the idle countdown
    pub async fn reset_lifetime(&mut self) {
        self.send(HeartInteraction::ResetLifetime).await;
    }

    async fn send(&mut self, interaction: HeartInteraction) {
        if let Err(e) = self.remote.send(interaction).await {
            // Regular during shutdown
            debug!(error = %e, "Heart is gone");
        }
    }
}
