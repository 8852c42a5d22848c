//! Structures to keep a module alive until some event occurs

use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Reason why the heart stopped beating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeathReason {
    /// Internal kill signal has been sent
    Killed(String),
    /// Predetermined lifetime has been exceeded
    LifetimeExceeded,
    /// SIGINT, SIGTERM or other process-external cause
    Terminated,
}

impl Display for DeathReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::Killed(reason) => write!(f, "Killed ({})", reason),
            DeathReason::LifetimeExceeded => write!(f, "Lifetime was exceeded"),
            DeathReason::Terminated => write!(f, "Terminated due to external signal"),
        }
    }
}

#[derive(Debug)]
enum HeartInteraction {
    Kill(String),
    Rejuvenate,
}

/// Keeps a long running module alive until it is killed, outlives its lifetime or the process
/// receives a termination signal
pub struct Heart {
    rx: mpsc::Receiver<HeartInteraction>,
    lifetime: Option<Duration>,
    lifetime_start: Instant,
}

impl Heart {
    /// Creates a new heart and linked stone with no lifetime limit
    pub fn new() -> (Self, HeartStone) {
        Heart::internal_new(None)
    }

    /// Creates a new heart and linked stone with a lifetime
    pub fn with_lifetime(lifetime: Duration) -> (Self, HeartStone) {
        Heart::internal_new(Some(lifetime))
    }

    /// Future that waits until the heart dies for the returned reason
    pub async fn death(&mut self) -> DeathReason {
        // Once all stones are gone, only the lifetime and signals remain
        let mut orphaned = false;

        debug!("Heart starts beating");

        loop {
            let deadline = self.lifetime.map(|lifetime| self.lifetime_start + lifetime);

            tokio::select! {
                interaction = self.rx.recv(), if !orphaned => match interaction {
                    Some(HeartInteraction::Kill(reason)) => return DeathReason::Killed(reason),
                    Some(HeartInteraction::Rejuvenate) => self.lifetime_start = Instant::now(),
                    None => orphaned = true,
                },
                () = expiry(deadline) => return DeathReason::LifetimeExceeded,
                () = termination_signal() => return DeathReason::Terminated,
            }
        }
    }

    fn internal_new(lifetime: Option<Duration>) -> (Self, HeartStone) {
        if let Some(lifetime) = lifetime {
            info!(?lifetime, "Lifetime set");
        }

        let (tx, rx) = mpsc::channel(2);
        let heart = Self {
            rx,
            lifetime,
            lifetime_start: Instant::now(),
        };

        (heart, HeartStone { remote: tx })
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

async fn termination_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Unable to listen for SIGTERM");
            ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = ctrl_c() => {},
    }
}

/// Remote controller for the heart
#[derive(Clone)]
pub struct HeartStone {
    remote: mpsc::Sender<HeartInteraction>,
}

impl HeartStone {
    /// Kill the associated heart
    pub async fn kill(&self, reason: impl Into<String>) {
        self.send(HeartInteraction::Kill(reason.into())).await;
    }

    /// Reset the lifetime of the associated heart
    pub async fn reset_lifetime(&self) {
        self.send(HeartInteraction::Rejuvenate).await;
    }

    async fn send(&self, interaction: HeartInteraction) {
        // A dead heart no longer listens, which is not worth more than a note
        if self.remote.send(interaction).await.is_err() {
            debug!("Heart is already dead");
        }
    }
}
