//! Debounce of change notifications into convergence passes
//!
//! Triggers arrive over a channel from any number of [`Notifier`]s (watch
//! events, the periodic resync). One loop owns the timer:
//!
//! - idle + trigger: arm, firing `debounce` from now
//! - armed + trigger: push the deadline back to `debounce` from now
//! - armed + deadline: run one pass, back to idle
//!
//! A burst of triggers yields one pass. A trigger that arrives while a pass is
//! running is held in the channel and arms the timer again once it finishes.
//! Shutdown abandons a pending fire; a running pass is never interrupted.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

/// Something that can run one convergence pass
#[async_trait]
pub trait Converge: Send + Sync {
    /// Run one full pass
    async fn converge(&self) -> Result<()>;
}

/// Handle for requesting a convergence pass
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: mpsc::Sender<()>,
}

impl Notifier {
    /// Request a pass
    ///
    /// Never blocks. A full channel already holds a pending trigger, so the
    /// request is folded into it.
    pub fn notify(&self) {
        if let Err(mpsc::error::TrySendError::Closed(())) = self.tx.try_send(()) {
            debug!("coalescer stopped, dropping trigger");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Armed { deadline: Instant },
}

/// Single-owner debounce loop
pub struct Coalescer {
    debounce: Duration,
    triggers: mpsc::Receiver<()>,
}

impl Coalescer {
    /// Create a coalescer and the notifier feeding it
    pub fn new(debounce: Duration) -> (Self, Notifier) {
        let (tx, triggers) = mpsc::channel(1);
        (Self { debounce, triggers }, Notifier { tx })
    }

    /// Run until `shutdown` is cancelled or every notifier is dropped
    ///
    /// Returns the error of a pass that failed fatally; other pass errors are
    /// logged and the loop keeps going.
    pub async fn run<C>(mut self, target: &C, shutdown: CancellationToken) -> Result<()>
    where
        C: Converge + ?Sized,
    {
        let mut state = State::Idle;
        loop {
            state = match state {
                State::Idle => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    trigger = self.triggers.recv() => match trigger {
                        Some(()) => self.arm(),
                        None => return Ok(()),
                    },
                },
                State::Armed { deadline } => tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("shutting down, abandoning pending convergence pass");
                        return Ok(());
                    }
                    trigger = self.triggers.recv() => match trigger {
                        Some(()) => self.arm(),
                        None => {
                            fire(target).await?;
                            return Ok(());
                        }
                    },
                    _ = sleep_until(deadline) => {
                        fire(target).await?;
                        State::Idle
                    }
                },
            };
        }
    }

    fn arm(&self) -> State {
        State::Armed {
            deadline: Instant::now() + self.debounce,
        }
    }
}

async fn fire<C: Converge + ?Sized>(target: &C) -> Result<()> {
    match target.converge().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "convergence pass failed fatally");
            Err(e)
        }
        Err(e) => {
            warn!(error = %e, "convergence pass failed, will retry on next trigger");
            Ok(())
        }
    }
}

/// Spawn the periodic resync: one trigger immediately, then every `period`
pub fn spawn_resync(
    notifier: Notifier,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("periodic resync");
                    notifier.notify();
                }
            }
        }
    })
}
