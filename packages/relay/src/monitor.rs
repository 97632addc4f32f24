//! The per-worker connection monitor.
//!
//! Watches the channel's connectivity after attachment: reconnects (with
//! exponential backoff and jitter) when the channel goes idle, declares
//! the worker lost when reconnection or a stuck connection outlasts its
//! budget, and stands down when exit has been requested.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use derive_more::Display;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::DistributionConfig,
    transport::{Channel, ConnectivityState},
    worker::WorkerFailure,
};

/// Ceiling for one backoff step.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How the monitor loop ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum MonitorExit {
    /// Exit was requested; the idle channel is expected.
    ExitRequested,

    /// The channel was shut down locally.
    ChannelShutdown,

    /// The worker must be removed from the available set.
    #[display("failed: {_0}")]
    Failed(WorkerFailure),
}

/// Monitors one worker's channel for the life of the build.
pub struct ConnectionMonitor<C> {
    channel: Arc<C>,
    config: DistributionConfig,
    attached: AtomicBool,
    exit_requested: AtomicBool,
}

impl<C: Channel> ConnectionMonitor<C> {
    pub fn new(channel: Arc<C>, config: DistributionConfig) -> Self {
        Self {
            channel,
            config,
            attached: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
        }
    }

    /// Record that the worker has been seen attached; disconnects are now
    /// losses worth fighting.
    pub fn notify_attached(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    /// Record that exit has been requested; an idle channel is no longer
    /// worth reconnecting.
    pub fn notify_exit_requested(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    fn attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    /// Watch the channel until a terminal condition.
    #[instrument(skip(self))]
    pub async fn run(&self) -> MonitorExit {
        let poll = self.config.connect_timeout.min(Duration::from_secs(1)) / 4;
        let poll = poll.max(Duration::from_millis(10));
        let mut stuck_since: Option<Instant> = None;

        loop {
            let state = self.channel.connectivity();
            match state {
                ConnectivityState::Shutdown => {
                    debug!("channel shut down");
                    return MonitorExit::ChannelShutdown;
                }
                ConnectivityState::Ready => {
                    stuck_since = None;
                    self.channel
                        .wait_for_state_change(state, Duration::from_secs(5))
                        .await;
                }
                ConnectivityState::Idle => {
                    stuck_since = None;
                    if self.exit_requested() {
                        debug!("idle after exit request");
                        return MonitorExit::ExitRequested;
                    }
                    if self.attached() {
                        match self.reconnect().await {
                            Ok(()) => continue,
                            Err(failure) => return MonitorExit::Failed(failure),
                        }
                    }
                    self.channel.wait_for_state_change(state, poll).await;
                }
                ConnectivityState::Connecting | ConnectivityState::TransientFailure => {
                    if self.attached() {
                        let since = *stuck_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.config.connect_timeout {
                            warn!(state = %state, "connection stuck past the connect timeout");
                            return MonitorExit::Failed(WorkerFailure::ReconnectionTimeout);
                        }
                    }
                    self.channel.wait_for_state_change(state, poll).await;
                }
            }
        }
    }

    /// Reconnect with exponential backoff and jitter, up to the budget.
    async fn reconnect(&self) -> Result<(), WorkerFailure> {
        for attempt in 1..=self.config.reconnect_attempts.max(1) {
            if self.exit_requested() {
                return Ok(());
            }

            let backoff = self
                .config
                .reconnect_backoff
                .saturating_mul(1 << (attempt - 1).min(8))
                .min(MAX_BACKOFF);
            let jitter = Duration::from_millis(
                rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2),
            );
            tokio::time::sleep(backoff + jitter).await;

            debug!(attempt, "reconnecting");
            if self.channel.connect().await.is_ok()
                && self.channel.connectivity() == ConnectivityState::Ready
            {
                info!(attempt, "reconnected");
                return Ok(());
            }
        }

        warn!("reconnection budget exhausted");
        Err(WorkerFailure::ReconnectionTimeout)
    }
}
