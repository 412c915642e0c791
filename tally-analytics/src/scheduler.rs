use std::error::Error;
use std::time::Duration;

use tally_system::{
    AsyncResponse, FromMessage, Interface, Receiver, Sender, Service, ShutdownHandle,
};
use tokio::time::{Instant, MissedTickBehavior};

use crate::compactor::{CompactionReport, Compactor};
use crate::statsd::AnalyticsCounters;
use crate::store::AnalyticsStore;
use crate::AnalyticsError;

/// Runs a compaction pass immediately.
///
/// The pass waits for a scheduled pass that is currently running. The response carries the
/// report of the pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactNow {
    /// Stops the pass after this duration, overriding the configured deadline.
    pub deadline: Option<Duration>,
}

/// Interface of the [`CompactorService`].
#[derive(Debug)]
pub enum Compaction {
    /// Runs a pass on demand.
    CompactNow(CompactNow, Sender<Result<CompactionReport, AnalyticsError>>),
}

impl Interface for Compaction {}

impl FromMessage<CompactNow> for Compaction {
    type Response = AsyncResponse<Result<CompactionReport, AnalyticsError>>;

    fn from_message(
        message: CompactNow,
        sender: Sender<Result<CompactionReport, AnalyticsError>>,
    ) -> Self {
        Self::CompactNow(message, sender)
    }
}

/// Runs the [`Compactor`] on a fixed interval.
///
/// The first pass starts right after the service has started. Scheduled passes are skipped if a
/// previous pass is still running. Passes run on their own tasks, so the service keeps answering
/// messages while a pass is in progress.
///
/// On shutdown, the service stops scheduling passes. A pass that is already running is not
/// interrupted; every step of a pass is idempotent and the next start resumes its work.
pub struct CompactorService<S> {
    compactor: Compactor<S>,
    interval: Duration,
    deadline: Option<Duration>,
    shutdown: ShutdownHandle,
}

impl<S: AnalyticsStore> CompactorService<S> {
    /// Creates a new compactor service.
    pub fn new(
        compactor: Compactor<S>,
        interval: Duration,
        deadline: Option<Duration>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            compactor,
            interval,
            deadline,
            shutdown,
        }
    }

    fn deadline_from(&self, deadline: Option<Duration>) -> Option<Instant> {
        deadline
            .or(self.deadline)
            .map(|deadline| Instant::now() + deadline)
    }

    fn handle_tick(&self) {
        let compactor = self.compactor.clone();
        let deadline = self.deadline_from(None);

        tokio::spawn(async move {
            match compactor.try_run_once(deadline).await {
                Ok(_) => (),
                Err(AnalyticsError::CompactionConflict) => {
                    tally_log::debug!("previous compaction pass still running, skipping");
                    tally_statsd::metric!(counter(AnalyticsCounters::CompactionSkipped) += 1);
                }
                Err(error) => {
                    tally_log::error!(
                        error = &error as &dyn Error,
                        "scheduled compaction pass failed"
                    );
                }
            }
        });
    }

    fn handle_message(&self, message: Compaction) {
        match message {
            Compaction::CompactNow(message, sender) => {
                let compactor = self.compactor.clone();
                let deadline = self.deadline_from(message.deadline);

                tokio::spawn(async move {
                    sender.send(compactor.run_once(deadline).await);
                });
            }
        }
    }
}

impl<S: AnalyticsStore> Service for CompactorService<S> {
    type Interface = Compaction;

    async fn run(self, mut rx: Receiver<Self::Interface>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tally_log::info!(
            interval_secs = self.interval.as_secs(),
            "compactor service started"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                Some(message) = rx.recv() => self.handle_message(message),
                _ = ticker.tick() => self.handle_tick(),
                else => break,
            }
        }

        tally_log::info!("compactor service stopped");
    }
}
