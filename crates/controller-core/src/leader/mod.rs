//! Lease-based leader election.
//!
//! Candidates race to hold a shared lease. The holder renews it every retry
//! period; the others keep observing it and take over only once the lease
//! has not changed for a full lease duration. Expiry is judged against the
//! local clock at the time a change was observed, never against the
//! timestamps written in the lease.
//!
//! Only the leader runs the pipeline handed to [`LeaderElector::run`].

pub mod lock;

pub use lock::{KubeLeaseLock, LeaderElectionRecord, LeaseLock, ObservedLease};

use crate::error::{ControllerError, LeaderElectionError, LeaseError};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Lease timing.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// How long non-leaders wait after the last observed change before taking over
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire/renew attempts
    pub retry_period: Duration,
    /// Clear the holder when stopping on shutdown
    pub release_on_cancel: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(5),
            release_on_cancel: true,
        }
    }
}

impl LeaderElectionConfig {
    /// Checks `lease_duration > renew_deadline > retry_period > 0`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaderElectionError::InvalidConfig`] describing the violated bound.
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidConfig(
                "retry period must be positive".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

enum Outcome {
    Shutdown,
    PipelineExited(Result<Result<(), ControllerError>, JoinError>),
    Lost(String),
}

/// Runs a pipeline only while holding the lease.
pub struct LeaderElector<L> {
    lock: L,
    config: LeaderElectionConfig,
    observed: Option<ObservedLease>,
    observed_at: Instant,
    leader_tx: watch::Sender<Option<String>>,
}

impl<L: LeaseLock> std::fmt::Debug for LeaderElector<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease", &self.lock.describe())
            .field("identity", &self.lock.identity())
            .field("config", &self.config)
            .field("observed", &self.observed)
            .finish_non_exhaustive()
    }
}

impl<L: LeaseLock> LeaderElector<L> {
    /// Creates an elector competing for `lock`.
    ///
    /// # Errors
    ///
    /// Returns [`LeaderElectionError::InvalidConfig`] for inconsistent timing.
    pub fn new(lock: L, config: LeaderElectionConfig) -> Result<Self, LeaderElectionError> {
        config.validate()?;
        let (leader_tx, _) = watch::channel(None);
        Ok(Self {
            lock,
            config,
            observed: None,
            observed_at: Instant::now(),
            leader_tx,
        })
    }

    /// Identity this candidate competes as.
    #[must_use]
    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    /// Reports every observed holder change; `None` while the lease is free.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.leader_tx.subscribe()
    }

    fn observe(&mut self, observed: ObservedLease) {
        let holder = observed.record.holder().map(str::to_string);
        self.leader_tx.send_if_modified(|current| {
            if *current == holder {
                false
            } else {
                debug!(holder = ?holder, "lease holder changed");
                current.clone_from(&holder);
                true
            }
        });
        self.observed = Some(observed);
        self.observed_at = Instant::now();
    }

    /// One acquire or renew attempt.
    ///
    /// Returns `Ok(false)` while another candidate holds an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns the lock error, contention included.
    pub async fn try_acquire_or_renew(&mut self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let mut record = LeaderElectionRecord {
            holder_identity: self.lock.identity().to_string(),
            lease_duration: self.config.lease_duration,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            let resource_version = self.lock.create(&record).await?;
            self.observe(ObservedLease {
                record,
                resource_version,
            });
            return Ok(true);
        };

        let changed = self
            .observed
            .as_ref()
            .is_none_or(|observed| observed.resource_version != current.resource_version);
        if changed {
            self.observe(current.clone());
        }

        let ours = current.record.holder_identity == self.lock.identity();
        if !ours
            && current.record.holder().is_some()
            && self.observed_at + current.record.lease_duration > Instant::now()
        {
            debug!(holder = %current.record.holder_identity, "lease held by another candidate");
            return Ok(false);
        }

        if ours {
            record.acquire_time = current.record.acquire_time;
            record.leader_transitions = current.record.leader_transitions;
        } else {
            record.leader_transitions = current.record.leader_transitions.saturating_add(1);
        }
        let resource_version = self.lock.update(&record, &current.resource_version).await?;
        self.observe(ObservedLease {
            record,
            resource_version,
        });
        Ok(true)
    }

    /// Gives the lease up if this candidate holds it.
    ///
    /// # Errors
    ///
    /// Returns the lock error when the lease cannot be read or written.
    pub async fn release(&mut self) -> Result<(), LeaseError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if current.record.holder_identity != self.lock.identity() {
            return Ok(());
        }
        let now = Utc::now();
        let record = LeaderElectionRecord {
            holder_identity: String::new(),
            lease_duration: Duration::from_secs(1),
            acquire_time: now,
            renew_time: now,
            leader_transitions: current.record.leader_transitions,
        };
        let resource_version = self.lock.update(&record, &current.resource_version).await?;
        self.observe(ObservedLease {
            record,
            resource_version,
        });
        info!(lease = %self.lock.describe(), "lease released");
        Ok(())
    }

    /// Campaigns for the lease and runs `on_started_leading` while holding it.
    ///
    /// The callback is invoked at most once, with a child of `shutdown` as
    /// its execution scope. The scope is cancelled when `shutdown` fires or
    /// leadership is lost, and the pipeline is awaited before returning.
    ///
    /// Returns `Ok(())` when `shutdown` fires, or the pipeline's own result
    /// if it finishes first.
    ///
    /// # Errors
    ///
    /// - [`LeaderElectionError::Unreachable`] if the first contact with the
    ///   lease fails for any reason other than contention
    /// - [`LeaderElectionError::LeadershipLost`] if renewal fails past the
    ///   renew deadline or another candidate takes the lease
    /// - [`LeaderElectionError::Controller`] if the pipeline fails
    pub async fn run<F, Fut>(
        mut self,
        shutdown: CancellationToken,
        on_started_leading: F,
    ) -> Result<(), LeaderElectionError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        let lease = self.lock.describe();
        info!(%lease, identity = %self.identity(), "Campaigning for leadership");

        if !self.acquire(&shutdown).await? {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
        info!(%lease, identity = %self.identity(), "Started leading");

        let scope = shutdown.child_token();
        let mut pipeline = tokio::spawn(on_started_leading(scope.clone()).in_current_span());
        let outcome = self.renew(&shutdown, &mut pipeline).await;
        scope.cancel();

        match outcome {
            Outcome::Shutdown => {
                let result = finish(pipeline.await);
                self.step_down().await;
                info!("Stopped leading");
                result
            }
            Outcome::PipelineExited(result) => {
                self.step_down().await;
                info!("Pipeline finished, stopped leading");
                finish(result)
            }
            Outcome::Lost(reason) => {
                error!(%lease, %reason, "Leadership lost");
                if let Err(e) = finish(pipeline.await) {
                    error!(error = %e, "Pipeline failed while stopping");
                }
                Err(LeaderElectionError::LeadershipLost(reason))
            }
        }
    }

    async fn step_down(&mut self) {
        if !self.config.release_on_cancel {
            return;
        }
        if let Err(e) = self.release().await {
            warn!(error = %e, "Failed to release lease");
        }
    }

    /// Retries until the lease is held. Returns `false` on shutdown.
    async fn acquire(&mut self, shutdown: &CancellationToken) -> Result<bool, LeaderElectionError> {
        let mut first_contact = true;
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) if e.is_contention() => debug!(error = %e, "Lost acquire race"),
                Err(e) if first_contact => return Err(LeaderElectionError::Unreachable(e)),
                Err(e) => warn!(error = %e, "Failed to acquire lease"),
            }
            first_contact = false;

            tokio::select! {
                () = shutdown.cancelled() => return Ok(false),
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keeps the lease until shutdown, pipeline exit or loss.
    async fn renew(
        &mut self,
        shutdown: &CancellationToken,
        pipeline: &mut JoinHandle<Result<(), ControllerError>>,
    ) -> Outcome {
        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Outcome::Shutdown,
                result = &mut *pipeline => return Outcome::PipelineExited(result),
                () = tokio::time::sleep(self.config.retry_period) => {}
            }

            let deadline = last_renew + self.config.renew_deadline;
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => {
                    debug!("Lease renewed");
                    last_renew = Instant::now();
                }
                Ok(Ok(false)) => {
                    return Outcome::Lost("lease taken over by another candidate".to_string());
                }
                Ok(Err(e)) if Instant::now() >= deadline => {
                    return Outcome::Lost(format!("renew deadline exceeded: {e}"));
                }
                Ok(Err(e)) => warn!(error = %e, "Failed to renew lease, will retry"),
                Err(_) => return Outcome::Lost("renew deadline exceeded".to_string()),
            }
        }
    }
}

fn finish(result: Result<Result<(), ControllerError>, JoinError>) -> Result<(), LeaderElectionError> {
    match result {
        Ok(result) => result.map_err(LeaderElectionError::from),
        Err(e) => Err(ControllerError::TaskFailed(format!("pipeline: {e}")).into()),
    }
}
