//! Campaign processor orchestration
//!
//! The processor owns the delayed job queue and everything the jobs need:
//! the store, the provider, the recipient source, the rate limiter and the
//! per-account concurrency limits. Work is split by concern:
//!
//! - [`lifecycle`]: operator commands and state transitions
//! - [`materialize`]: creating send rows from the recipient source
//! - [`dispatch`]: the self-rescheduling batch loop for a sending campaign
//! - [`worker`]: delivering one send and retrying failed ones
//! - [`monitor`]: periodic review, canary and kill-switch checks
//! - [`events`]: provider telemetry and engagement callbacks

pub mod dispatch;
pub mod events;
pub mod lifecycle;
pub mod materialize;
pub mod monitor;
pub mod worker;

use std::{collections::HashSet, sync::Arc, time::Duration};

use dashmap::{DashMap, DashSet};
use ember_common::{Clock, Signal, SystemClock, internal, tracing};
use ember_store::{CampaignId, CampaignStatus, CampaignStore, SendId};
use serde::Deserialize;
use tokio::task::JoinSet;

pub use self::{
    dispatch::DispatchConfig, materialize::MaterializeConfig, monitor::MonitorConfig,
    worker::SendOutcome,
};
use crate::{
    concurrency::TenantLimiter,
    error::{Result, SystemError},
    notify::{Notifier, TracingNotifier},
    policy::RetryPolicy,
    rate_limiter::{RateLimitConfig, RateLimiter},
    recipients::RecipientSource,
    render::{PlainRenderer, Renderer},
    risk::RiskConfig,
    scheduler::{Job, Scheduler},
    transport::Transport,
};

/// Longest the serve loop sleeps before re-reading the clock
const MAX_IDLE: Duration = Duration::from_secs(1);

const fn default_shutdown_timeout() -> u64 {
    30
}

/// The external pieces a processor works with
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub store: Arc<dyn CampaignStore>,
    pub transport: Arc<dyn Transport>,
    pub recipients: Arc<dyn RecipientSource>,
    pub renderer: Arc<dyn Renderer>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators with the plain renderer, log notifications and the
    /// system clock
    pub fn new(
        store: Arc<dyn CampaignStore>,
        transport: Arc<dyn Transport>,
        recipients: Arc<dyn RecipientSource>,
    ) -> Self {
        Self {
            store,
            transport,
            recipients,
            renderer: Arc::new(PlainRenderer),
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// State that only exists once the processor has been initialised
#[derive(Debug)]
pub(crate) struct Runtime {
    pub(crate) store: Arc<dyn CampaignStore>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) recipients: Arc<dyn RecipientSource>,
    pub(crate) renderer: Arc<dyn Renderer>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) tenants: TenantLimiter,
    pub(crate) scheduler: Scheduler,
    /// Campaigns currently being materialized
    pub(crate) materializing: DashSet<CampaignId>,
    /// Campaigns whose dispatcher is currently running
    pub(crate) dispatching: DashSet<CampaignId>,
    /// Sends with a queued or running per-send job, by campaign
    pub(crate) in_flight: DashMap<CampaignId, HashSet<SendId>>,
}

impl Runtime {
    pub(crate) fn track(&self, campaign: CampaignId, send: SendId) -> bool {
        self.in_flight.entry(campaign).or_default().insert(send)
    }

    pub(crate) fn untrack(&self, campaign: &CampaignId, send: &SendId) {
        if let Some(mut sends) = self.in_flight.get_mut(campaign) {
            sends.remove(send);
        }
        self.in_flight.remove_if(campaign, |_, sends| sends.is_empty());
    }

    pub(crate) fn in_flight(&self, campaign: &CampaignId) -> HashSet<SendId> {
        self.in_flight
            .get(campaign)
            .map(|sends| sends.clone())
            .unwrap_or_default()
    }
}

/// Marks a campaign as busy in a set for as long as it is held
pub(crate) struct Flight<'a> {
    set: &'a DashSet<CampaignId>,
    id: CampaignId,
}

impl<'a> Flight<'a> {
    /// `None` if the campaign is already busy
    pub(crate) fn enter(set: &'a DashSet<CampaignId>, id: CampaignId) -> Option<Self> {
        set.insert(id).then(|| Self { set, id })
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Drives campaigns from start to finish
///
/// Tunables are read from configuration; the collaborators are supplied by
/// [`init`](Self::init). All operator commands return `Ok(false)` when the
/// campaign is not in a state that allows them.
#[derive(Debug, Deserialize)]
pub struct CampaignProcessor {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub materialize: MaterializeConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// How long to wait for running jobs on shutdown (in seconds)
    ///
    /// Default: 30 seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(skip)]
    runtime: Option<Runtime>,
}

impl Default for CampaignProcessor {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            materialize: MaterializeConfig::default(),
            monitor: MonitorConfig::default(),
            retry: RetryPolicy::default(),
            risk: RiskConfig::default(),
            rate_limit: RateLimitConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            runtime: None,
        }
    }
}

impl CampaignProcessor {
    /// Initialize the campaign processor
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable
    pub fn init(&mut self, collaborators: Collaborators) -> Result<()> {
        internal!("Initialising Campaign Processor ...");

        if self.dispatch.batch_size == 0 {
            return Err(SystemError::Configuration(
                "dispatch.batch_size must be greater than zero".to_string(),
            )
            .into());
        }
        if self.materialize.page_size == 0 || self.materialize.progress_interval == 0 {
            return Err(SystemError::Configuration(
                "materialize.page_size and materialize.progress_interval must be greater than zero"
                    .to_string(),
            )
            .into());
        }
        if self.retry.schedule_secs.is_empty() {
            return Err(SystemError::Configuration(
                "retry.schedule_secs must not be empty".to_string(),
            )
            .into());
        }

        let Collaborators {
            store,
            transport,
            recipients,
            renderer,
            notifier,
            clock,
        } = collaborators;

        self.runtime = Some(Runtime {
            store,
            transport,
            recipients,
            renderer,
            notifier,
            clock,
            rate_limiter: RateLimiter::new(self.rate_limit.clone()),
            tenants: TenantLimiter::new(),
            scheduler: Scheduler::new(),
            materializing: DashSet::new(),
            dispatching: DashSet::new(),
            in_flight: DashMap::new(),
        });

        internal!(
            "Campaign processor initialised with batch_size={}, batch_delay={}s, canary_threshold={}, max_retries={}",
            self.dispatch.batch_size,
            self.dispatch.batch_delay_secs,
            self.risk.canary_threshold,
            self.retry.max_retries
        );

        Ok(())
    }

    pub(crate) fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or_else(|| {
            SystemError::NotInitialized(
                "Campaign processor not initialized. Call init() first.".to_string(),
            )
            .into()
        })
    }

    /// The backing store
    ///
    /// # Errors
    ///
    /// If the processor has not been initialised
    pub fn store(&self) -> Result<&Arc<dyn CampaignStore>> {
        Ok(&self.runtime()?.store)
    }

    /// The delayed job queue
    ///
    /// # Errors
    ///
    /// If the processor has not been initialised
    pub fn scheduler(&self) -> Result<&Scheduler> {
        Ok(&self.runtime()?.scheduler)
    }

    /// # Errors
    ///
    /// If the processor has not been initialised
    pub fn rate_limiter(&self) -> Result<&RateLimiter> {
        Ok(&self.runtime()?.rate_limiter)
    }

    /// Per-account concurrency limits
    ///
    /// # Errors
    ///
    /// If the processor has not been initialised
    pub fn tenants(&self) -> Result<&TenantLimiter> {
        Ok(&self.runtime()?.tenants)
    }

    pub(crate) const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Queue a per-send job and remember it as in flight
    pub(crate) fn enqueue_send(
        &self,
        runtime: &Runtime,
        campaign: &ember_store::Campaign,
        send_id: SendId,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        runtime.track(campaign.id, send_id);
        runtime.scheduler.schedule_at(
            Job::SendEmail {
                send_id,
                campaign_id: campaign.id,
                account_id: campaign.account_id,
            },
            at,
        );
    }

    /// Queue the dispatcher for a campaign
    pub(crate) fn schedule_dispatch(&self, runtime: &Runtime, id: CampaignId, delay: Duration) {
        runtime
            .scheduler
            .schedule_in(Job::Dispatch(id), runtime.clock.now(), delay);
    }

    /// Run one job to completion, logging (not returning) its failure
    pub async fn execute(&self, job: Job) {
        let result = match job {
            Job::Dispatch(id) => self.dispatch(&id).await.map(drop),
            Job::SendEmail {
                send_id,
                campaign_id,
                account_id,
            } => self
                .deliver(&send_id, &campaign_id, &account_id)
                .await
                .map(drop),
            Job::Retry(id) => self.retry_send(&id).await.map(drop),
            Job::StartScheduled(id) => self.start_scheduled(&id).await.map(drop),
            Job::Materialize(id) => self.materialize(&id).await.map(drop),
        };

        if let Err(e) = result {
            tracing::error!(job = job.kind(), ?job, error = %e, "Job failed");
        }
    }

    /// Execute every job that is due now, including jobs that become due
    /// while doing so, one at a time. Returns the number of jobs run.
    ///
    /// # Errors
    ///
    /// If the processor has not been initialised
    pub async fn run_pending(&self) -> Result<usize> {
        let runtime = self.runtime()?;
        let mut ran = 0;

        loop {
            let jobs = runtime.scheduler.pop_due(runtime.clock.now());
            if jobs.is_empty() {
                break;
            }

            ran += jobs.len();
            for job in jobs {
                self.execute(job).await;
            }
        }

        Ok(ran)
    }

    /// Pick campaigns back up after a restart: arm scheduled starts, restart
    /// dispatch for sending campaigns and re-queue canary samples.
    ///
    /// # Errors
    ///
    /// If the store cannot be read
    pub async fn recover(&self) -> Result<()> {
        let runtime = self.runtime()?;
        let store = &runtime.store;

        for campaign in store.campaigns(Some(CampaignStatus::Scheduled)).await? {
            let at = campaign.scheduled_at.unwrap_or_else(|| runtime.clock.now());
            runtime.scheduler.schedule_at(Job::StartScheduled(campaign.id), at);
        }

        for status in [CampaignStatus::CanaryProcessing, CampaignStatus::Sending] {
            for campaign in store.campaigns(Some(status)).await? {
                if let Some(canary) = &campaign.canary_send_ids {
                    let pending: HashSet<_> =
                        store.pending_send_ids(&campaign.id).await?.into_iter().collect();
                    for send_id in canary.iter().filter(|id| pending.contains(*id)) {
                        self.enqueue_send(runtime, &campaign, *send_id, runtime.clock.now());
                    }
                }

                if status == CampaignStatus::Sending {
                    if campaign.preparation_complete() {
                        self.schedule_dispatch(runtime, campaign.id, Duration::ZERO);
                    } else {
                        runtime.scheduler.schedule_at(
                            Job::Materialize(campaign.id),
                            runtime.clock.now(),
                        );
                    }
                }
            }
        }

        internal!(
            level = INFO,
            "Recovered campaign state, {} jobs queued",
            runtime.scheduler.len()
        );

        Ok(())
    }

    /// Run the campaign processor
    ///
    /// Due jobs are spawned onto their own tasks; per-send jobs wait on their
    /// account's concurrency limit inside the task. The monitors run on their
    /// own intervals.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop pulling due jobs and running monitors
    /// 2. Wait for running jobs to finish (bounded by `shutdown_timeout_secs`)
    /// 3. Abort whatever is left and exit
    ///
    /// # Errors
    ///
    /// Returns an error if the processor was not initialised or recovery fails
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all)]
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<()> {
        internal!("Campaign processor starting");

        let runtime = self.runtime()?;
        self.recover().await?;

        let mut review_timer = tokio::time::interval(self.monitor.review_interval());
        let mut canary_timer = tokio::time::interval(self.monitor.canary_interval());
        let mut kill_switch_timer = tokio::time::interval(self.monitor.kill_switch_interval());

        // Skip the first tick to avoid immediate execution
        review_timer.tick().await;
        canary_timer.tick().await;
        kill_switch_timer.tick().await;

        let mut tasks = JoinSet::new();

        loop {
            let now = runtime.clock.now();
            for job in runtime.scheduler.pop_due(now) {
                let this = Arc::clone(&self);
                tasks.spawn(async move { this.execute(job).await });
            }

            let idle = runtime.scheduler.next_due().map_or(MAX_IDLE, |due| {
                (due - now).to_std().unwrap_or(Duration::ZERO).min(MAX_IDLE)
            });

            tokio::select! {
                () = tokio::time::sleep(idle) => {}
                () = runtime.scheduler.notified() => {}
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!("Campaign job panicked or was cancelled: {e}");
                    }
                }
                _ = review_timer.tick() => {
                    if let Err(e) = self.process_review_queue().await {
                        tracing::error!("Error processing review queue: {e}");
                    }
                }
                _ = canary_timer.tick() => {
                    if let Err(e) = self.process_canaries().await {
                        tracing::error!("Error analysing canary batches: {e}");
                    }
                }
                _ = kill_switch_timer.tick() => {
                    if let Err(e) = self.process_kill_switch().await {
                        tracing::error!("Error running kill-switch checks: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Campaign processor received shutdown signal");
                            self.drain(&mut tasks).await;
                            internal!("Campaign processor shutdown complete");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Campaign processor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        internal!(
            level = INFO,
            "Waiting for {} running campaign jobs to complete",
            tasks.len()
        );

        let drained = tokio::time::timeout(self.shutdown_timeout(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Shutdown timeout exceeded, aborting remaining campaign jobs"
            );
            tasks.abort_all();
        } else {
            internal!("All running campaign jobs completed");
        }
    }
}
