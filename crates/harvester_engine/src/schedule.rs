//! Single-flight harvest scheduler.
//!
//! One gate guards every harvest, whether fired by the timer loop, a manual
//! trigger or a bot command. Losers of the race return at once and nothing
//! is queued.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use harvester_core::{partition_drafts, HarvestRequest, SaveSummary, VideoDraft};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::delivery::{DeliveryEngine, DeliveryError, SweepReport};
use crate::harvest::{HarvestError, Harvester};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Listing pages walked by each scheduled cycle.
    pub pages: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(15 * 60),
            pages: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// What one harvest-persist-deliver cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub found: usize,
    pub invalid: usize,
    /// `None` when nothing was saved or the save failed.
    pub save: Option<SaveSummary>,
    /// `None` when the sweep was skipped or failed.
    pub delivery: Option<SweepReport>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted(CycleReport),
    /// Another cycle held the gate.
    Skipped,
}

/// Result of a manual harvest spawned through [`Scheduler::spawn_harvest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestReport {
    pub request: HarvestRequest,
    pub found: usize,
    pub invalid: usize,
    pub saved: usize,
    pub duplicates: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ManualHarvestError {
    /// Cancelled midway; whatever was collected before that is saved.
    #[error("harvest cancelled after {} found, {} saved", .0.found, .0.saved)]
    Cancelled(HarvestReport),
    #[error(transparent)]
    Harvest(#[from] HarvestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lowers the running flag when the cycle that raised it ends, however it ends.
struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct LoopTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    harvester: Arc<dyn Harvester>,
    store: Arc<dyn Store>,
    delivery: Arc<DeliveryEngine>,
    settings: SchedulerSettings,
    gate: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    loop_task: std::sync::Mutex<Option<LoopTask>>,
}

impl Scheduler {
    pub fn new(
        harvester: Arc<dyn Harvester>,
        store: Arc<dyn Store>,
        delivery: Arc<DeliveryEngine>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            harvester,
            store,
            delivery,
            settings,
            gate: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            loop_task: std::sync::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        if self.is_running() {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Spawn the timer loop: one cycle after the initial delay, then one per
    /// interval. `cancel` is handed to every cycle; [`Scheduler::stop`] only
    /// ends the waiting between cycles.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) {
        let Ok(mut slot) = self.loop_task.lock() else {
            engine_error!("scheduler loop slot poisoned, not starting");
            return;
        };
        if slot.is_some() {
            engine_warn!("scheduler already started");
            return;
        }
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_loop(stop.clone(), cancel.clone()));
        *slot = Some(LoopTask { stop, handle });
    }

    /// End the timer loop and wait for it to unwind. A cycle already past the
    /// gate runs to completion first.
    pub async fn stop(&self) {
        let task = match self.loop_task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(task) = task else {
            return;
        };
        engine_info!("scheduler stopping");
        task.stop.cancel();
        if let Err(err) = task.handle.await {
            engine_error!("scheduler loop ended abnormally error={}", err);
        }
        engine_info!("scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>, stop: CancellationToken, cancel: CancellationToken) {
        let SchedulerSettings {
            initial_delay,
            interval,
            pages,
        } = self.settings.clone();
        engine_info!(
            "scheduler started initial_delay={:?} interval={:?} pages={}",
            initial_delay,
            interval,
            pages
        );

        tokio::select! {
            _ = stop.cancelled() => {
                engine_info!("scheduler stopped during initial delay");
                return;
            }
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }
        self.try_run(pages, &cancel).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.try_run(pages, &cancel).await;
                }
            }
        }
        engine_debug!("scheduler loop exited");
    }

    /// Run one cycle now unless one is already running.
    pub async fn try_run(&self, pages: u32, cancel: &CancellationToken) -> TriggerOutcome {
        let Ok(_gate) = Arc::clone(&self.gate).try_lock_owned() else {
            engine_info!("scheduler trigger skipped, a harvest is already running");
            return TriggerOutcome::Skipped;
        };
        let _running = RunningFlag::raise(&self.running);
        TriggerOutcome::Accepted(self.run_cycle(pages, cancel).await)
    }

    /// Start a manual harvest under the same gate as the timer loop. `None`
    /// when the gate is held; otherwise the handle resolves once the harvested
    /// records are saved. Delivery is left to the next cycle.
    pub fn spawn_harvest(
        self: &Arc<Self>,
        request: HarvestRequest,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<Result<HarvestReport, ManualHarvestError>>> {
        let Ok(gate) = Arc::clone(&self.gate).try_lock_owned() else {
            engine_info!(
                "scheduler manual harvest skipped request={}",
                request.describe()
            );
            return None;
        };
        let running = RunningFlag::raise(&self.running);
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _gate = gate;
            let _running = running;
            this.run_manual(request, &cancel).await
        }))
    }

    async fn run_cycle(&self, pages: u32, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        engine_info!("scheduler cycle start pages={}", pages);
        let mut report = CycleReport::default();

        let drafts = match self.harvester.harvest_new_listing(pages, cancel).await {
            Ok(drafts) => drafts,
            Err(HarvestError::Cancelled { partial }) => {
                engine_warn!("scheduler harvest cancelled partial={}", partial.len());
                report.cancelled = true;
                partial
            }
            Err(err) => {
                engine_error!("scheduler harvest failed error={}", err);
                Vec::new()
            }
        };
        report.found = drafts.len();

        let persisted = self.persist(drafts, &mut report).await;
        if persisted && !report.cancelled {
            match self.delivery.sweep_unsent(cancel).await {
                Ok(sweep) => report.delivery = Some(sweep),
                Err(DeliveryError::Cancelled) => report.cancelled = true,
                Err(err) => engine_error!("scheduler delivery sweep failed error={}", err),
            }
        }

        engine_info!(
            "scheduler cycle finished elapsed={:?} found={} saved={} duplicates={} cancelled={}",
            started.elapsed(),
            report.found,
            report.save.map_or(0, |s| s.saved),
            report.save.map_or(0, |s| s.duplicates),
            report.cancelled
        );
        report
    }

    /// Save the valid drafts. `false` only when the store refused the batch.
    async fn persist(&self, drafts: Vec<VideoDraft>, report: &mut CycleReport) -> bool {
        let (videos, invalid) = partition_drafts(drafts);
        report.invalid = invalid.len();
        for rejected in &invalid {
            engine_debug!("scheduler dropped draft error={}", rejected);
        }
        if videos.is_empty() {
            return true;
        }
        match self.store.save_videos(videos).await {
            Ok(summary) => {
                report.save = Some(summary);
                true
            }
            Err(err) => {
                engine_error!("scheduler save failed, skipping delivery error={}", err);
                false
            }
        }
    }

    async fn run_manual(
        &self,
        request: HarvestRequest,
        cancel: &CancellationToken,
    ) -> Result<HarvestReport, ManualHarvestError> {
        let started = Instant::now();
        engine_info!("scheduler manual harvest start request={}", request.describe());

        let harvested = async {
            match &request {
                HarvestRequest::NewListing { pages } => {
                    self.harvester.harvest_new_listing(*pages, cancel).await
                }
                HarvestRequest::Actor { name, limit } => {
                    self.harvester.harvest_by_actor(name, *limit, cancel).await
                }
                HarvestRequest::Keyword { keyword, limit } => {
                    self.harvester.harvest_by_keyword(keyword, *limit, cancel).await
                }
                HarvestRequest::Code { code } => self
                    .harvester
                    .harvest_by_code(code, cancel)
                    .await
                    .map(|draft| vec![draft]),
            }
        };
        let (drafts, cancelled) = match harvested.await {
            Ok(drafts) => (drafts, false),
            Err(HarvestError::Cancelled { partial }) => {
                engine_warn!(
                    "scheduler manual harvest cancelled request={} partial={}",
                    request.describe(),
                    partial.len()
                );
                (partial, true)
            }
            Err(err) => return Err(err.into()),
        };

        let found = drafts.len();
        let (videos, invalid) = partition_drafts(drafts);
        let summary = if videos.is_empty() {
            SaveSummary::default()
        } else {
            self.store.save_videos(videos).await?
        };

        engine_info!(
            "scheduler manual harvest finished request={} elapsed={:?} found={} saved={} duplicates={}",
            request.describe(),
            started.elapsed(),
            found,
            summary.saved,
            summary.duplicates
        );
        let report = HarvestReport {
            request,
            found,
            invalid: invalid.len(),
            saved: summary.saved,
            duplicates: summary.duplicates,
        };
        if cancelled {
            return Err(ManualHarvestError::Cancelled(report));
        }
        Ok(report)
    }
}
