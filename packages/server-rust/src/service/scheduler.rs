//! Interval scheduler and queued-run consumer.
//!
//! Runs as a [`BackgroundRunnable`]. Each tick compares the wall clock with
//! the previous tick and fires every enabled schedule whose interval boundary
//! was crossed in between. Boundaries are evaluated in UTC. Queued
//! [`SchedulerTask::RunNow`] events run the named Sr as soon as they arrive.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use opflow_core::{ClockSource, ConfigSource, QueryContext, ScheduleInterval, SrId, SrSchedule};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tower::Service;
use tracing::{debug, info, warn};

use crate::service::batch::{BatchItem, BatchRunner};
use crate::service::middleware::OperationPipeline;
use crate::service::operation::{Operation, OperationError, RunReport, TriggerOrigin};
use crate::service::worker::BackgroundRunnable;
use crate::traits::CancellationProbe;

// ---------------------------------------------------------------------------
// Interval boundaries
// ---------------------------------------------------------------------------

/// Intervals whose boundary lies in `(previous, now]`.
///
/// Each interval fires at most once per call, however many boundaries were
/// crossed. `EveryWeekday` fires on a day boundary that lands on Monday
/// through Friday.
#[must_use]
pub fn due_intervals(previous: DateTime<Utc>, now: DateTime<Utc>) -> Vec<ScheduleInterval> {
    if now <= previous {
        return Vec::new();
    }
    let day_crossed = now.date_naive() != previous.date_naive();
    let hour_crossed = day_crossed || now.hour() != previous.hour();
    let minute_crossed = hour_crossed || now.minute() != previous.minute();
    let month_crossed = (now.year(), now.month()) != (previous.year(), previous.month());
    let weekday = now.weekday().number_from_monday() <= 5;

    ScheduleInterval::ALL
        .into_iter()
        .filter(|interval| match interval {
            ScheduleInterval::EveryMinute => minute_crossed,
            ScheduleInterval::EveryHour => hour_crossed,
            ScheduleInterval::EveryDay => day_crossed,
            ScheduleInterval::EveryWeekday => day_crossed && weekday,
            ScheduleInterval::EveryMonth => month_crossed,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// ScheduleProbe
// ---------------------------------------------------------------------------

/// Cancels scheduled and queued work whose Sr was deleted or whose schedule
/// was disabled while it ran.
pub struct ScheduleProbe {
    config_source: Arc<dyn ConfigSource>,
}

impl ScheduleProbe {
    #[must_use]
    pub fn new(config_source: Arc<dyn ConfigSource>) -> Self {
        Self { config_source }
    }
}

#[async_trait]
impl CancellationProbe for ScheduleProbe {
    async fn is_cancelled(&self, sr_id: SrId) -> bool {
        match self.config_source.effective_service_request(sr_id).await {
            Ok(Some(sr)) => sr.schedule.is_some_and(|s| s.disabled),
            Ok(None) => true,
            Err(e) => {
                warn!(sr_id = %sr_id, error = %e, "schedule lookup failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Enabled schedules matching `pick`, skipping Srs already in flight.
async fn collect_items(
    config_source: &dyn ConfigSource,
    in_flight: &Mutex<HashSet<SrId>>,
    pick: impl Fn(&SrSchedule) -> bool,
) -> anyhow::Result<Vec<BatchItem>> {
    let mut items = Vec::new();
    for sr in config_source.list_service_requests().await? {
        let effective = match config_source.effective_service_request(sr.id).await {
            Ok(Some(effective)) => effective,
            Ok(None) => continue,
            Err(e) => {
                warn!(sr_id = %sr.id, error = %e, "skipping unresolvable service request");
                continue;
            }
        };
        let Some(schedule) = effective.schedule.as_ref().filter(|s| !s.disabled) else {
            continue;
        };
        if !pick(schedule) {
            continue;
        }
        if in_flight.lock().contains(&sr.id) {
            debug!(sr_id = %sr.id, "previous scheduled run still in flight");
            continue;
        }
        let mut query = QueryContext::new();
        for (k, v) in &schedule.parameters {
            query.insert(k.clone(), v.clone());
        }
        items.push(BatchItem { sr_id: sr.id, query });
    }
    Ok(items)
}

/// Marks Srs as in flight until dropped, including when the batch task
/// panics or is aborted.
struct InFlightClaim {
    set: Arc<Mutex<HashSet<SrId>>>,
    ids: Vec<SrId>,
}

impl InFlightClaim {
    fn new(set: &Arc<Mutex<HashSet<SrId>>>, ids: Vec<SrId>) -> Self {
        set.lock().extend(ids.iter().copied());
        Self {
            set: Arc::clone(set),
            ids,
        }
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        let mut set = self.set.lock();
        for id in &self.ids {
            set.remove(id);
        }
    }
}

/// Tasks accepted by the scheduler worker.
#[derive(Debug)]
pub enum SchedulerTask {
    /// Run one Sr now (queued "execute immediately" event).
    RunNow { sr_id: SrId, query: QueryContext },
    /// Run every enabled schedule flagged `execute_immediately`.
    RunStartupSchedules,
}

pub struct Scheduler<S = OperationPipeline> {
    config_source: Arc<dyn ConfigSource>,
    runner: BatchRunner<S>,
    clock: Arc<dyn ClockSource>,
    last_tick: DateTime<Utc>,
    /// Srs with a scheduled run in progress; overlapping ticks skip them.
    in_flight: Arc<Mutex<HashSet<SrId>>>,
    runs: JoinSet<()>,
}

impl<S> Scheduler<S>
where
    S: Service<Operation, Response = RunReport, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    #[must_use]
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        runner: BatchRunner<S>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let last_tick = clock.now_utc();
        Self {
            config_source,
            runner,
            clock,
            last_tick,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            runs: JoinSet::new(),
        }
    }

    fn spawn_batch(&mut self, origin: TriggerOrigin, items: Vec<BatchItem>) {
        if items.is_empty() {
            return;
        }
        let claim = InFlightClaim::new(&self.in_flight, items.iter().map(|i| i.sr_id).collect());
        let runner = self.runner.clone();
        self.runs.spawn(async move {
            let report = runner.run_all(origin, items).await;
            drop(claim);
            info!(
                origin = origin.as_str(),
                succeeded = report.succeeded.len(),
                failed = report.failures.len(),
                "scheduled batch finished"
            );
        });
    }

    fn reap(&mut self) {
        while self.runs.try_join_next().is_some() {}
    }

    /// Number of batches and queued runs still running.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl<S> BackgroundRunnable for Scheduler<S>
where
    S: Service<Operation, Response = RunReport, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    type Task = SchedulerTask;

    async fn run(&mut self, task: SchedulerTask) {
        self.reap();
        match task {
            SchedulerTask::RunNow { sr_id, query } => {
                let runner = self.runner.clone();
                self.runs.spawn(async move {
                    match runner.run_one(TriggerOrigin::Queued, BatchItem { sr_id, query }).await {
                        Ok(report) => info!(
                            sr_id = %sr_id,
                            run_id = %report.run_id,
                            inserted = report.items_inserted,
                            "queued run finished"
                        ),
                        Err(failure) => warn!(
                            sr_id = %sr_id,
                            kind = failure.kind,
                            error = %failure.message,
                            "queued run failed"
                        ),
                    }
                });
            }
            SchedulerTask::RunStartupSchedules => match collect_items(
                self.config_source.as_ref(),
                &self.in_flight,
                |s| s.execute_immediately,
            )
            .await
            {
                Ok(items) => {
                    info!(count = items.len(), "running execute-immediately schedules");
                    self.spawn_batch(TriggerOrigin::Schedule, items);
                }
                Err(e) => warn!(error = %e, "failed to list service requests"),
            },
        }
    }

    async fn on_tick(&mut self) {
        self.reap();
        let now = self.clock.now_utc();
        let due = due_intervals(self.last_tick, now);
        self.last_tick = now;
        if due.is_empty() {
            return;
        }
        debug!(?due, "schedule boundaries crossed");
        let picked = collect_items(self.config_source.as_ref(), &self.in_flight, |s| {
            due.contains(&s.interval)
        })
        .await;
        match picked {
            Ok(items) => self.spawn_batch(TriggerOrigin::Schedule, items),
            Err(e) => warn!(error = %e, "failed to list service requests"),
        }
    }

    async fn shutdown(&mut self) {
        while self.runs.join_next().await.is_some() {}
        info!("scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
