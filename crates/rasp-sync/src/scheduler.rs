//! Tick scheduler interleaving harvesting and camouflage cycles.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::{is_browser_unavailable, HarvestPipeline};

/// Counters and the in-flight flag, passed explicitly through the tick
/// function so tests can inject arbitrary starting phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    pub harvest_ticks: u32,
    pub camouflage_ticks: u32,
    pub busy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickThresholds {
    pub harvest: u32,
    pub camouflage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Idle,
    Harvest,
    Camouflage,
}

/// One scheduler tick. While a harvesting cycle is in flight both
/// counters are suspended, so camouflage never fires mid-harvest and a
/// second harvest can never start. The busy flag is cleared by
/// [`finish_harvest`] once the cycle ends, success or failure.
pub fn plan_tick(state: &mut SchedulerState, thresholds: TickThresholds) -> TickAction {
    if state.busy {
        return TickAction::Idle;
    }
    state.harvest_ticks += 1;
    state.camouflage_ticks += 1;

    if state.harvest_ticks >= thresholds.harvest.max(1) {
        state.harvest_ticks = 0;
        state.busy = true;
        return TickAction::Harvest;
    }
    if state.camouflage_ticks >= thresholds.camouflage.max(1) {
        state.camouflage_ticks = 0;
        return TickAction::Camouflage;
    }
    TickAction::Idle
}

pub fn finish_harvest(state: &mut SchedulerState) {
    state.busy = false;
}

/// Counters start at a wall-clock-derived phase so restarted processes
/// do not all fire their first harvest on the same tick.
pub fn seeded_state(now: DateTime<Utc>, thresholds: TickThresholds) -> SchedulerState {
    let minute = (now.timestamp() / 60).unsigned_abs() as u32;
    SchedulerState {
        harvest_ticks: minute % thresholds.harvest.max(1),
        camouflage_ticks: minute % thresholds.camouflage.max(1),
        busy: false,
    }
}

/// Drive ticks from a cron expression until a termination signal, or
/// until a cycle reports the browser service gone. Soft cycle failures
/// are logged and the next tick proceeds; an unavailable browser has
/// already exhausted its backoff budget, so re-burning it every tick
/// helps nobody and the loop stops with the error instead.
pub async fn run_scheduler(
    pipeline: Arc<HarvestPipeline>,
    thresholds: TickThresholds,
    tick_cron: &str,
) -> Result<()> {
    let state = Arc::new(Mutex::new(seeded_state(Utc::now(), thresholds)));
    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(1);
    info!(
        cron = tick_cron,
        harvest_threshold = thresholds.harvest,
        camouflage_threshold = thresholds.camouflage,
        "starting scheduler"
    );

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(tick_cron, move |_uuid, _lock| {
        let state = Arc::clone(&state);
        let pipeline = Arc::clone(&pipeline);
        let fatal_tx = fatal_tx.clone();
        Box::pin(async move {
            let action = plan_tick(&mut *state.lock().await, thresholds);
            match action {
                TickAction::Idle => debug!("tick: idle"),
                TickAction::Harvest => {
                    info!("tick: harvesting cycle starting");
                    if let Err(err) = pipeline.run_cycle().await {
                        if is_browser_unavailable(&err) {
                            let _ = fatal_tx.send(err).await;
                        } else {
                            error!(error = %format!("{err:#}"), "harvesting cycle failed");
                        }
                    }
                    finish_harvest(&mut *state.lock().await);
                }
                TickAction::Camouflage => {
                    info!("tick: camouflage cycle");
                    if let Err(err) = pipeline.run_camouflage().await {
                        if is_browser_unavailable(&err) {
                            let _ = fatal_tx.send(err).await;
                        } else {
                            warn!(error = %format!("{err:#}"), "camouflage cycle failed");
                        }
                    }
                }
            }
        })
    })
    .with_context(|| format!("creating tick job for cron {tick_cron}"))?;
    sched.add(job).await.context("adding tick job")?;
    sched.start().await.context("starting scheduler")?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for termination signal")?;
            info!("termination signal received, shutting down scheduler");
            Ok(())
        }
        fatal = fatal_rx.recv() => match fatal {
            Some(err) => {
                error!(error = %format!("{err:#}"), "browser service unavailable, stopping scheduler");
                Err(err.context("scheduler stopped"))
            }
            None => Ok(()),
        },
    };
    sched.shutdown().await.context("shutting down scheduler")?;
    outcome
}
