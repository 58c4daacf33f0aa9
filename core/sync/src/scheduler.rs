//! Background tasks driving the engine: one per queue, plus network sampling
//! and the expiry sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use offsync_common::Priority;

use crate::engine::{SkipReason, SyncEngine};

/// Spawns and owns the engine's periodic loops.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Start all loops on the current tokio runtime.
    pub fn spawn(engine: Arc<SyncEngine>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(Priority::ALL.len() + 2);

        for tier in Priority::ALL {
            tasks.push(tokio::spawn(run_queue(
                engine.clone(),
                tier,
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_network_sampler(
            engine.clone(),
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(run_expiry_sweep(engine, shutdown_rx)));

        info!("Sync scheduler started");
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle to the running loops.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Signal every loop to stop and wait for them to exit.
    ///
    /// A cycle already in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Sync scheduler stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_queue(engine: Arc<SyncEngine>, tier: Priority, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = ticker(engine.config().queues.get(tier).interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = engine.wakeup(tier).notified() => debug!(%tier, "Queue woken"),
            _ = ticks.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match engine.run_cycle(tier).await {
            Ok(report) => match report.skipped {
                None | Some(SkipReason::NotDue) => {}
                Some(reason) => debug!(%tier, ?reason, "Queue cycle skipped"),
            },
            Err(e) => error!(%tier, "Queue cycle failed: {}", e),
        }
    }
    debug!(%tier, "Queue loop stopped");
}

async fn run_network_sampler(engine: Arc<SyncEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = ticker(engine.config().network_sample_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {
                engine.sample_network().await;
            }
        }
    }
}

async fn run_expiry_sweep(engine: Arc<SyncEngine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = ticker(engine.config().expiry_sweep_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {
                if let Err(e) = engine.sweep_expired().await {
                    error!("Expiry sweep failed: {}", e);
                }
            }
        }
    }
}
