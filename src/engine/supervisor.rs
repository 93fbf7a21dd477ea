//! One supervisor, started once, owning one ticker per background duty.
//!
//! Each ticker runs its cycle inline, so a shutdown request is only seen
//! between cycles: no new cycle starts, and a running one completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::scanner::EscalationScanner;
use super::worker::QueueWorker;
use crate::config::Config;
use crate::error::Result;
use crate::tasks::TaskService;

/// Tick periods and sweep parameters.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub queue_interval: Duration,
    pub queue_batch_size: i64,
    pub scan_interval: Duration,
    pub task_sweep_interval: Duration,
    pub task_expiry_grace: chrono::Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_interval: config.queue.poll_interval,
            queue_batch_size: config.queue.batch_size,
            scan_interval: config.scanner.interval,
            task_sweep_interval: config.tasks.sweep_interval,
            task_expiry_grace: config.tasks.expiry_grace,
        }
    }
}

pub struct Supervisor {
    scanner: Arc<EscalationScanner>,
    worker: Arc<QueueWorker>,
    tasks: Arc<TaskService>,
    schedule: Schedule,
}

/// Handle to the running tickers.
pub struct RunningSupervisor {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        scanner: Arc<EscalationScanner>,
        worker: Arc<QueueWorker>,
        tasks: Arc<TaskService>,
        schedule: Schedule,
    ) -> Self {
        Self {
            scanner,
            worker,
            tasks,
            schedule,
        }
    }

    /// Spawn the tickers. Must be called from within a tokio runtime.
    pub fn start(self) -> RunningSupervisor {
        let (shutdown, rx) = watch::channel(false);
        let Schedule {
            queue_interval,
            queue_batch_size,
            scan_interval,
            task_sweep_interval,
            task_expiry_grace,
        } = self.schedule;

        let worker = self.worker;
        let queue = spawn_ticker("queue", queue_interval, rx.clone(), move || {
            let worker = Arc::clone(&worker);
            async move { worker.process_once(queue_batch_size).await.map(|_| ()) }
        });

        let scanner = self.scanner;
        let scan = spawn_ticker("escalation", scan_interval, rx.clone(), move || {
            let scanner = Arc::clone(&scanner);
            async move {
                let now = Utc::now();
                scanner.scan_due_reminders(now).await?;
                scanner.scan_and_escalate(now).await?;
                Ok(())
            }
        });

        let tasks = self.tasks;
        let sweep = spawn_ticker("task_sweep", task_sweep_interval, rx, move || {
            let tasks = Arc::clone(&tasks);
            async move {
                tasks
                    .expire_overdue(Utc::now(), task_expiry_grace)
                    .await
                    .map(|_| ())
            }
        });

        info!("supervisor started");
        RunningSupervisor {
            shutdown,
            handles: vec![queue, scan, sweep],
        }
    }
}

impl RunningSupervisor {
    /// Stop scheduling cycles and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "ticker task panicked");
            }
        }
        info!("supervisor stopped");
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(ticker = name, period = ?period, "ticker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = cycle().await {
                        error!(ticker = name, error = %e, "cycle failed, retrying next tick");
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!(ticker = name, "ticker stopped");
    })
}
