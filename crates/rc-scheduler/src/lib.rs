//! Clustered job scheduler
//!
//! Runs the core's periodic jobs (pollers, repair, alerts) on fixed-delay
//! tickers. Jobs are registered explicitly in a startup table, never
//! discovered. A job runs in one of two modes:
//!
//! - `Concurrent`: every node fires the job on its own ticker.
//! - `NotConcurrent`: at most one node in the cluster fires per tick,
//!   decided by a [`FiringGuard`] lease.
//!
//! The scheduler is inert until both `start()` and `app_ready()` have been
//! called, and `standby()` suspends firing without tearing the tickers down
//! so a node can leave and rejoin active duty.

pub mod guard;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rc_common::{CoreError, Result};
use rc_config::ClusterConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

pub use guard::{FiringGuard, LocalFiringGuard, RedisFiringGuard};

/// How a job behaves when several nodes run the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobExecutionMode {
    /// Fires on every node independently.
    Concurrent,
    /// Fires on at most one node per tick, arbitrated by the firing guard.
    NotConcurrent,
}

impl JobExecutionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "concurrent" => Some(Self::Concurrent),
            "not_concurrent" => Some(Self::NotConcurrent),
            _ => None,
        }
    }
}

/// One unit of periodic work.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self) -> Result<()>;
}

/// Registration record for a job: name, default mode and timing.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub mode: JobExecutionMode,
    /// Wait before the very first firing
    pub initial_delay: Duration,
    /// Fixed delay between firings
    pub interval: Duration,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, mode: JobExecutionMode, interval: Duration) -> Self {
        Self {
            name: name.into(),
            mode,
            initial_delay: Duration::ZERO,
            interval,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }
}

struct RegisteredJob {
    spec: JobSpec,
    handler: Arc<dyn JobHandler>,
}

/// Explicit job table. Every job the core runs is registered here at
/// startup; there is no annotation scanning or runtime discovery.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Vec<RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: JobSpec, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.jobs.iter().any(|j| j.spec.name == spec.name) {
            return Err(CoreError::Config(format!(
                "job {:?} is already registered",
                spec.name
            )));
        }
        self.jobs.push(RegisteredJob { spec, handler });
        Ok(())
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.spec.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Scheduler timing and per-job mode overrides.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Staggers node boot before the first NOT_CONCURRENT claim, so a
    /// freshly restarted node does not immediately steal every lease
    pub startup_delay: Duration,
    /// Configuration wins over the registered default mode
    pub mode_overrides: HashMap<String, JobExecutionMode>,
}

impl SchedulerConfig {
    pub fn from_cluster_config(cluster: &ClusterConfig) -> Self {
        let mode_overrides = cluster
            .job_modes
            .iter()
            .filter_map(|(name, mode)| {
                JobExecutionMode::parse(mode).map(|m| (name.clone(), m))
            })
            .collect();
        Self {
            startup_delay: Duration::from_secs(cluster.startup_delay_secs),
            mode_overrides,
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    guard: Arc<dyn FiringGuard>,
    ready: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
    started: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, guard: Arc<dyn FiringGuard>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            guard,
            ready: Arc::new(AtomicBool::new(false)),
            suspended: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            shutdown_tx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn one ticker task per registered job. Firing stays gated on
    /// [`app_ready`](Self::app_ready); calling `start` alone runs nothing.
    pub fn start(&self, registry: JobRegistry) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Config("scheduler already started".to_string()));
        }

        info!(jobs = registry.len(), "Starting scheduler");
        let mut handles = self.handles.lock();
        for job in registry.jobs {
            let mode = self
                .config
                .mode_overrides
                .get(&job.spec.name)
                .copied()
                .unwrap_or(job.spec.mode);
            handles.push(tokio::spawn(run_job(
                job,
                mode,
                self.guard.clone(),
                self.ready.clone(),
                self.suspended.clone(),
                self.config.startup_delay,
                self.shutdown_tx.subscribe(),
            )));
        }
        Ok(())
    }

    /// Second half of the startup handshake: jobs only fire once the
    /// embedding application reports it is ready to serve.
    pub fn app_ready(&self) {
        info!("Application ready, scheduler jobs may fire");
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Suspend firing without stopping the tickers.
    pub fn standby(&self) {
        info!("Scheduler entering standby");
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Leave standby and resume firing on the next tick.
    pub fn resume(&self) {
        info!("Scheduler resuming from standby");
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Stop all tickers and wait for in-flight executions to finish.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler");
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_job(
    job: RegisteredJob,
    mode: JobExecutionMode,
    guard: Arc<dyn FiringGuard>,
    ready: Arc<AtomicBool>,
    suspended: Arc<AtomicBool>,
    startup_delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let name = job.spec.name.as_str();

    // NOT_CONCURRENT jobs wait out the startup stagger on top of their own
    // initial delay before competing for leases.
    let mut first_delay = job.spec.initial_delay;
    if mode == JobExecutionMode::NotConcurrent {
        first_delay += startup_delay;
    }
    if !first_delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(first_delay) => {}
            _ = shutdown_rx.recv() => return,
        }
    }

    let mut ticker = tokio::time::interval(job.spec.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    debug!(job = name, ?mode, interval = ?job.spec.interval, "Job ticker running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !ready.load(Ordering::SeqCst) || suspended.load(Ordering::SeqCst) {
                    trace!(job = name, "Skipping tick, scheduler not active");
                    continue;
                }

                if mode == JobExecutionMode::NotConcurrent {
                    match guard.try_claim(name).await {
                        Ok(true) => {}
                        Ok(false) => {
                            trace!(job = name, "Another node holds the firing lease");
                            continue;
                        }
                        Err(e) => {
                            error!(job = name, error = %e, "Firing lease check failed");
                            continue;
                        }
                    }
                }

                // Executions run inline on the ticker task, so a slow job
                // cannot overlap itself on this node.
                if let Err(e) = job.handler.execute().await {
                    error!(job = name, error = %e, "Job execution failed");
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(job = name, "Job ticker stopped");
                return;
            }
        }
    }
}
