//! Service mode: periodic backups plus the HTTP control surface
//!
//! The scheduler and the control surface share one [`BackupOrchestrator`], so
//! scheduled and manual runs contend for the same run lock. A tick that finds
//! a run already in progress is skipped rather than queued.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backup::{BackupError, BackupOrchestrator, BackupSummary};
use crate::config::Config;
use crate::server::{self, AppState};
use crate::status::TriggerSource;

pub struct Scheduler {
    orchestrator: Arc<BackupOrchestrator>,
    interval: Duration,
    run_on_start: bool,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, interval: Duration, run_on_start: bool) -> Self {
        Self {
            orchestrator,
            interval,
            run_on_start,
        }
    }

    pub fn from_config(orchestrator: Arc<BackupOrchestrator>, config: &Config) -> Result<Self> {
        let interval = config
            .schedule_interval()
            .context("Failed to parse backup interval")?;
        Ok(Self::new(orchestrator, interval, config.backup.run_on_start))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one scheduled backup; `None` when skipped or failed
    pub async fn tick(&self) -> Option<BackupSummary> {
        debug!("Starting scheduled backup");

        match self.orchestrator.run(TriggerSource::Schedule).await {
            Ok(summary) => Some(summary),
            Err(BackupError::AlreadyRunning) => {
                info!("Skipping scheduled backup: a run is already in progress");
                None
            }
            Err(BackupError::Fatal(e)) => {
                error!("Scheduled backup failed: {:#}", e);
                None
            }
        }
    }

    /// Tick every interval until `shutdown` fires; an in-flight run finishes first
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler started with interval: {:?}", self.interval);

        // The first tick completes immediately
        if !self.run_on_start {
            timer.tick().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received in scheduler");
                    break;
                }

                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Scheduler exiting");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!("Failed to listen for ctrl-c: {}", e);
                        }
                        debug!("Ctrl+C received");
                    }
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    debug!("Ctrl+C received");
}

/// Run the scheduler and, when enabled, the control surface until a signal arrives
pub async fn run_service(config: Config) -> Result<()> {
    let orchestrator = Arc::new(
        BackupOrchestrator::from_config(&config).context("Failed to initialize backup pipeline")?,
    );
    let scheduler = Scheduler::from_config(orchestrator.clone(), &config)?;

    let (shutdown_sender, _) = broadcast::channel(1);
    let signal_sender = shutdown_sender.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown signal received, stopping service...");
        let _ = signal_sender.send(());
    });

    if !config.server.enabled {
        info!("Control surface disabled");
        return scheduler.run(shutdown_sender.subscribe()).await;
    }

    let addr = server::bind_addr(&config.server)?;
    let app = server::router(AppState::new(orchestrator));
    let mut server_shutdown = shutdown_sender.subscribe();
    let mut server_task = tokio::spawn(server::serve(addr, app, async move {
        let _ = server_shutdown.recv().await;
    }));

    let scheduled = scheduler.run(shutdown_sender.subscribe());
    tokio::pin!(scheduled);

    tokio::select! {
        result = &mut scheduled => {
            let _ = shutdown_sender.send(());
            let served = server_task.await.context("Control surface task failed")?;
            result.and(served)
        }
        served = &mut server_task => {
            let served = served.context("Control surface task failed")?;
            let _ = shutdown_sender.send(());
            let result = scheduled.await;
            served
                .and_then(|_| Err::<(), anyhow::Error>(anyhow!("Control surface stopped unexpectedly")))
                .and(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RunPhase;
    use crate::test_support::{orchestrator, MemoryStore, StaticLister};
    use tempfile::TempDir;

    fn scheduled(
        work: &TempDir,
        store: Arc<MemoryStore>,
        interval: Duration,
        run_on_start: bool,
    ) -> (Scheduler, Arc<BackupOrchestrator>) {
        let orch = Arc::new(orchestrator(
            work,
            Arc::new(StaticLister::named(&["alpha"])),
            store,
            &[],
        ));
        (Scheduler::new(orch.clone(), interval, run_on_start), orch)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_tick_runs_backup() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (scheduler, orch) = scheduled(&work, store.clone(), Duration::from_secs(3600), false);

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.uploads().len(), 1);
        assert_eq!(orch.status().snapshot().trigger, Some(TriggerSource::Schedule));
    }

    #[tokio::test]
    async fn test_tick_skips_when_run_in_progress() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (scheduler, orch) = scheduled(&work, store.clone(), Duration::from_secs(3600), false);

        let _ticket = orch.try_begin(TriggerSource::Manual).unwrap();
        let before = orch.status().snapshot();

        assert!(scheduler.tick().await.is_none());
        assert!(store.uploads().is_empty());
        assert_eq!(*orch.status().snapshot(), *before);
    }

    #[tokio::test]
    async fn test_run_on_start_then_shutdown() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (scheduler, orch) = scheduled(&work, store.clone(), Duration::from_secs(3600), true);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        wait_until(|| orch.status().snapshot().phase == RunPhase::Completed).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(store.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_first_tick_waits_for_interval() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (scheduler, orch) = scheduled(&work, store.clone(), Duration::from_secs(3600), false);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(store.uploads().is_empty());
        assert_eq!(orch.status().snapshot().phase, RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_repeats_every_interval() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (scheduler, _orch) = scheduled(&work, store.clone(), Duration::from_millis(30), false);

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        let uploads = store.clone();
        wait_until(move || uploads.uploads().len() >= 2).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_from_config_rejects_zero_interval() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::default());
        let (_, orch) = scheduled(&work, store, Duration::from_secs(1), false);

        let mut config = Config::default();
        config.backup.interval = "0s".to_string();
        assert!(Scheduler::from_config(orch.clone(), &config).is_err());

        config.backup.interval = "2h".to_string();
        let scheduler = Scheduler::from_config(orch, &config).unwrap();
        assert_eq!(scheduler.interval(), Duration::from_secs(7200));
    }
}
