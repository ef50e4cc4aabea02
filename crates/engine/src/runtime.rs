//! Runtime loop (spec §5): drives the `EventEngine` tick and the
//! `Monitor` poll on their own independent timers until shutdown,
//! mirroring the teacher's broadcast-shutdown handle split between a
//! blocking `run_standalone` and a backgroundable `spawn`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::startup::Engine;

pub struct RuntimeHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs the engine in the foreground until `ctrl_c` fires.
pub async fn run_standalone(engine: Arc<Engine>) -> EngineResult<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    info!("leasemgr engine starting");
    run_until_shutdown(engine, shutdown_rx).await
}

/// Spawns the engine loop in the background, returning a handle the
/// caller uses to shut it down — for embedders (tests, a future in-process
/// host) that don't want their own process to be the engine's lifetime.
pub fn spawn(engine: Arc<Engine>) -> RuntimeHandle {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let task = tokio::spawn(async move {
        if let Err(error) = run_until_shutdown(engine, shutdown_rx).await {
            warn!(error = %error, "engine runtime terminated unexpectedly");
        }
    });
    RuntimeHandle { shutdown_tx, task: Some(task) }
}

async fn run_until_shutdown(
    engine: Arc<Engine>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> EngineResult<()> {
    engine.event_engine.recover_in_progress(chrono::Utc::now()).await?;

    let mut event_ticker = tokio::time::interval(engine.config.event_interval());
    let mut monitor_ticker = tokio::time::interval(engine.config.monitor_interval());
    event_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    monitor_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = event_ticker.tick() => {
                if let Err(error) = engine.event_engine.process_due_events(chrono::Utc::now()).await {
                    warn!(error = %error, "event tick failed");
                }
            }
            _ = monitor_ticker.tick() => {
                if let Err(error) = engine.monitor.poll().await {
                    warn!(error = %error, "monitor poll failed");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("leasemgr engine shutting down");
                return Ok(());
            }
        }
    }
}
