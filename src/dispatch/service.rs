use super::{Detector, Trigger, WorkerPool};
use crate::cache::ChangeDetector;
use crate::config::Config;
use crate::machine::RunStateMachine;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run the site worker until `shutdown` resolves.
///
/// Two interval tickers (poll and monitor) feed one detection queue. The
/// queue is consumed by this task alone, so detection passes never overlap.
/// Each detected dispatch is submitted to its execution partition. Ticks that
/// find the detection queue full are skipped.
///
/// On shutdown the tickers stop, the partitions are closed and queued steps
/// finish before this returns.
pub async fn run_worker<F>(
    config: &Config,
    detector: Detector,
    machine: RunStateMachine,
    cache: ChangeDetector,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    if config.reset_cache_on_start {
        match cache.reset().await {
            Ok(cleared) => tracing::info!(cleared, "Status cache reset"),
            Err(err) => tracing::warn!(error = %err, "Failed to reset status cache"),
        }
    }

    let pool = WorkerPool::spawn(
        machine,
        cache.clone(),
        config.partitions,
        config.queue_depth,
        config.step_timeout,
    );
    tracing::info!(
        site_uid = %config.site_uid,
        router = %config.router.url,
        partitions = pool.partitions(),
        cache = cache.backend_name(),
        poll_secs = config.poll_interval.as_secs(),
        monitor_secs = config.monitor_interval.as_secs(),
        "Worker started"
    );

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(2);
    let tickers = [
        spawn_ticker(Trigger::Poll, config.poll_interval, false, trigger_tx.clone()),
        spawn_ticker(Trigger::Monitor, config.monitor_interval, true, trigger_tx),
    ];

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, draining partitions");
                break;
            }
            trigger = trigger_rx.recv() => {
                let Some(trigger) = trigger else { break };
                let detected = match trigger {
                    Trigger::Poll => detector.detect_changes().await,
                    Trigger::Monitor => detector.detect_stalled().await,
                };
                match detected {
                    Ok(dispatches) => {
                        for dispatch in dispatches {
                            pool.submit(dispatch).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(pass = %trigger, error = %err, "Detection pass failed");
                    }
                }
            }
        }
    }

    for ticker in tickers {
        ticker.abort();
    }
    pool.shutdown().await;
    tracing::info!("Worker stopped");
    Ok(())
}

fn spawn_ticker(
    trigger: Trigger,
    period: Duration,
    skip_first: bool,
    tx: mpsc::Sender<Trigger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if skip_first {
            interval.tick().await;
        }
        loop {
            interval.tick().await;
            match tx.try_send(trigger) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(pass = %trigger, "Detection queue busy, skipping tick");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}
