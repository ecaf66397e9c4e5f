use std::time::Instant;

use log::{error, info};
use tokio::{
    net::lookup_host,
    sync::broadcast,
    time::MissedTickBehavior,
};

use crate::{
    config::LorisConfig,
    connection::CloseReason,
    error::HarnessError,
    pool::ConnectionPool,
    report::RunReport,
    sched::DripScheduler,
};

/// Top-level run loop: ramp up, drip, reap, shut down, report. A single
/// cooperative loop owns the live set and the scheduler; per-connection
/// failures never abort the run.
pub struct Harness {
    config: LorisConfig,
    stop: broadcast::Sender<()>,
}

impl Harness {
    pub fn new(config: LorisConfig, stop: broadcast::Sender<()>) -> Self {
        Self { config, stop }
    }

    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        self.config.validate()?;
        let target = self.resolve_target().await?;
        info!(
            "ramping {} connections to {} (drip every {}ms ± {}ms, {}ms run)",
            self.config.target_count,
            target,
            self.config.drip_interval_ms,
            self.config.drip_jitter_ms,
            self.config.duration_ms
        );

        let mut sched = DripScheduler::new(self.config.drip_jitter());
        let mut pool = ConnectionPool::new(self.config.clone(), target);
        let mut stop_rx = self.stop.subscribe();

        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.duration();
        let deadline_sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline_sleep);

        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut close_reason = CloseReason::RunComplete;
        loop {
            tokio::select! {
                () = &mut deadline_sleep => break,
                _ = stop_rx.recv() => {
                    info!("stop requested, winding down");
                    close_reason = CloseReason::Shutdown;
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = pool.ramp_up(&mut sched).await {
                        error!("aborting run: {err}");
                        pool.shutdown_all(CloseReason::Shutdown).await;
                        return Err(err);
                    }
                    for id in sched.tick(Instant::now()) {
                        if pool.drip(id).await {
                            sched.reschedule(id, Instant::now());
                        } else {
                            sched.unregister(id);
                        }
                    }
                    pool.reap(&mut sched);
                    if pool.drained() {
                        // Every connection already reached a terminal state;
                        // nothing is left to keep alive until the deadline.
                        break;
                    }
                }
            }
        }

        pool.shutdown_all(close_reason).await;
        let report = pool.finish(&mut sched, started.elapsed());
        info!(
            "run complete: {}/{} established, {} closed by peer",
            report.established, report.attempted, report.peer_closed
        );
        Ok(report)
    }

    async fn resolve_target(&self) -> Result<std::net::SocketAddr, HarnessError> {
        let mut addrs = lookup_host(&self.config.target).await.map_err(|err| {
            HarnessError::Configuration(format!(
                "cannot resolve target '{}': {err}",
                self.config.target
            ))
        })?;
        addrs.next().ok_or_else(|| {
            HarnessError::Configuration(format!(
                "target '{}' resolved to no addresses",
                self.config.target
            ))
        })
    }
}
