use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::NonZeroU32,
    time::{Duration, Instant},
};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, info, warn};
use tokio::time::timeout;

use crate::{
    config::LorisConfig,
    connection::{CloseReason, ConnId, Connection},
    error::{is_fd_exhaustion, ConnectError, HarnessError},
    report::{ReportBuilder, RunReport},
    sched::DripScheduler,
};

/// Owns every connection of the run. The live set is mutated only by the
/// control loop; terminal connections are reaped into the report exactly
/// once. Failed opens are connections too: they stay in the set (already
/// terminal) until the next reap so nothing is ever double-counted or lost.
pub struct ConnectionPool {
    cfg: LorisConfig,
    target: SocketAddr,
    live: BTreeMap<ConnId, Connection>,
    /// Ids that went terminal since the last reap. Every transition site
    /// pushes here so reap never has to scan the live set.
    dead: Vec<ConnId>,
    limiter: DefaultDirectRateLimiter,
    opened: u64,
    report: ReportBuilder,
}

impl ConnectionPool {
    pub fn new(cfg: LorisConfig, target: SocketAddr) -> Self {
        let rate = NonZeroU32::new(cfg.ramp_rate.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            cfg,
            target,
            live: BTreeMap::new(),
            dead: Vec::new(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            opened: 0,
            report: ReportBuilder::new(),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// All planned connections have been attempted and none remain live.
    pub fn drained(&self) -> bool {
        self.opened >= u64::from(self.cfg.target_count) && self.live.is_empty()
    }

    /// Opens connections toward the target count at the configured rate.
    /// Every attempt is accounted; failed opens are not retried.
    pub async fn ramp_up(&mut self, sched: &mut DripScheduler) -> Result<(), HarnessError> {
        while self.opened < u64::from(self.cfg.target_count) && self.limiter.check().is_ok() {
            let id = ConnId(self.opened);
            self.opened += 1;
            self.report.connection_attempted();

            let mut conn = Connection::new(id, self.cfg.drip_interval());
            match conn.open(self.target, self.cfg.connect_timeout()).await {
                Ok(()) => {
                    self.report.connection_established();
                    conn.send_preamble(
                        &self.cfg.method,
                        &self.cfg.path,
                        self.cfg.host(),
                        self.cfg.write_timeout(),
                    )
                    .await;
                    if conn.state().is_terminal() {
                        self.dead.push(id);
                    } else {
                        sched.register(id, conn.drip_interval(), Instant::now());
                        debug!("connection {id} open to {}", self.target);
                    }
                    self.live.insert(id, conn);
                }
                // The attempt is recorded either way; escalation only
                // decides whether the run keeps going.
                Err(ConnectError::Io(io_err)) if is_fd_exhaustion(&io_err) => {
                    self.live.insert(id, conn);
                    self.dead.push(id);
                    return Err(HarnessError::ResourceExhausted(io_err));
                }
                Err(err) => {
                    self.live.insert(id, conn);
                    self.dead.push(id);
                    if id.0 == 0 && self.cfg.fail_fast_first_connect {
                        return Err(HarnessError::Configuration(format!(
                            "target {} unreachable on first attempt: {err}",
                            self.target
                        )));
                    }
                    warn!("connection {id} failed: {err}");
                }
            }
        }
        Ok(())
    }

    /// One drip on the given connection. Returns true while the connection
    /// remains open (caller reschedules), false once terminal.
    pub async fn drip(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.live.get_mut(&id) else {
            return false;
        };
        conn.drip(&self.cfg.drip_header, self.cfg.write_timeout()).await;
        if conn.state().is_terminal() {
            self.dead.push(id);
            return false;
        }
        true
    }

    /// Removes connections that went terminal since the last call and folds
    /// their outcome into the report. Runs after dispatch within a tick,
    /// never interleaved with it. A duplicate id is harmless; the second
    /// remove finds nothing.
    pub fn reap(&mut self, sched: &mut DripScheduler) {
        for id in self.dead.drain(..) {
            if let Some(conn) = self.live.remove(&id) {
                sched.unregister(id);
                self.report.record_outcome(&conn.state());
            }
        }
    }

    /// Closes every live connection, bounded by the grace period; whatever
    /// has not shut down cleanly by then is dropped on the floor.
    pub async fn shutdown_all(&mut self, reason: CloseReason) {
        if self.live.is_empty() {
            return;
        }
        info!("closing {} live connections", self.live.len());
        let deadline = Instant::now() + self.cfg.shutdown_grace();
        for conn in self.live.values_mut() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                conn.abort(reason);
                continue;
            }
            if timeout(remaining, conn.close(reason)).await.is_err() {
                conn.abort(reason);
            }
        }
        self.dead.extend(self.live.keys().copied());
    }

    pub fn finish(mut self, sched: &mut DripScheduler, run_duration: Duration) -> RunReport {
        self.reap(sched);
        debug_assert!(self.live.is_empty());
        self.report.finish(run_duration)
    }
}
