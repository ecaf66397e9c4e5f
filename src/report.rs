use std::{collections::BTreeMap, fmt, time::Duration};

use serde::Serialize;

use crate::{
    connection::ConnState,
    error::{CloseCause, ErrorKind},
};

/// Accumulates outcomes while the run is in flight. Strictly additive; the
/// control loop is the only writer.
#[derive(Debug, Default)]
pub struct ReportBuilder {
    attempted: u64,
    established: u64,
    peer_closed_eof: u64,
    peer_closed_reset: u64,
    harness_closed: u64,
    errors: BTreeMap<ErrorKind, u64>,
    alive_samples: Vec<Duration>,
}

impl ReportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempted(&mut self) {
        self.attempted += 1;
    }

    pub fn connection_established(&mut self) {
        self.established += 1;
    }

    /// Folds one terminal connection in. Callers guarantee each connection
    /// is recorded exactly once (the pool only reaps a connection once).
    pub fn record_outcome(&mut self, state: &ConnState) {
        match state {
            ConnState::PeerClosed { cause, alive } => {
                match cause {
                    CloseCause::Eof => self.peer_closed_eof += 1,
                    CloseCause::Reset => self.peer_closed_reset += 1,
                }
                self.alive_samples.push(*alive);
            }
            ConnState::HarnessClosed { .. } => self.harness_closed += 1,
            ConnState::Errored { kind } => {
                *self.errors.entry(*kind).or_insert(0) += 1;
            }
            // Non-terminal states are a pool bug; count them as errors
            // rather than silently losing a connection.
            ConnState::Connecting | ConnState::Open => {
                *self.errors.entry(ErrorKind::Io).or_insert(0) += 1;
            }
        }
    }

    pub fn finish(mut self, run_duration: Duration) -> RunReport {
        self.alive_samples.sort_unstable();
        let time_to_peer_close_ms = if self.alive_samples.is_empty() {
            None
        } else {
            let ms = |d: &Duration| d.as_millis() as u64;
            let mid = self.alive_samples.len() / 2;
            let median = if self.alive_samples.len() % 2 == 0 {
                (ms(&self.alive_samples[mid - 1]) + ms(&self.alive_samples[mid])) / 2
            } else {
                ms(&self.alive_samples[mid])
            };
            Some(PeerCloseStats {
                min: ms(&self.alive_samples[0]),
                median,
                max: ms(&self.alive_samples[self.alive_samples.len() - 1]),
            })
        };

        RunReport {
            duration_ms: run_duration.as_millis() as u64,
            attempted: self.attempted,
            established: self.established,
            peer_closed: self.peer_closed_eof + self.peer_closed_reset,
            peer_closed_eof: self.peer_closed_eof,
            peer_closed_reset: self.peer_closed_reset,
            harness_closed: self.harness_closed,
            errored: self.errors.values().sum(),
            errors: self
                .errors
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            time_to_peer_close_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PeerCloseStats {
    pub min: u64,
    pub median: u64,
    pub max: u64,
}

/// Finalized run outcome. Immutable once built; serializable for the JSON
/// report file.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub duration_ms: u64,
    pub attempted: u64,
    pub established: u64,
    pub peer_closed: u64,
    pub peer_closed_eof: u64,
    pub peer_closed_reset: u64,
    pub harness_closed: u64,
    pub errored: u64,
    pub errors: BTreeMap<String, u64>,
    pub time_to_peer_close_ms: Option<PeerCloseStats>,
}

impl RunReport {
    /// Every connection ever created lands in exactly one bucket.
    pub fn accounted(&self) -> u64 {
        self.peer_closed + self.harness_closed + self.errored
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "slow-client run ({}ms):", self.duration_ms)?;
        writeln!(f, "  attempted: {}", self.attempted)?;
        writeln!(f, "  established: {}", self.established)?;
        writeln!(
            f,
            "  closed by peer: {} (eof {}, reset {})",
            self.peer_closed, self.peer_closed_eof, self.peer_closed_reset
        )?;
        writeln!(f, "  closed by harness: {}", self.harness_closed)?;
        writeln!(f, "  errored: {}", self.errored)?;
        for (kind, count) in &self.errors {
            writeln!(f, "    {kind}: {count}")?;
        }
        match &self.time_to_peer_close_ms {
            Some(stats) => writeln!(
                f,
                "  time to peer close (ms): min {} / median {} / max {}",
                stats.min, stats.median, stats.max
            ),
            None => writeln!(f, "  time to peer close: (no peer closes observed)"),
        }
    }
}
