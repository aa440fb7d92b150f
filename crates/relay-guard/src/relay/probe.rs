//! Two-phase latency probing.
//!
//! The coarse phase times one connection attempt against every candidate.
//! The refined phase re-measures only the fastest share of the survivors
//! with several longer attempts and ranks them by their average.
//!
//! Every probe runs in its own task. A semaphore shared by both phases caps
//! how many are in flight, whatever the size of the directory.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tracing::Instrument;

use super::{LatencyMeasurement, RelayDescriptor};
use crate::error::ProbeError;

/// Times a single reachability check against an endpoint.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, endpoint: SocketAddr, timeout: Duration) -> io::Result<Duration>;
}

/// Measures TCP connection establishment time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPinger;

#[async_trait]
impl Pinger for TcpPinger {
    async fn ping(&self, endpoint: SocketAddr, timeout: Duration) -> io::Result<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }
}

/// Tuning for both probe phases.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Port probed on each relay's IPv4 endpoint.
    pub port: u16,
    pub coarse_timeout: Duration,
    pub refined_timeout: Duration,
    /// Attempts per relay in the refined phase.
    pub refined_attempts: u32,
    /// Cap on probes in flight at once.
    pub max_concurrent: usize,
    /// Share of coarse survivors carried into refinement, in percent.
    pub refine_percent: usize,
    /// Minimum refinement set size, bounded by the survivor count.
    pub refine_floor: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            port: 443,
            coarse_timeout: Duration::from_millis(500),
            refined_timeout: Duration::from_secs(2),
            refined_attempts: 3,
            max_concurrent: 50,
            refine_percent: 10,
            refine_floor: 5,
        }
    }
}

/// Size of the refinement set for `survivors` coarse results:
/// `max(floor, ceil(percent% of survivors))`, never more than `survivors`.
pub fn refinement_size(survivors: usize, percent: usize, floor: usize) -> usize {
    (survivors * percent).div_ceil(100).max(floor).min(survivors)
}

/// Ranks relays by measured latency.
#[derive(Clone)]
pub struct LatencyProber {
    pinger: Arc<dyn Pinger>,
    semaphore: Arc<Semaphore>,
    options: ProbeOptions,
}

impl LatencyProber {
    pub fn new(pinger: Arc<dyn Pinger>, options: ProbeOptions) -> Self {
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            pinger,
            semaphore,
            options,
        }
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Rank `relays` ascending by refined latency.
    ///
    /// Unreachable relays are silently left out. The call fails only when no
    /// candidate answers the coarse phase, or none of the refinement set
    /// answers any refined attempt. Equal latencies keep the input order.
    pub async fn probe(
        &self,
        relays: &[RelayDescriptor],
    ) -> Result<Vec<LatencyMeasurement>, ProbeError> {
        if relays.is_empty() {
            return Err(ProbeError::NoReachableRelay { attempted: 0 });
        }

        let coarse_span = guard_tracing::probe_phase_span!("coarse", relays.len());
        let coarse = self.coarse_phase(relays).instrument(coarse_span).await;
        if coarse.is_empty() {
            return Err(ProbeError::NoReachableRelay {
                attempted: relays.len(),
            });
        }

        let keep = refinement_size(
            coarse.len(),
            self.options.refine_percent,
            self.options.refine_floor,
        );
        let shortlist = &coarse[..keep];

        let refined_span = guard_tracing::probe_phase_span!("refined", shortlist.len());
        let refined = self.refined_phase(shortlist).instrument(refined_span).await;
        if refined.is_empty() {
            return Err(ProbeError::NoneSurvivedRefinement { refined: keep });
        }

        if let Some(best) = refined.first() {
            tracing::info!(
                candidates = relays.len(),
                reachable = coarse.len(),
                refined = refined.len(),
                best = %best.relay.hostname,
                best_latency_ms = best.latency.as_millis() as u64,
                "Latency ranking complete"
            );
        }

        Ok(refined)
    }

    /// One attempt per relay. Returns only when every task has finished.
    async fn coarse_phase(&self, relays: &[RelayDescriptor]) -> Vec<LatencyMeasurement> {
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(relays.len());

        for (order, relay) in relays.iter().cloned().enumerate() {
            let tx = tx.clone();
            let pinger = self.pinger.clone();
            let semaphore = self.semaphore.clone();
            let endpoint = SocketAddr::new(relay.endpoint.into(), self.options.port);
            let timeout = self.options.coarse_timeout;

            tokio::spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };

                    match pinger.ping(endpoint, timeout).await {
                        Ok(latency) => {
                            let _ = tx.send((order, LatencyMeasurement { relay, latency })).await;
                        }
                        Err(e) => {
                            tracing::debug!(
                                relay = %relay.hostname,
                                endpoint = %endpoint,
                                error = %e,
                                "Coarse probe failed"
                            );
                        }
                    }
                }
                .in_current_span(),
            );
        }
        drop(tx);

        // The channel closes once every task has dropped its sender.
        let mut results = Vec::with_capacity(relays.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let ranked = rank(results);
        record_phase(ranked.len(), start);
        ranked
    }

    /// Several attempts per shortlisted relay, averaged over the successes.
    async fn refined_phase(&self, shortlist: &[LatencyMeasurement]) -> Vec<LatencyMeasurement> {
        let start = Instant::now();
        let (tx, mut rx) = mpsc::channel(shortlist.len().max(1));

        for (order, coarse) in shortlist.iter().enumerate() {
            let tx = tx.clone();
            let pinger = self.pinger.clone();
            let semaphore = self.semaphore.clone();
            let relay = coarse.relay.clone();
            let endpoint = SocketAddr::new(relay.endpoint.into(), self.options.port);
            let timeout = self.options.refined_timeout;
            let attempts = self.options.refined_attempts;

            tokio::spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };

                    let mut total = Duration::ZERO;
                    let mut successes = 0u32;
                    for attempt in 1..=attempts {
                        match pinger.ping(endpoint, timeout).await {
                            Ok(latency) => {
                                total += latency;
                                successes += 1;
                            }
                            Err(e) => {
                                tracing::debug!(
                                    relay = %relay.hostname,
                                    attempt,
                                    error = %e,
                                    "Refined probe failed"
                                );
                            }
                        }
                    }

                    if successes == 0 {
                        tracing::debug!(relay = %relay.hostname, "Dropped after refinement");
                        return;
                    }

                    let latency = total / successes;
                    let _ = tx.send((order, LatencyMeasurement { relay, latency })).await;
                }
                .in_current_span(),
            );
        }
        drop(tx);

        let mut results = Vec::with_capacity(shortlist.len());
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let ranked = rank(results);
        record_phase(ranked.len(), start);
        ranked
    }
}

/// Restore arrival-independent order, then stable-sort by latency so ties
/// keep the order the phase was given.
fn rank(mut results: Vec<(usize, LatencyMeasurement)>) -> Vec<LatencyMeasurement> {
    results.sort_by_key(|(order, _)| *order);
    results.sort_by_key(|(_, m)| m.latency);
    results.into_iter().map(|(_, m)| m).collect()
}

fn record_phase(survivors: usize, start: Instant) {
    let span = tracing::Span::current();
    span.record("survivors", survivors);
    span.record("duration_ms", start.elapsed().as_millis() as u64);
}
