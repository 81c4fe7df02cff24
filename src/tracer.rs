//! The traceroute driver: fires escalating-TTL probes, tracks where the
//! path terminates, and (optionally) shrinks probe size on path-MTU
//! feedback.
//!
//! Stepped/per-hop structure and the cutoff-on-destination-reached idea
//! are grounded on `edejong-dbc-mtr-ng::session::MtrSession`'s per-round
//! hop loop and `hop_stats::HopStats`'s `add_rtt_from_addr`/`add_rtt`/
//! `add_timeout` "this hop is the destination" bookkeeping; the
//! in-flight-count backoff poll is grounded on the same session's rate
//! limiting between rounds.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::manager::ProbeManager;
use crate::model::{ProbeKind, ProbeRequest, ProbeResult, ProbeSize, SubmitOutcome, MTU_DISCOVERY_CEILING};
use crate::port::PortStrategy;

const NO_CUTOFF: u32 = u32::MAX;
const CONCURRENCY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How hops are paced against each other.
#[derive(Debug, Clone)]
pub enum TraceStrategy {
    /// Resolve one hop completely (all `probes_per_hop` replies/timeouts
    /// collected) before moving to the next, throttling outstanding
    /// probes to `concurrency`.
    Stepped {
        probes_per_hop: u32,
        concurrency: u32,
        max_hops: u32,
    },
    /// Fire one probe per hop every `interval`, for `cycles` rounds
    /// (`None` = run until stopped).
    Concurrent {
        cycles: Option<u32>,
        interval: Duration,
        max_hops: u32,
    },
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub target: String,
    pub source: String,
    pub kind: ProbeKind,
    pub strategy: TraceStrategy,
    pub port_strategy: PortStrategy,
    pub probe_size: ProbeSize,
    pub timeout_ms: i64,
    pub pattern: Vec<u8>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            source: String::new(),
            kind: ProbeKind::Icmp,
            strategy: TraceStrategy::Stepped {
                probes_per_hop: 3,
                concurrency: 5,
                max_hops: 30,
            },
            port_strategy: PortStrategy::default(),
            probe_size: ProbeSize::Static(32),
            timeout_ms: 5000,
            pattern: Vec::new(),
        }
    }
}

/// Drives a reusable [`ProbeManager`] through an escalating-TTL sweep.
pub struct Tracer {
    manager: ProbeManager,
    config: TracerConfig,
    active: AtomicBool,
    /// First hop known to have reached the destination; hops beyond it
    /// are not issued. `NO_CUTOFF` means "not yet known".
    cutoff: AtomicU32,
    /// Current probe payload size in bytes.
    size: AtomicU16,
    probe_counter: AtomicU64,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        let manager = ProbeManager::new(&config.target, &config.source);
        let initial_size = match config.probe_size {
            ProbeSize::Static(n) => n.min(u16::MAX as usize) as u16,
            ProbeSize::MtuDiscovery => MTU_DISCOVERY_CEILING as u16,
        };
        Self {
            manager,
            config,
            active: AtomicBool::new(false),
            cutoff: AtomicU32::new(NO_CUTOFF),
            size: AtomicU16::new(initial_size),
            probe_counter: AtomicU64::new(0),
        }
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs the configured strategy until the path terminates (or
    /// `max_hops`/`cycles` is exhausted), delivering one `(hop,
    /// ProbeResult)` pair per probe via `on_result`, in completion
    /// order within each hop/cycle.
    pub async fn trace<F>(&self, mut on_result: F)
    where
        F: FnMut(u32, ProbeResult) + Send,
    {
        let ready = tokio::task::block_in_place(|| self.manager.start());
        if !ready {
            info!(target = %self.config.target, "tracer: probe manager did not become ready in time");
            return;
        }
        self.active.store(true, Ordering::SeqCst);

        match self.config.strategy.clone() {
            TraceStrategy::Stepped {
                probes_per_hop,
                concurrency,
                max_hops,
            } => self.run_stepped(probes_per_hop, concurrency.max(1), max_hops, &mut on_result).await,
            TraceStrategy::Concurrent {
                cycles,
                interval,
                max_hops,
            } => self.run_concurrent(cycles, interval, max_hops, &mut on_result).await,
        }

        self.active.store(false, Ordering::SeqCst);
        tokio::task::block_in_place(|| self.manager.stop());
    }

    async fn run_stepped<F>(&self, probes_per_hop: u32, concurrency: u32, max_hops: u32, on_result: &mut F)
    where
        F: FnMut(u32, ProbeResult) + Send,
    {
        for hop in 1..=max_hops {
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            if hop > self.cutoff.load(Ordering::SeqCst) {
                break;
            }

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(u32, ProbeResult)>();
            let port = self.config.port_strategy.resolve(hop);

            let mut issued = 0u32;
            while issued < probes_per_hop {
                while self.manager.in_flight() >= concurrency as usize {
                    tokio::time::sleep(CONCURRENCY_POLL_INTERVAL).await;
                }
                self.issue_one(hop, port, None, tx.clone());
                issued += 1;
            }

            while self.manager.in_flight() > 0 {
                tokio::select! {
                    Some((hop, result)) = rx.recv() => {
                        self.observe(hop, &result);
                        on_result(hop, result);
                    }
                    _ = tokio::time::sleep(CONCURRENCY_POLL_INTERVAL) => {}
                }
            }
            while let Ok((hop, result)) = rx.try_recv() {
                self.observe(hop, &result);
                on_result(hop, result);
            }
        }
    }

    async fn run_concurrent<F>(&self, cycles: Option<u32>, interval: Duration, max_hops: u32, on_result: &mut F)
    where
        F: FnMut(u32, ProbeResult) + Send,
    {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(u32, ProbeResult)>();
        let mut cycle = 0u32;

        loop {
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            if let Some(limit) = cycles {
                if cycle >= limit {
                    break;
                }
            }

            let cutoff = self.cutoff.load(Ordering::SeqCst);
            for hop in 1..=max_hops {
                if hop > cutoff {
                    break;
                }
                let port = self.config.port_strategy.resolve(hop);
                self.issue_one(hop, port, Some(cycle), tx.clone());
            }
            cycle += 1;

            let sleep = tokio::time::sleep(interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    Some((hop, result)) = rx.recv() => {
                        self.observe(hop, &result);
                        on_result(hop, result);
                    }
                }
            }
        }

        while self.manager.in_flight() > 0 {
            tokio::select! {
                Some((hop, result)) = rx.recv() => {
                    self.observe(hop, &result);
                    on_result(hop, result);
                }
                _ = tokio::time::sleep(CONCURRENCY_POLL_INTERVAL) => {}
            }
        }
        while let Ok((hop, result)) = rx.try_recv() {
            self.observe(hop, &result);
            on_result(hop, result);
        }
    }

    /// `sequence` overrides the stamped sequence number (`Concurrent`
    /// passes the 0-based cycle index, per spec.md §4.5/§8 scenario 4);
    /// `None` falls back to the manager correlation id (`Stepped`'s
    /// sequence is unspecified by spec.md).
    fn issue_one(
        &self,
        hop: u32,
        port: u16,
        sequence: Option<u32>,
        tx: tokio::sync::mpsc::UnboundedSender<(u32, ProbeResult)>,
    ) {
        let size = self.size.load(Ordering::SeqCst) as usize;
        let id = self.probe_counter.fetch_add(1, Ordering::Relaxed);
        debug!(hop, size, "tracer: sending probe");
        let request = ProbeRequest {
            kind: self.config.kind,
            dest_port: port,
            id,
            sequence: sequence.unwrap_or(id as u32),
            ttl: hop as i32,
            timeout_ms: self.config.timeout_ms,
            payload_size: size,
            mtu_discovery: matches!(self.config.probe_size, ProbeSize::MtuDiscovery),
            pattern: self.config.pattern.clone(),
        };
        match self.manager.send_probe(request, Box::new(move |_id, result| {
            let _ = tx.send((hop, result));
        })) {
            SubmitOutcome::Queued => {}
            SubmitOutcome::FailedSynchronously(result) => {
                let _ = tx.send((hop, result));
            }
        }
    }

    /// Updates `cutoff`/`size` from one delivered result. Per spec.md
    /// §4.5, only `Success` or `ConnectionRefused` pin the cutoff at
    /// this hop (if no earlier one is known) — `HostUnreachable` is a
    /// terminal signal one layer up, in `SimpleTracer` (§4.6), not here.
    /// `size` shrinks whenever any callback reports a smaller
    /// `probe_size` than what's currently active, independent of MTU
    /// discovery; an `EMSGSIZE`-flavored `NetError` under MTU discovery
    /// additionally shrinks it to the kernel-reported next-hop MTU minus
    /// this probe's header overhead.
    fn observe(&self, hop: u32, result: &ProbeResult) {
        let target = self.manager.remote();
        let reaches_target = match result {
            ProbeResult::Success { remote, .. } => target == Some(*remote),
            ProbeResult::ConnectionRefused { offender, .. } => target == Some(*offender),
            _ => false,
        };
        if reaches_target {
            self.cutoff.fetch_min(hop, Ordering::SeqCst);
        }

        if let Some(reported) = result.probe_size() {
            self.size.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let reported = reported.min(u16::MAX as usize) as u16;
                (reported < current).then_some(reported)
            })
            .ok();
        }

        if let ProbeResult::NetError { err_no, err_info, .. } = result {
            if *err_no == libc::EMSGSIZE && matches!(self.config.probe_size, ProbeSize::MtuDiscovery) {
                let current = self.size.load(Ordering::SeqCst);
                let reported = if *err_info > 0 { Some(*err_info) } else { None };
                let family_is_v6 = target.map(|t| t.is_ipv6()).unwrap_or(false);
                let overhead = crate::addr::overhead_bytes(family_is_v6, self.config.kind);
                let next = on_emsgsize(current, reported, overhead);
                self.size.store(next, Ordering::SeqCst);
            }
        }
    }

    /// The destination this tracer targets, if its address parsed.
    pub fn target(&self) -> Option<IpAddr> {
        self.manager.remote()
    }
}

/// Pure size-shrink rule applied whenever MTU discovery observes an
/// `EMSGSIZE`. Prefers the kernel-reported next-hop MTU (`reported`)
/// minus this probe's `overhead` (IP/UDP headers the kernel adds beyond
/// the payload) when that is smaller than the current size — sending
/// exactly `reported - overhead` bytes of payload keeps the wire packet
/// at the reported MTU instead of still overshooting it by `overhead`
/// bytes. Otherwise backs off by half, floored at the ICMP header length
/// so a probe is always sendable.
fn on_emsgsize(current: u16, reported: Option<i32>, overhead: usize) -> u16 {
    let floor = crate::addr::ICMP_HEADER_SIZE as u16;
    match reported {
        Some(mtu) if mtu > 0 => {
            let adjusted = (mtu as i64 - overhead as i64).max(floor as i64) as u16;
            if adjusted < current {
                adjusted
            } else {
                (current / 2).max(floor)
            }
        }
        _ => (current / 2).max(floor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emsgsize_prefers_reported_mtu_minus_overhead_when_smaller() {
        assert_eq!(on_emsgsize(1500, Some(1428), 28), 1400);
    }

    #[test]
    fn emsgsize_ignores_reported_mtu_when_not_smaller() {
        assert_eq!(on_emsgsize(1000, Some(1428), 28), 500);
    }

    #[test]
    fn emsgsize_backs_off_by_half_without_a_reported_mtu() {
        assert_eq!(on_emsgsize(1000, None, 28), 500);
    }

    #[test]
    fn emsgsize_never_shrinks_below_icmp_header_size() {
        assert_eq!(on_emsgsize(10, None, 28), crate::addr::ICMP_HEADER_SIZE as u16);
    }

    #[test]
    fn emsgsize_subtracts_overhead_so_the_reissue_does_not_overshoot() {
        // A reported MTU alone would still leave `overhead` bytes of
        // room unaccounted for in the next probe's wire size.
        let next = on_emsgsize(65487, Some(1500), 28);
        assert_eq!(next, 1472);
        assert!((next as usize) + 28 <= 1500);
    }

    #[test]
    fn observe_shrinks_size_whenever_a_smaller_probe_size_is_reported() {
        let config = TracerConfig {
            target: "127.0.0.1".to_string(),
            probe_size: ProbeSize::Static(1000),
            ..Default::default()
        };
        let tracer = Tracer::new(config);
        assert_eq!(tracer.size.load(Ordering::SeqCst), 1000);

        let smaller = ProbeResult::Timeout {
            sequence: 1,
            remote: "127.0.0.1".parse().unwrap(),
            probe_size: 400,
            overhead: 20,
        };
        tracer.observe(1, &smaller);
        assert_eq!(tracer.size.load(Ordering::SeqCst), 400);

        // A larger report never grows the size back.
        let larger = ProbeResult::Timeout {
            sequence: 2,
            remote: "127.0.0.1".parse().unwrap(),
            probe_size: 900,
            overhead: 20,
        };
        tracer.observe(1, &larger);
        assert_eq!(tracer.size.load(Ordering::SeqCst), 400);
    }

    #[tokio::test]
    async fn stepped_trace_against_unparsable_destination_reports_every_hop_probe() {
        let config = TracerConfig {
            target: "not-a-valid-address".to_string(),
            strategy: TraceStrategy::Stepped {
                probes_per_hop: 2,
                concurrency: 2,
                max_hops: 3,
            },
            ..Default::default()
        };
        let tracer = Tracer::new(config);
        let mut seen = 0;
        tracer.trace(|_hop, _result| seen += 1).await;
        assert_eq!(seen, 2 * 3);
    }

    #[tokio::test]
    async fn concurrent_trace_stamps_sequence_with_the_cycle_index() {
        let config = TracerConfig {
            target: "not-a-valid-address".to_string(),
            strategy: TraceStrategy::Concurrent {
                cycles: Some(2),
                interval: Duration::from_millis(1),
                max_hops: 3,
            },
            ..Default::default()
        };
        let tracer = Tracer::new(config);
        let mut sequences_by_hop: std::collections::BTreeMap<u32, Vec<u16>> = std::collections::BTreeMap::new();
        tracer
            .trace(|hop, result| sequences_by_hop.entry(hop).or_default().push(result.sequence()))
            .await;

        assert_eq!(sequences_by_hop.len(), 3);
        for sequences in sequences_by_hop.values() {
            assert_eq!(sequences, &vec![0, 1], "each hop should see cycle 0 then cycle 1");
        }
    }
}
