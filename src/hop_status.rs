//! `SimpleTracer`: a `Tracer` wired to `Stepped` strategy whose raw,
//! per-probe results are folded into a sorted `hop -> HopStatus` map
//! before being handed to the caller.
//!
//! The aggregate-record shape is grounded on
//! `edejong-dbc-mtr-ng::hop_stats::HopStats` (per-hop response history,
//! "is this the final hop" detection), narrowed here to exactly the
//! fields spec.md names for `HopStatus`.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::model::{ProbeKind, ProbeResult, ProbeSize};
use crate::port::PortStrategy;
use crate::tracer::{TraceStrategy, Tracer, TracerConfig};

const NO_CUTOFF: u32 = u32::MAX;

/// One probe's contribution to a hop's history. `mtu` is `None` where
/// spec.md's source language used a sentinel `0` for "MTU discovery
/// was off for this probe" — an `Option` is the idiomatic Rust reading
/// of that same absence.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success { elapsed_usec: u64, mtu: Option<usize> },
    Error,
}

/// Aggregated view of every probe sent at a given TTL so far.
#[derive(Debug, Clone, PartialEq)]
pub struct HopStatus {
    pub hop: u32,
    pub responses: Vec<Response>,
    /// Every distinct address observed replying for this hop. A hop
    /// behind a load balancer can show more than one, so this
    /// accumulates rather than overwriting on each new probe.
    pub offenders: BTreeSet<IpAddr>,
    pub reached_target: bool,
}

impl HopStatus {
    fn new(hop: u32) -> Self {
        Self {
            hop,
            responses: Vec::new(),
            offenders: BTreeSet::new(),
            reached_target: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimpleTracerConfig {
    pub target: String,
    pub source: String,
    pub kind: ProbeKind,
    pub probes_per_hop: u32,
    pub concurrency: u32,
    pub max_hops: u32,
    pub port_strategy: PortStrategy,
    pub probe_size: ProbeSize,
    pub timeout_ms: i64,
    pub pattern: Vec<u8>,
}

impl Default for SimpleTracerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            source: String::new(),
            kind: ProbeKind::Icmp,
            probes_per_hop: 3,
            concurrency: 5,
            max_hops: 30,
            port_strategy: PortStrategy::Sequential { start: 33434, step: 1 },
            probe_size: ProbeSize::MtuDiscovery,
            timeout_ms: 5000,
            pattern: Vec::new(),
        }
    }
}

/// Wraps a `Stepped` [`Tracer`], aggregating its per-probe results into
/// a `BTreeMap<u32, HopStatus>` and delivering one updated [`HopStatus`]
/// snapshot per probe.
///
/// Delivery is serialized through a single-permit
/// [`tokio::sync::Semaphore`], the literal reading of "a single-permit
/// mutex guarding map updates and callback dispatch together" — since
/// `Tracer::trace` invokes its callback synchronously and sequentially
/// from one task, there is never a second caller actually contending
/// for the permit, but acquiring it keeps the guarantee explicit and
/// load-bearing if a future caller ever drives several `SimpleTracer`s'
/// callbacks from the same shared state.
pub struct SimpleTracer {
    tracer: Tracer,
    permit: tokio::sync::Semaphore,
    hops: Mutex<BTreeMap<u32, HopStatus>>,
    /// Smallest hop this `SimpleTracer` has itself confirmed terminal —
    /// `Success`/`ConnectionRefused`/`HostUnreachable` whose offender is
    /// the configured remote (spec.md §4.6). Distinct from, and checked
    /// independently of, the underlying `Tracer`'s own cutoff (§4.5,
    /// which only recognizes `Success`/`ConnectionRefused`).
    cutoff: AtomicU32,
    mtu_discovery: bool,
}

impl SimpleTracer {
    pub fn new(config: SimpleTracerConfig) -> Self {
        let mtu_discovery = matches!(config.probe_size, ProbeSize::MtuDiscovery);
        let tracer_config = TracerConfig {
            target: config.target,
            source: config.source,
            kind: config.kind,
            strategy: TraceStrategy::Stepped {
                probes_per_hop: config.probes_per_hop,
                concurrency: config.concurrency,
                max_hops: config.max_hops,
            },
            port_strategy: config.port_strategy,
            probe_size: config.probe_size,
            timeout_ms: config.timeout_ms,
            pattern: config.pattern,
        };
        Self {
            tracer: Tracer::new(tracer_config),
            permit: tokio::sync::Semaphore::new(1),
            hops: Mutex::new(BTreeMap::new()),
            cutoff: AtomicU32::new(NO_CUTOFF),
            mtu_discovery,
        }
    }

    pub fn stop(&self) {
        self.tracer.stop();
    }

    pub fn is_active(&self) -> bool {
        self.tracer.is_active()
    }

    /// Runs the underlying trace to completion (or until [`Self::stop`]
    /// is called), delivering one [`HopStatus`] snapshot per probe
    /// result, in the order results are received.
    pub async fn trace<F>(&self, mut on_result: F)
    where
        F: FnMut(HopStatus) + Send,
    {
        self.hops.lock().unwrap().clear();
        self.cutoff.store(NO_CUTOFF, Ordering::SeqCst);
        self.tracer
            .trace(|hop, result| self.fold_and_emit(hop, result, &mut on_result))
            .await;
    }

    /// True when `result` is a `Success`/`ConnectionRefused`/
    /// `HostUnreachable` whose offender is the tracer's own remote —
    /// the spec.md §4.6 terminal signal for this layer (distinct from,
    /// and broader than, the underlying `Tracer`'s own §4.5 cutoff rule,
    /// which only recognizes `Success`/`ConnectionRefused`).
    fn reaches_target(&self, result: &ProbeResult) -> bool {
        let target = self.tracer.target();
        match result {
            ProbeResult::Success { remote, .. } => target == Some(*remote),
            ProbeResult::ConnectionRefused { offender, .. }
            | ProbeResult::HostUnreachable { offender, .. } => target == Some(*offender),
            _ => false,
        }
    }

    fn fold_and_emit(&self, hop: u32, result: ProbeResult, on_result: &mut dyn FnMut(HopStatus)) {
        let _permit = self
            .permit
            .try_acquire()
            .expect("SimpleTracer serializes its own callback dispatch onto one task");

        if self.reaches_target(&result) {
            self.cutoff.fetch_min(hop, Ordering::SeqCst);
        }
        let cutoff = self.cutoff.load(Ordering::SeqCst);
        if hop > cutoff {
            // Beyond the discovered terminal hop: never delivered, per
            // spec.md §8's "no HopStatus with num > H" property.
            return;
        }

        let snapshot = {
            let mut hops = self.hops.lock().unwrap();
            if cutoff != NO_CUTOFF {
                hops.retain(|&h, _| h <= cutoff);
            }
            let entry = hops.entry(hop).or_insert_with(|| HopStatus::new(hop));
            self.apply(entry, &result, cutoff);
            entry.clone()
        };

        on_result(snapshot);
    }

    /// Folds one probe's result into `entry`. Per spec.md §4.6,
    /// `Success`/`ConnectionRefused`/`HostUnreachable`/`NetUnreachable`
    /// all count as a reply for this hop (`Response::Success`, carrying
    /// an MTU only when MTU discovery is on); only `Unknown`, `Timeout`,
    /// and the generic `NetError` degrade to `Response::Error`.
    fn apply(&self, entry: &mut HopStatus, result: &ProbeResult, cutoff: u32) {
        entry.reached_target = cutoff != NO_CUTOFF && entry.hop == cutoff;
        match result {
            ProbeResult::Success {
                remote,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            } => {
                entry.responses.push(Response::Success {
                    elapsed_usec: *elapsed_usec,
                    mtu: self.mtu_discovery.then(|| *probe_size + *overhead),
                });
                entry.offenders.insert(*remote);
            }
            ProbeResult::ConnectionRefused {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            }
            | ProbeResult::HostUnreachable {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            }
            | ProbeResult::NetUnreachable {
                offender,
                elapsed_usec,
                probe_size,
                overhead,
                ..
            } => {
                entry.responses.push(Response::Success {
                    elapsed_usec: *elapsed_usec,
                    mtu: self.mtu_discovery.then(|| *probe_size + *overhead),
                });
                entry.offenders.insert(*offender);
            }
            ProbeResult::NetError { offender, .. } => {
                entry.responses.push(Response::Error);
                entry.offenders.insert(*offender);
            }
            ProbeResult::Timeout { .. } | ProbeResult::Unknown { .. } => {
                entry.responses.push(Response::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn aggregates_one_snapshot_per_probe_into_sorted_hops() {
        let config = SimpleTracerConfig {
            target: "not-a-valid-address".to_string(),
            probes_per_hop: 2,
            concurrency: 2,
            max_hops: 2,
            ..Default::default()
        };
        let tracer = SimpleTracer::new(config);
        let mut snapshots = Vec::new();
        tracer.trace(|status| snapshots.push(status)).await;

        assert_eq!(snapshots.len(), 4);
        let hops: Vec<u32> = snapshots.iter().map(|s| s.hop).collect();
        assert!(hops.windows(2).all(|w| w[0] <= w[1]));
        assert!(snapshots.iter().all(|s| matches!(s.responses.last(), Some(Response::Error))));
    }

    #[tokio::test]
    async fn host_unreachable_from_target_sets_cutoff_and_drops_later_hops() {
        // Loopback as both the configured remote and the only offender
        // means every `HostUnreachable` against it reaches the §4.6
        // terminal condition on the very first hop.
        let config = SimpleTracerConfig {
            target: "127.0.0.1".to_string(),
            probes_per_hop: 1,
            concurrency: 1,
            max_hops: 5,
            ..Default::default()
        };
        let tracer = SimpleTracer::new(config);

        let target: IpAddr = "127.0.0.1".parse().unwrap();
        let host_unreachable = ProbeResult::HostUnreachable {
            sequence: 0,
            offender: target,
            elapsed_usec: 0,
            probe_size: 32,
            overhead: 20,
        };
        assert!(tracer.reaches_target(&host_unreachable));

        let mut hops = BTreeMap::new();
        hops.insert(2u32, HopStatus::new(2));
        *tracer.hops.lock().unwrap() = hops;

        let mut snapshots = Vec::new();
        tracer.fold_and_emit(1, host_unreachable, &mut |s| snapshots.push(s));

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].hop, 1);
        assert!(snapshots[0].reached_target);
        assert!(matches!(snapshots[0].responses.last(), Some(Response::Success { .. })));
        // Hop 2 pre-seeded before the cutoff landed must be pruned.
        assert!(!tracer.hops.lock().unwrap().contains_key(&2));

        // A later, higher-hop result is now suppressed entirely.
        tracer.fold_and_emit(
            3,
            ProbeResult::Timeout {
                sequence: 1,
                remote: target,
                probe_size: 32,
                overhead: 20,
            },
            &mut |s| snapshots.push(s),
        );
        assert_eq!(snapshots.len(), 1, "hop beyond cutoff must not be delivered");
    }
}
