//! The ICMP ping driver: one probe per interval tick against a single
//! target, with no hop or concurrency concerns.
//!
//! The suspend-between-rounds shape is grounded on
//! `edejong-dbc-mtr-ng::session::MtrSession`'s round loop
//! (`tokio::time::sleep` between iterations, an `AtomicBool` run flag
//! rather than a dedicated actor/task handle).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::manager::ProbeManager;
use crate::model::{ProbeKind, ProbeRequest, ProbeResult, SubmitOutcome};

/// Configuration for one [`Pinger`] run.
#[derive(Debug, Clone)]
pub struct PingerConfig {
    pub target: String,
    /// Empty string binds to the OS default source address.
    pub source: String,
    pub interval: Duration,
    /// `None` pings until [`Pinger::stop`] is called.
    pub count: Option<u32>,
    /// `<= 0` uses the OS default TTL.
    pub ttl: i32,
    /// `<= 0` disables the per-probe receive timeout.
    pub timeout_ms: i64,
    pub payload_size: usize,
    pub pattern: Vec<u8>,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            source: String::new(),
            interval: Duration::from_secs(1),
            count: Some(4),
            ttl: -1,
            timeout_ms: 5000,
            payload_size: 32,
            pattern: Vec::new(),
        }
    }
}

/// Drives a reusable [`ProbeManager`] to send ICMP echo requests at a
/// fixed cadence, delivering one [`ProbeResult`] per probe.
pub struct Pinger {
    manager: ProbeManager,
    config: PingerConfig,
    active: AtomicBool,
    sequence: AtomicU32,
}

impl Pinger {
    pub fn new(config: PingerConfig) -> Self {
        let manager = ProbeManager::new(&config.target, &config.source);
        Self {
            manager,
            config,
            active: AtomicBool::new(false),
            sequence: AtomicU32::new(1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Signals the in-progress [`Pinger::ping`] call to stop issuing new
    /// probes. Already in-flight probes are still drained and reported.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Runs until `count` probes have been sent and their replies/
    /// timeouts delivered, or until [`Pinger::stop`] is called.
    /// `on_result` is invoked once per probe, from this task, only
    /// after the previous probe's callback has already run — exactly
    /// one probe is ever in flight at a time, and the interval is timed
    /// from that completion, not from the send.
    pub async fn ping<F>(&self, mut on_result: F)
    where
        F: FnMut(ProbeResult) + Send,
    {
        // `ProbeManager::start` can block the calling thread up to 10s
        // waiting for the worker's readiness signal; run it off the
        // async executor the way the teacher isolates blocking probe
        // I/O from its tokio tasks.
        let ready = tokio::task::block_in_place(|| self.manager.start());
        if !ready {
            info!(target = %self.config.target, "pinger: probe manager did not become ready in time");
            return;
        }
        self.active.store(true, Ordering::SeqCst);

        let mut sent = 0u32;

        while self.active.load(Ordering::SeqCst) {
            if matches!(self.config.count, Some(limit) if sent >= limit) {
                break;
            }

            let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
            let request = ProbeRequest {
                kind: ProbeKind::Icmp,
                dest_port: 0,
                id: u64::from(seq),
                sequence: seq,
                ttl: self.config.ttl,
                timeout_ms: self.config.timeout_ms,
                payload_size: self.config.payload_size,
                mtu_discovery: false,
                pattern: self.config.pattern.clone(),
            };
            sent += 1;
            debug!(sequence = seq, "pinger: sending probe");

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProbeResult>();
            match self.manager.send_probe(request, Box::new(move |_id, result| {
                let _ = tx.send(result);
            })) {
                SubmitOutcome::Queued => {
                    if let Some(result) = rx.recv().await {
                        on_result(result);
                    }
                }
                SubmitOutcome::FailedSynchronously(result) => on_result(result),
            }

            let reached_limit = matches!(self.config.count, Some(limit) if sent >= limit);
            if self.active.load(Ordering::SeqCst) && !reached_limit {
                tokio::time::sleep(self.config.interval).await;
            }
        }

        self.active.store(false, Ordering::SeqCst);
        tokio::task::block_in_place(|| self.manager.stop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_count_delivers_exactly_count_results() {
        let config = PingerConfig {
            target: "not-a-valid-address".to_string(),
            count: Some(3),
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let pinger = Pinger::new(config);
        let mut seen = 0;
        pinger.ping(|_result| seen += 1).await;
        // Every probe fails synchronously (unparsable destination), so
        // all three still reach `on_result` exactly once each.
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_increment_per_probe() {
        let config = PingerConfig {
            target: "not-a-valid-address".to_string(),
            count: Some(3),
            interval: Duration::from_millis(1),
            ..Default::default()
        };
        let pinger = Pinger::new(config);
        let mut sequences = Vec::new();
        pinger.ping(|result| sequences.push(result.sequence())).await;
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stop_halts_further_probes() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let config = PingerConfig {
            target: "not-a-valid-address".to_string(),
            count: None,
            interval: Duration::from_millis(5),
            ..Default::default()
        };
        let pinger = Arc::new(Pinger::new(config));
        let seen = Arc::new(AtomicU32::new(0));

        let p = Arc::clone(&pinger);
        let s = Arc::clone(&seen);
        let handle = tokio::spawn(async move {
            p.ping(|_result| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        pinger.stop();
        handle.await.unwrap();

        // The run terminated after `stop`, delivering a small, bounded
        // number of already-synchronously-failed probes rather than
        // running forever.
        assert!(seen.load(Ordering::SeqCst) < 1000);
    }
}
