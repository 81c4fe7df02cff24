//! The probe data model: requests going in, results coming out, and the
//! manager-internal context that bridges them.
//!
//! `ProbeResult`'s variant set and the `status` → variant mapping in
//! [`ProbeContext::classify`] follow spec.md §3/§4.1 exactly; the shape
//! of a tagged-union outcome with a chronological per-hop response list
//! mirrors `edejong-dbc-mtr-ng::probe::{ProbeResponse, IcmpResponseType}`.

use std::net::IpAddr;
use std::time::{Duration, Instant};

/// ICMP echo or UDP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Icmp,
    Udp,
}

/// What size a [`crate::tracer::Tracer`] probe should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeSize {
    /// Always send exactly this many bytes.
    Static(usize),
    /// Start near a link MTU ceiling and shrink on `EMSGSIZE`.
    MtuDiscovery,
}

/// Near-MTU ceiling `ProbeSize::MtuDiscovery` starts from before any
/// `EMSGSIZE` feedback narrows it — the largest IPv4 payload that
/// avoids fragmentation on a standard 65535-byte-limited loopback path
/// minus generous header room, matching the order of magnitude named
/// in spec.md §8 scenario 5 (an initial size "near 65487").
pub const MTU_DISCOVERY_CEILING: usize = 65487;

/// A single outstanding or completed probe, as submitted by a caller.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub kind: ProbeKind,
    /// UDP destination port; ignored (0) for ICMP.
    pub dest_port: u16,
    /// Caller-chosen correlation id, echoed back with every
    /// [`ProbeResult`] delivered for this probe.
    pub id: u64,
    /// Truncated to 16 bits when stamped into an ICMP header.
    pub sequence: u32,
    /// `<= 0` uses the OS default TTL/hop-limit.
    pub ttl: i32,
    pub timeout_ms: i64,
    pub payload_size: usize,
    pub mtu_discovery: bool,
    pub pattern: Vec<u8>,
}

impl ProbeRequest {
    pub fn sequence16(&self) -> u16 {
        (self.sequence & 0xFFFF) as u16
    }
}

/// Internal lifecycle state of a [`ProbeContext`]. Transitions out of
/// `Waiting` are monotonic (spec.md §3 invariant) — nothing in this
/// crate ever writes `Waiting` back into a context after it leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Waiting,
    Success,
    Timeout,
    NetError,
    FatalError,
}

/// Raw error-queue fields captured from `SO_EE_*`/ancillary data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorQueueInfo {
    pub err_no: i32,
    pub err_code: i32,
    pub err_type: i32,
    pub err_info: i32,
}

/// One in-flight probe as tracked by the manager. Never re-used across
/// probes: a fresh context is allocated per `send_probe` call and
/// dropped once reaped.
#[derive(Debug)]
pub struct ProbeContext {
    pub request: ProbeRequest,
    pub remote: IpAddr,
    pub overhead: usize,
    pub sent_at: Instant,
    pub received_at: Option<Instant>,
    pub elapsed: Option<Duration>,
    pub offender: Option<IpAddr>,
    pub error: ErrorQueueInfo,
    pub reply_ttl: Option<u8>,
    pub reply_len: usize,
    pub status: ProbeStatus,
    pub fatal_message: Option<String>,
}

impl ProbeContext {
    pub fn new(request: ProbeRequest, remote: IpAddr, overhead: usize) -> Self {
        Self {
            request,
            remote,
            overhead,
            sent_at: Instant::now(),
            received_at: None,
            elapsed: None,
            offender: None,
            error: ErrorQueueInfo::default(),
            reply_ttl: None,
            reply_len: 0,
            status: ProbeStatus::Waiting,
            fatal_message: None,
        }
    }

    pub fn mark_received(&mut self) {
        let now = Instant::now();
        self.received_at = Some(now);
        self.elapsed = Some(now.saturating_duration_since(self.sent_at));
    }

    /// Maps the terminal `status` (and, for `NetError`, `error.err_no`)
    /// to the tagged [`ProbeResult`] delivered to the caller, per
    /// spec.md §4.1 "Classification to ProbeResult".
    pub fn classify(&self) -> ProbeResult {
        let seq = self.request.sequence16();
        let probe_size = if self.reply_len > 0 {
            self.reply_len
        } else {
            self.request.payload_size.max(if matches!(self.request.kind, ProbeKind::Icmp) {
                crate::addr::ICMP_HEADER_SIZE
            } else {
                0
            })
        };
        let elapsed_usec = self.elapsed.map(|d| d.as_micros() as u64).unwrap_or(0);

        match self.status {
            ProbeStatus::FatalError => ProbeResult::Unknown {
                sequence: seq,
                message: self
                    .fatal_message
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
            ProbeStatus::Timeout => ProbeResult::Timeout {
                sequence: seq,
                remote: self.remote,
                probe_size,
                overhead: self.overhead,
            },
            ProbeStatus::Success => ProbeResult::Success {
                sequence: seq,
                remote: self.remote,
                probe_size: self.reply_len.max(probe_size),
                overhead: self.overhead,
                elapsed_usec,
                reply_ttl: self.reply_ttl,
            },
            ProbeStatus::NetError => {
                let offender = self.offender.unwrap_or(self.remote);
                match self.error.err_no {
                    libc::ECONNREFUSED => ProbeResult::ConnectionRefused {
                        sequence: seq,
                        offender,
                        elapsed_usec,
                        probe_size,
                        overhead: self.overhead,
                    },
                    libc::EHOSTUNREACH => ProbeResult::HostUnreachable {
                        sequence: seq,
                        offender,
                        elapsed_usec,
                        probe_size,
                        overhead: self.overhead,
                    },
                    libc::ENETUNREACH => ProbeResult::NetUnreachable {
                        sequence: seq,
                        offender,
                        elapsed_usec,
                        probe_size,
                        overhead: self.overhead,
                    },
                    _ => ProbeResult::NetError {
                        sequence: seq,
                        offender,
                        err_no: self.error.err_no,
                        err_code: self.error.err_code,
                        err_type: self.error.err_type,
                        err_info: self.error.err_info,
                    },
                }
            }
            ProbeStatus::Waiting => unreachable!("classify called on a still-waiting probe"),
        }
    }
}

/// Outcome of one probe, delivered to the caller's callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Success {
        sequence: u16,
        remote: IpAddr,
        probe_size: usize,
        overhead: usize,
        elapsed_usec: u64,
        reply_ttl: Option<u8>,
    },
    Timeout {
        sequence: u16,
        remote: IpAddr,
        probe_size: usize,
        overhead: usize,
    },
    ConnectionRefused {
        sequence: u16,
        offender: IpAddr,
        elapsed_usec: u64,
        probe_size: usize,
        overhead: usize,
    },
    HostUnreachable {
        sequence: u16,
        offender: IpAddr,
        elapsed_usec: u64,
        probe_size: usize,
        overhead: usize,
    },
    NetUnreachable {
        sequence: u16,
        offender: IpAddr,
        elapsed_usec: u64,
        probe_size: usize,
        overhead: usize,
    },
    NetError {
        sequence: u16,
        offender: IpAddr,
        err_no: i32,
        err_code: i32,
        err_type: i32,
        err_info: i32,
    },
    Unknown { sequence: u16, message: String },
}

impl ProbeResult {
    pub fn sequence(&self) -> u16 {
        match self {
            ProbeResult::Success { sequence, .. }
            | ProbeResult::Timeout { sequence, .. }
            | ProbeResult::ConnectionRefused { sequence, .. }
            | ProbeResult::HostUnreachable { sequence, .. }
            | ProbeResult::NetUnreachable { sequence, .. }
            | ProbeResult::NetError { sequence, .. }
            | ProbeResult::Unknown { sequence, .. } => *sequence,
        }
    }

    /// `probe_size` reported for the probes that carry one (`Success`
    /// and `Timeout`); `None` otherwise. Used by MTU discovery to shrink
    /// the active probe size whenever a callback reports a smaller one.
    pub fn probe_size(&self) -> Option<usize> {
        match self {
            ProbeResult::Success { probe_size, .. } | ProbeResult::Timeout { probe_size, .. } => {
                Some(*probe_size)
            }
            _ => None,
        }
    }

    pub fn is_success_or_refused(&self) -> bool {
        matches!(
            self,
            ProbeResult::Success { .. } | ProbeResult::ConnectionRefused { .. }
        )
    }
}

/// Result of a `send_probe` call: either the probe was queued (its
/// callback will run later, exactly once) or it failed synchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Queued,
    FailedSynchronously(ProbeResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(status: ProbeStatus) -> ProbeContext {
        let req = ProbeRequest {
            kind: ProbeKind::Icmp,
            dest_port: 0,
            id: 1,
            sequence: 5,
            ttl: 64,
            timeout_ms: 1000,
            payload_size: 32,
            mtu_discovery: false,
            pattern: vec![],
        };
        let mut c = ProbeContext::new(req, "127.0.0.1".parse().unwrap(), 20);
        c.status = status;
        c
    }

    #[test]
    fn classify_timeout() {
        let c = ctx(ProbeStatus::Timeout);
        assert_eq!(
            c.classify(),
            ProbeResult::Timeout {
                sequence: 5,
                remote: "127.0.0.1".parse().unwrap(),
                probe_size: 32,
                overhead: 20,
            }
        );
    }

    #[test]
    fn classify_net_error_maps_known_errnos() {
        let mut c = ctx(ProbeStatus::NetError);
        c.error.err_no = libc::ECONNREFUSED;
        assert!(matches!(c.classify(), ProbeResult::ConnectionRefused { .. }));

        c.error.err_no = libc::EHOSTUNREACH;
        assert!(matches!(c.classify(), ProbeResult::HostUnreachable { .. }));

        c.error.err_no = libc::ENETUNREACH;
        assert!(matches!(c.classify(), ProbeResult::NetUnreachable { .. }));

        c.error.err_no = libc::EMSGSIZE;
        assert!(matches!(c.classify(), ProbeResult::NetError { .. }));
    }
}
