//! The probe manager: a dedicated worker thread that owns every
//! in-flight datagram socket, multiplexes them with `poll(2)`, drains
//! the kernel error queue, enforces per-probe timeouts, and dispatches
//! exactly one callback per submitted probe.
//!
//! The send/receive/classify shape is grounded on
//! `edejong-dbc-mtr-ng::probe::ProbeEngine` (`send_probe_with_protocol`,
//! `collect_responses`, `parse_icmp_response`). The unprivileged
//! `SOCK_DGRAM`+`IPPROTO_ICMP` socket, `MSG_ERRQUEUE` two-pass receive,
//! and PMTU-discovery sockopt are grounded on
//! `clchiou-garage/rust/g1/{nix,tokio}` (`g1_nix::sys::socket`,
//! `g1_tokio::net::icmp::IcmpSocket::next_error`). Reply hop-limit/TTL
//! is read back from the same two-pass receive via
//! `ControlMessageOwned::Ipv6HopLimit`/`Ipv4Ttl`, the ancillary data
//! `IPV6_RECVHOPLIMIT`/`IP_RECVTTL` enable on the socket.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::EventFd;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, SockaddrStorage};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::addr;
use crate::error::ProbeError;
use crate::model::{
    ErrorQueueInfo, ProbeContext, ProbeKind, ProbeRequest, ProbeResult, ProbeStatus, SubmitOutcome,
};

const START_READY_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked (from the manager's worker thread only) with the
/// caller-chosen request id and the probe's outcome.
pub type ProbeCallback = Box<dyn FnMut(u64, ProbeResult) + Send>;

struct Slot {
    ctx: ProbeContext,
    socket: Socket,
    callback: ProbeCallback,
}

struct Shared {
    probes: Mutex<HashMap<u64, Slot>>,
    next_key: AtomicU64,
    wake: EventFd,
    remote: Option<IpAddr>,
    /// The raw, as-constructed destination text; kept only so a
    /// `send_probe` against an unparsable `remote` can report which
    /// string failed to parse.
    remote_text: String,
    source: Option<IpAddr>,
    ident: u16,
    running: AtomicBool,
}

/// Owns one probe session's worker thread and in-flight sockets.
///
/// Constructed for exactly one remote host; parse failure on `remote`
/// leaves the manager permanently inert (every `send_probe` fails
/// synchronously) rather than returning a constructor error, matching
/// spec.md §4.1.
pub struct ProbeManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Validates a destination address the way [`ProbeManager::new`] does
/// internally, but returns the descriptive [`ProbeError`] instead of
/// silently leaving the manager permanently inert. Callers that want a
/// fail-fast constructor can check this before building a manager.
pub fn validate_destination(remote: &str) -> Result<IpAddr, ProbeError> {
    addr::parse_ip(remote).ok_or_else(|| ProbeError::InvalidDestination(remote.to_string()))
}

impl ProbeManager {
    pub fn new(remote: &str, source: &str) -> Self {
        let remote_ip = match validate_destination(remote) {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(error = %e, "probe manager: destination did not parse as IPv4 or IPv6");
                None
            }
        };
        let source_ip = if source.is_empty() {
            None
        } else {
            let parsed = addr::parse_ip(source);
            if parsed.is_none() {
                warn!(source, "probe manager: source address did not parse, using OS default");
            }
            parsed
        };
        let ident: u16 = rand::random();

        let wake = EventFd::new().expect("eventfd creation should not fail under normal limits");

        Self {
            shared: Arc::new(Shared {
                probes: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(1),
                wake,
                remote: remote_ip,
                remote_text: remote.to_string(),
                source: source_ip,
                ident,
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread and waits up to 10s for it to signal
    /// readiness. Returns `false` (but leaves the manager usable — all
    /// sends will simply fail) if readiness was not observed in time or
    /// the worker reported an initialization failure.
    pub fn start(&self) -> bool {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<bool>(1);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("probe-manager".to_string())
            .spawn(move || {
                let _ = ready_tx.send(true);
                run_event_loop(&shared);
            })
            .expect("failed to spawn probe manager worker thread");

        *self.worker.lock().unwrap() = Some(handle);

        ready_rx.recv_timeout(START_READY_TIMEOUT).unwrap_or(false)
    }

    /// Stops the worker: clears the running flag, wakes it, and joins.
    /// Any still-`Waiting` probe is forced to `Timeout` and its callback
    /// is invoked before the thread exits, so no submitted probe is
    /// silently dropped.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.wake.write(1);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Number of probes currently awaiting a callback. Drivers poll
    /// this down to zero before tearing down the manager.
    pub fn in_flight(&self) -> usize {
        self.shared.probes.lock().unwrap().len()
    }

    /// The destination this manager was constructed for, or `None` if
    /// it never parsed (in which case the manager is permanently inert).
    pub fn remote(&self) -> Option<IpAddr> {
        self.shared.remote
    }

    /// Submits one probe. Callable from any thread. `on_result` runs
    /// exactly once, from the worker thread, unless this call itself
    /// fails synchronously (construction/socket/bind/send failure), in
    /// which case the failure is returned directly and no callback
    /// runs at all.
    pub fn send_probe(&self, request: ProbeRequest, on_result: ProbeCallback) -> SubmitOutcome {
        let seq = request.sequence16();

        macro_rules! fail {
            ($err:expr) => {{
                let err: ProbeError = $err;
                warn!(error = %err, "probe manager: send_probe failed synchronously");
                return SubmitOutcome::FailedSynchronously(ProbeResult::Unknown {
                    sequence: seq,
                    message: err.to_string(),
                });
            }};
        }

        let Some(remote) = self.shared.remote else {
            fail!(ProbeError::InvalidDestination(self.shared.remote_text.clone()));
        };

        if !self.shared.running.load(Ordering::SeqCst) {
            fail!(ProbeError::NotRunning);
        }

        let family_is_v6 = remote.is_ipv6();
        let overhead = addr::overhead_bytes(family_is_v6, request.kind);

        let domain = if family_is_v6 { Domain::IPV6 } else { Domain::IPV4 };
        let protocol = match request.kind {
            ProbeKind::Icmp if family_is_v6 => Protocol::ICMPV6,
            ProbeKind::Icmp => Protocol::ICMPV4,
            ProbeKind::Udp => Protocol::UDP,
        };

        let socket = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(s) => s,
            Err(e) => fail!(ProbeError::SocketCreate(e)),
        };

        if let Some(source) = self.shared.source {
            let bind_addr = SocketAddr::new(source, 0);
            if let Err(e) = socket.bind(&SockAddr::from(bind_addr)) {
                fail!(ProbeError::SocketBind(e));
            }
        }

        if let Err(e) = configure_socket(&socket, family_is_v6, &request) {
            fail!(ProbeError::SocketConfig(io::Error::new(io::ErrorKind::Other, format!("{e:#}"))));
        }

        let packet = addr::build_packet(
            request.kind,
            family_is_v6,
            self.shared.ident,
            seq,
            request.payload_size,
            &request.pattern,
        );

        let dest_port = if matches!(request.kind, ProbeKind::Udp) {
            request.dest_port
        } else {
            0
        };
        let dest = SockAddr::from(SocketAddr::new(remote, dest_port));

        let mut ctx = ProbeContext::new(request, remote, overhead);
        match socket.send_to(&packet, &dest) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                // Expected under PMTU probing; the error queue (not the
                // send call) is where the tracer learns the new MTU.
                debug!("sendto returned EMSGSIZE, probing continues via error queue");
            }
            Err(e) => fail!(ProbeError::Send(e)),
        }
        ctx.sent_at = Instant::now();

        let key = self.shared.next_key.fetch_add(1, Ordering::Relaxed);
        self.shared.probes.lock().unwrap().insert(
            key,
            Slot {
                ctx,
                socket,
                callback: on_result,
            },
        );
        let _ = self.shared.wake.write(1);

        SubmitOutcome::Queued
    }
}

impl Drop for ProbeManager {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn configure_socket(socket: &Socket, family_is_v6: bool, request: &ProbeRequest) -> anyhow::Result<()> {
    if request.ttl > 0 {
        if family_is_v6 {
            socket
                .set_unicast_hop_limit(request.ttl as u32)
                .context("setting IPv6 unicast hop limit")?;
        } else {
            socket.set_ttl(request.ttl as u32).context("setting IPv4 TTL")?;
        }
    }

    if request.timeout_ms > 0 {
        socket
            .set_read_timeout(Some(Duration::from_millis(request.timeout_ms as u64)))
            .context("setting SO_RCVTIMEO")?;
    }
    socket
        .set_write_timeout(Some(SEND_TIMEOUT))
        .context("setting SO_SNDTIMEO")?;

    let fd = socket.as_raw_fd();
    if family_is_v6 {
        set_bool_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVERR).context("enabling IPV6_RECVERR")?;
        set_bool_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT).context("enabling IPV6_RECVHOPLIMIT")?;
        if request.mtu_discovery {
            set_int_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, libc::IP_PMTUDISC_PROBE)
                .context("enabling IPV6_MTU_DISCOVER probe mode")?;
        }
    } else {
        set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_RECVERR).context("enabling IP_RECVERR")?;
        set_bool_opt(fd, libc::IPPROTO_IP, libc::IP_RECVTTL).context("enabling IP_RECVTTL")?;
        if request.mtu_discovery {
            set_int_opt(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_PROBE)
                .context("enabling IP_MTU_DISCOVER probe mode")?;
        }
    }

    // Low-delay TOS / traffic class; not fatal if the kernel rejects it.
    let _ = socket.set_tos(libc::IPTOS_LOWDELAY as u32);

    Ok(())
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> anyhow::Result<()> {
    set_int_opt(fd, level, name, 1)
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> anyhow::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        Err(std::io::Error::last_os_error()).context("setsockopt failed")
    } else {
        Ok(())
    }
}

/// Body of the dedicated worker thread. Runs until `running` is
/// cleared, then drains remaining waiting probes as timeouts before
/// returning.
fn run_event_loop(shared: &Shared) {
    loop {
        let running = shared.running.load(Ordering::SeqCst);

        let (keys, fds, deadline_ms) = {
            let probes = shared.probes.lock().unwrap();
            let mut keys = Vec::with_capacity(probes.len());
            let mut fds = Vec::with_capacity(probes.len());
            let mut deadline_ms: Option<u64> = None;
            for (key, slot) in probes.iter() {
                if slot.ctx.status != ProbeStatus::Waiting {
                    continue;
                }
                keys.push(*key);
                fds.push(slot.socket.as_raw_fd());
                if slot.ctx.request.timeout_ms > 0 {
                    let elapsed_ms = slot.ctx.sent_at.elapsed().as_millis() as i64;
                    let remaining = (slot.ctx.request.timeout_ms - elapsed_ms).max(0) as u64;
                    deadline_ms = Some(deadline_ms.map_or(remaining, |d| d.min(remaining)));
                }
            }
            (keys, fds, deadline_ms)
        };

        if !running && keys.is_empty() {
            break;
        }

        let timeout = if !running {
            // Draining on shutdown: don't block waiting for replies
            // that will be force-timed-out momentarily anyway.
            PollTimeout::ZERO
        } else {
            match deadline_ms {
                Some(ms) => PollTimeout::try_from(Duration::from_millis(ms)).unwrap_or(PollTimeout::MAX),
                None => PollTimeout::NONE,
            }
        };

        let wake_fd = shared.wake.as_raw_fd();
        let mut pollfds: Vec<PollFd> = Vec::with_capacity(fds.len() + 1);
        // SAFETY: `wake_fd` and every fd in `fds` outlive this poll call
        // (the eventfd for the manager's lifetime, each probe socket
        // until it is reaped below, which only happens after this call
        // returns).
        pollfds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(wake_fd) }, PollFlags::POLLIN));
        for fd in &fds {
            pollfds.push(PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN));
        }

        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "probe manager: poll failed, retrying");
                continue;
            }
        }

        if let Some(revents) = pollfds[0].revents() {
            if revents.contains(PollFlags::POLLIN) {
                let _ = shared.wake.read();
            }
        }

        let mut readable_keys = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if let Some(revents) = pollfds[i + 1].revents() {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    readable_keys.push(*key);
                }
            }
        }

        {
            let mut probes = shared.probes.lock().unwrap();

            for key in readable_keys {
                if let Some(slot) = probes.get_mut(&key) {
                    handle_readable(slot);
                }
            }

            for slot in probes.values_mut() {
                if slot.ctx.status == ProbeStatus::Waiting
                    && slot.ctx.request.timeout_ms > 0
                    && slot.ctx.sent_at.elapsed() >= Duration::from_millis(slot.ctx.request.timeout_ms as u64)
                {
                    slot.ctx.status = ProbeStatus::Timeout;
                }
            }

            if !running {
                for slot in probes.values_mut() {
                    if slot.ctx.status == ProbeStatus::Waiting {
                        slot.ctx.status = ProbeStatus::Timeout;
                    }
                }
            }

            let done_keys: Vec<u64> = probes
                .iter()
                .filter(|(_, s)| s.ctx.status != ProbeStatus::Waiting)
                .map(|(k, _)| *k)
                .collect();

            let mut finished: Vec<Slot> = Vec::with_capacity(done_keys.len());
            for key in done_keys {
                if let Some(slot) = probes.remove(&key) {
                    finished.push(slot);
                }
            }

            drop(probes); // release the lock before running user callbacks

            for mut slot in finished {
                let id = slot.ctx.request.id;
                let result = slot.ctx.classify();
                (slot.callback)(id, result);
                // `slot.socket` drops here, closing the fd.
            }
        }

        if !running && shared.probes.lock().unwrap().is_empty() {
            break;
        }
    }
}

/// Two-pass receive for one readable probe socket: drain the error
/// queue first (pass 1), then a normal read (pass 2), per spec.md
/// §4.1. If pass 1 yields a `NetError`, pass 2 is skipped.
fn handle_readable(slot: &mut Slot) {
    let fd = slot.socket.as_raw_fd();

    if let Some(err) = recv_error_queue(fd) {
        slot.ctx.offender = err.offender;
        slot.ctx.error = err.info;
        slot.ctx.status = ProbeStatus::NetError;
        slot.ctx.mark_received();
        return;
    }

    let mut buf = [0u8; 65535];
    if let Some((len, hop_limit)) = recv_data(fd, &mut buf) {
        slot.ctx.reply_len = len;
        slot.ctx.reply_ttl = hop_limit;
        slot.ctx.status = ProbeStatus::Success;
        slot.ctx.mark_received();
    }
    // Neither pass yielded anything: spurious wake-up, stays `Waiting`
    // (see SPEC_FULL.md §4 "spurious wake-up" resolution).
}

struct ErrorQueueEntry {
    offender: Option<IpAddr>,
    info: ErrorQueueInfo,
}

fn recv_error_queue(fd: RawFd) -> Option<ErrorQueueEntry> {
    let mut buf = [0u8; 512];
    let mut cmsg_space = nix::cmsg_space!(libc::sock_extended_err, libc::sockaddr_in6);
    let mut iov = [std::io::IoSliceMut::new(&mut buf)];

    let message = match recvmsg::<SockaddrStorage>(
        fd,
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_ERRQUEUE,
    ) {
        Ok(m) => m,
        Err(_) => return None,
    };

    for cmsg in message.cmsgs() {
        match cmsg {
            ControlMessageOwned::Ipv4RecvErr(ee, addr) => {
                return Some(ErrorQueueEntry {
                    offender: addr.map(|a| IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(a.sin_addr.s_addr)))),
                    info: ErrorQueueInfo {
                        err_no: ee.ee_errno as i32,
                        err_code: i32::from(ee.ee_code),
                        err_type: i32::from(ee.ee_type),
                        err_info: ee.ee_info as i32,
                    },
                });
            }
            ControlMessageOwned::Ipv6RecvErr(ee, addr) => {
                let offender = addr.map(|a| {
                    IpAddr::V6(std::net::Ipv6Addr::from(a.sin6_addr.s6_addr))
                });
                return Some(ErrorQueueEntry {
                    offender,
                    info: ErrorQueueInfo {
                        err_no: ee.ee_errno as i32,
                        err_code: i32::from(ee.ee_code),
                        err_type: i32::from(ee.ee_type),
                        err_info: ee.ee_info as i32,
                    },
                });
            }
            _ => {}
        }
    }
    None
}

fn recv_data(fd: RawFd, buf: &mut [u8]) -> Option<(usize, Option<u8>)> {
    let mut cmsg_space = nix::cmsg_space!(libc::c_int);
    let mut iov = [std::io::IoSliceMut::new(buf)];

    let message = match recvmsg::<SockaddrStorage>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty()) {
        Ok(m) => m,
        Err(_) => return None,
    };

    let mut hop_limit = None;
    for cmsg in message.cmsgs() {
        match cmsg {
            ControlMessageOwned::Ipv6HopLimit(limit) => hop_limit = Some(limit as u8),
            ControlMessageOwned::Ipv4Ttl(ttl) => hop_limit = Some(ttl as u8),
            _ => {}
        }
    }

    Some((message.bytes, hop_limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unparsable_destination_is_permanently_inert() {
        let mgr = ProbeManager::new("not-an-ip-address", "");
        let (tx, rx) = mpsc::channel();
        let outcome = mgr.send_probe(
            sample_request(1),
            Box::new(move |id, result| {
                let _ = tx.send((id, result));
            }),
        );
        match outcome {
            SubmitOutcome::FailedSynchronously(ProbeResult::Unknown { .. }) => {}
            other => panic!("expected synchronous Unknown failure, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "callback must not run on synchronous failure");
    }

    #[test]
    fn start_returns_before_ten_second_bound_when_worker_initializes() {
        let mgr = ProbeManager::new("127.0.0.1", "");
        let started = std::time::Instant::now();
        assert!(mgr.start());
        assert!(started.elapsed() < START_READY_TIMEOUT);
        mgr.stop();
    }

    fn sample_request(seq: u32) -> ProbeRequest {
        ProbeRequest {
            kind: ProbeKind::Icmp,
            dest_port: 0,
            id: u64::from(seq),
            sequence: seq,
            ttl: -1,
            timeout_ms: 500,
            payload_size: 32,
            mtu_discovery: false,
            pattern: vec![],
        }
    }
}
