//! Unprivileged ICMP/UDP ping and traceroute on top of one reusable
//! probe scheduler.
//!
//! [`manager::ProbeManager`] owns the sockets and the dedicated I/O
//! thread; [`pinger::Pinger`], [`tracer::Tracer`] and
//! [`hop_status::SimpleTracer`] are the three drivers built on it.

pub mod addr;
pub mod error;
pub mod hop_status;
pub mod manager;
pub mod model;
pub mod pinger;
pub mod port;
pub mod tracer;

pub use error::ProbeError;
pub use hop_status::{HopStatus, Response, SimpleTracer, SimpleTracerConfig};
pub use manager::{validate_destination, ProbeManager};
pub use model::{ProbeContext, ProbeKind, ProbeRequest, ProbeResult, ProbeSize, ProbeStatus, SubmitOutcome};
pub use pinger::{Pinger, PingerConfig};
pub use port::PortStrategy;
pub use tracer::{TraceStrategy, Tracer, TracerConfig};
