//! Control-plane half: which workers are connected and where jobs go.
//!
//! - [`InstanceRegistry`]: connected instances, their load, and the reaper
//! - [`Forwarder`]: per-instance loop moving queued jobs onto the stream
//! - [`Job`]: the unit of work routed to a worker

pub mod forwarder;
pub mod job;
pub mod registry;

pub use forwarder::Forwarder;
pub use job::{Credentials, Job};
pub use registry::{InstanceHandle, InstanceRegistry, InstanceState, InstanceSummary, ReapReport};
