//! Agent catalog — profiles and the live registry
//!
//! Profiles come from static configuration at startup. The registry wraps
//! them with per-agent status and performance counters that the dispatcher
//! and streaming manager update as tasks complete.

pub mod profile;
pub mod registry;

pub use profile::{AgentProfile, Capability};
pub use registry::{AgentRegistry, AgentState};
