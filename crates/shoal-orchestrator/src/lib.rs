//! # shoal-orchestrator
//!
//! Runs one shell command on many hosts at once.
//!
//! A [`Fleet`] holds the registered hosts, their SSH sessions and the job
//! history for each. The [`JobDispatcher`] fans commands out and collects
//! exit codes, and the [`InteractiveBridge`] attaches the local terminal to a
//! job that is still running.
//!
//! ```text
//! Fleet ── HostRegistry        ordered host specs, reference resolution
//!       ── ConnectionManager   one session per host, reconnect on demand
//!       ── JobHistory          JobRecords per host (status, output, kill order)
//! ```

mod bridge;
mod connection;
mod dispatcher;
mod fleet;
mod history;
mod registry;
mod terminal;

pub use bridge::{attach, InteractiveBridge, JoinOutcome, ESCAPE_BYTE};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use dispatcher::{DispatchReport, HostOutcome, JobDispatcher, JobWorker};
pub use fleet::{Fleet, HostSummary};
pub use history::{
    Attachment, JobHistory, JobRecord, JobSummary, KillOrder, LiveEvent, OutputBuffer,
};
pub use registry::HostRegistry;
pub use terminal::TerminalGuard;
