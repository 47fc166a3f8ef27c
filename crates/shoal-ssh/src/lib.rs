//! # shoal-ssh
//!
//! The SSH side of shoal. The orchestrator only ever talks to the
//! [`SshTransport`] and [`RemoteSession`] traits; [`RusshTransport`] is the
//! real implementation and [`MockTransport`] a scripted one for tests.

mod channel;
mod client;
mod mock;
mod transport;

pub use channel::{exec_pair, ChannelEnd, ChannelEvent, ChannelInput, ChannelWriter, ExecChannel};
pub use client::{HostKeyPolicy, RusshTransport};
pub use mock::{MockCommand, MockHost, MockTransport};
pub use transport::{RemoteSession, SshTransport};
