//! SSH transport abstraction (allows mocking in tests)

use async_trait::async_trait;
use shoal_core::{HostTarget, Result};
use std::sync::Arc;

use crate::channel::ExecChannel;

/// Opens authenticated sessions to remote hosts
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Connect and authenticate to `target`
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn RemoteSession>>;
}

/// One authenticated session to one host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Whether the underlying transport is still up
    fn is_active(&self) -> bool;

    /// Start `command` on a new channel with a pseudo-terminal attached
    async fn exec(&self, command: &str) -> Result<ExecChannel>;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

#[async_trait]
impl<T: SshTransport + ?Sized> SshTransport for Arc<T> {
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn RemoteSession>> {
        (**self).connect(target).await
    }
}
