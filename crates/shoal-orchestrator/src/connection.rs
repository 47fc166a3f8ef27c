//! Per-host SSH session lifecycle

use serde::Serialize;
use shoal_core::{HostDefaults, HostSpec, HostTarget, Result, ShoalError};
use shoal_ssh::{RemoteSession, SshTransport};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

/// Connection state for one host
#[derive(Default)]
struct ConnectionRecord {
    connected: bool,
    session: Option<Arc<dyn RemoteSession>>,
    last_error: Option<String>,
}

impl ConnectionRecord {
    /// Live session, if the transport behind it is still up.
    /// A dead transport flips the record to disconnected.
    fn probe(&mut self, host: &HostSpec) -> Option<Arc<dyn RemoteSession>> {
        if !self.connected {
            return None;
        }
        match &self.session {
            Some(session) if session.is_active() => Some(session.clone()),
            _ => {
                info!("Connection to {} has dropped", host);
                self.connected = false;
                self.session = None;
                self.last_error = Some("transport no longer active".to_string());
                None
            }
        }
    }
}

/// Point-in-time view of a host's connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_error: Option<String>,
}

/// Owns one SSH session per host
///
/// The outer map is only locked long enough to find a host's slot; each slot
/// has its own async lock so a slow handshake to one host never holds up
/// another.
pub struct ConnectionManager<T> {
    transport: T,
    defaults: HostDefaults,
    records: RwLock<HashMap<HostSpec, Arc<Mutex<ConnectionRecord>>>>,
}

impl<T: SshTransport> ConnectionManager<T> {
    pub fn new(transport: T, defaults: HostDefaults) -> Self {
        Self {
            transport,
            defaults,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn slot(&self, host: &HostSpec) -> Arc<Mutex<ConnectionRecord>> {
        if let Some(slot) = self.existing(host) {
            return slot;
        }
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.entry(host.clone()).or_default().clone()
    }

    fn existing(&self, host: &HostSpec) -> Option<Arc<Mutex<ConnectionRecord>>> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .cloned()
    }

    /// Open a session to `host` unless one is already up.
    ///
    /// Failures are logged and remembered, never returned. Returns whether
    /// the host is connected afterwards.
    #[instrument(skip_all, fields(host = %host))]
    pub async fn connect(&self, host: &HostSpec) -> bool {
        let slot = self.slot(host);
        let mut record = slot.lock().await;
        self.connect_locked(host, &mut record).await.is_some()
    }

    async fn connect_locked(
        &self,
        host: &HostSpec,
        record: &mut ConnectionRecord,
    ) -> Option<Arc<dyn RemoteSession>> {
        if let Some(session) = record.probe(host) {
            debug!("Already connected to {}", host);
            return Some(session);
        }

        let attempt = match HostTarget::parse(host, &self.defaults) {
            Ok(target) => self.transport.connect(&target).await,
            Err(e) => Err(e),
        };

        match attempt {
            Ok(session) => {
                record.connected = true;
                record.session = Some(session.clone());
                record.last_error = None;
                Some(session)
            }
            Err(e) => {
                error!("Connecting to host {} failed: {}", host, e);
                record.connected = false;
                record.session = None;
                record.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// Whether `host` has a live session. Notices dropped transports.
    pub async fn test(&self, host: &HostSpec) -> bool {
        match self.existing(host) {
            Some(slot) => slot.lock().await.probe(host).is_some(),
            None => false,
        }
    }

    /// Live session to `host`, reconnecting once if it has dropped
    pub async fn ensure_connected(&self, host: &HostSpec) -> Result<Arc<dyn RemoteSession>> {
        let slot = self.slot(host);
        let mut record = slot.lock().await;

        if let Some(session) = record.probe(host) {
            return Ok(session);
        }

        info!("Host {} disconnected. Attempting automatic reconnection", host);
        match self.connect_locked(host, &mut record).await {
            Some(session) => Ok(session),
            None => {
                let reason = record
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "not connected".to_string());
                Err(ShoalError::connection(host.to_string(), reason))
            }
        }
    }

    /// Close the session to `host` if one is up
    pub async fn disconnect(&self, host: &HostSpec) {
        let Some(slot) = self.existing(host) else {
            return;
        };
        let mut record = slot.lock().await;
        if let Some(session) = record.session.take() {
            session.close().await;
            info!("Connection to host {} closed.", host);
        }
        record.connected = false;
    }

    /// Close every open session
    pub async fn disconnect_all(&self) {
        let hosts: Vec<HostSpec> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        for host in hosts {
            self.disconnect(&host).await;
        }
    }

    /// Drop all state for `host`. Call [`disconnect`](Self::disconnect) first.
    pub fn forget(&self, host: &HostSpec) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host);
    }

    /// Current state without probing the transport
    pub async fn status(&self, host: &HostSpec) -> ConnectionStatus {
        match self.existing(host) {
            Some(slot) => {
                let record = slot.lock().await;
                ConnectionStatus {
                    connected: record.connected,
                    last_error: record.last_error.clone(),
                }
            }
            None => ConnectionStatus::default(),
        }
    }
}
