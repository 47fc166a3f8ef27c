//! The set of managed hosts and everything known about them

use serde::Serialize;
use shoal_core::{duration_from_secs, HostSpec, JobStatus, Result, ShoalConfig};
use shoal_ssh::SshTransport;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

use crate::connection::ConnectionManager;
use crate::history::{JobHistory, JobRecord};
use crate::registry::HostRegistry;

/// One row of `list`
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub index: usize,
    pub host: String,
    pub connected: bool,
    pub last_error: Option<String>,
    pub jobs: usize,
    pub last_status: Option<JobStatus>,
}

/// Shared orchestration context
///
/// Owns the registry, connections, job history and the current job
/// timeout. Handed around as `Arc<Fleet<T>>`.
pub struct Fleet<T> {
    registry: HostRegistry,
    connections: ConnectionManager<T>,
    history: JobHistory,
    job_timeout: RwLock<Duration>,
}

impl<T: SshTransport + 'static> Fleet<T> {
    /// Build a fleet with `config.hosts` registered but not yet connected
    pub fn new(transport: T, config: &ShoalConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: HostRegistry::with_hosts(config.hosts.iter().map(String::as_str)),
            connections: ConnectionManager::new(transport, config.host_defaults()),
            history: JobHistory::new(),
            job_timeout: RwLock::new(config.job_timeout()),
        })
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionManager<T> {
        &self.connections
    }

    pub fn history(&self) -> &JobHistory {
        &self.history
    }

    /// Connect every registered host concurrently. Returns how many are up.
    pub async fn connect_all(self: &Arc<Self>) -> usize {
        let mut pending = JoinSet::new();
        for host in self.registry.hosts() {
            let fleet = self.clone();
            pending.spawn(async move { fleet.connections.connect(&host).await });
        }

        let mut connected = 0;
        while let Some(result) = pending.join_next().await {
            if matches!(result, Ok(true)) {
                connected += 1;
            }
        }
        connected
    }

    /// Register and connect a new host. A failed connect still registers it.
    pub async fn add_host(&self, spec: &str) -> Result<HostSpec> {
        let host = HostSpec::from(spec.trim());
        if let Err(e) = self.registry.add(host.clone()) {
            info!("{} already in host list", host);
            return Err(e);
        }
        self.connections.connect(&host).await;
        Ok(host)
    }

    /// Disconnect a host and drop everything known about it
    pub async fn remove_host(&self, reference: &str) -> Result<HostSpec> {
        let host = self.registry.resolve(reference)?;
        self.connections.disconnect(&host).await;
        self.connections.forget(&host);
        self.history.forget(&host);
        self.registry.remove(&host);
        info!("Removed {}", host);
        Ok(host)
    }

    /// Connection and job summary per host, in registry order
    pub async fn list(&self) -> Vec<HostSummary> {
        let mut rows = Vec::new();
        for (index, host) in self.registry.hosts().into_iter().enumerate() {
            let connection = self.connections.status(&host).await;
            let latest = self.history.latest(&host);
            rows.push(HostSummary {
                index,
                host: host.to_string(),
                connected: connection.connected,
                last_error: connection.last_error,
                jobs: self.history.len(&host),
                last_status: latest.map(|record| record.status()),
            });
        }
        rows
    }

    /// Status of each host's latest job; `None` for hosts with no jobs
    pub fn status(&self) -> Vec<(HostSpec, Option<JobStatus>)> {
        self.registry
            .hosts()
            .into_iter()
            .map(|host| {
                let status = self.history.latest(&host).map(|record| record.status());
                (host, status)
            })
            .collect()
    }

    /// Latest job on the host `reference` resolves to
    pub fn latest_job(&self, reference: &str) -> Result<(HostSpec, Option<Arc<JobRecord>>)> {
        let host = self.registry.resolve(reference)?;
        let latest = self.history.latest(&host);
        Ok((host, latest))
    }

    /// All jobs on the host `reference` resolves to, oldest first
    pub fn jobs(&self, reference: &str) -> Result<(HostSpec, Vec<Arc<JobRecord>>)> {
        let host = self.registry.resolve(reference)?;
        let jobs = self.history.all(&host);
        Ok((host, jobs))
    }

    pub fn clear_history(&self, reference: &str) -> Result<HostSpec> {
        let host = self.registry.resolve(reference)?;
        self.history.clear(&host);
        Ok(host)
    }

    pub fn clear_all_history(&self) {
        self.history.clear_all();
    }

    pub fn job_timeout(&self) -> Duration {
        *self.job_timeout.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the fan-out wait per host. Negative values clamp to zero.
    pub fn set_job_timeout(&self, secs: f64) -> Duration {
        let timeout = duration_from_secs(secs);
        *self.job_timeout.write().unwrap_or_else(|e| e.into_inner()) = timeout;
        info!("Job timeout set to {:?}", timeout);
        timeout
    }

    pub async fn disconnect_all(&self) {
        self.connections.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::ShoalError;
    use shoal_ssh::{MockHost, MockTransport};

    fn config(hosts: &[&str]) -> ShoalConfig {
        ShoalConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            username: Some("ops".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_all_counts_reachable_hosts() {
        let transport = MockTransport::new()
            .with_host("web1", MockHost::reachable())
            .with_host("db9", MockHost::unreachable("Connection refused"));
        let fleet = Fleet::new(transport, &config(&["web1", "db9"]));

        assert_eq!(fleet.connect_all().await, 1);

        let rows = fleet.list().await;
        assert_eq!(rows.len(), 2);
        assert!(rows[0].connected);
        assert!(!rows[1].connected);
        assert!(rows[1].last_error.as_deref().unwrap().contains("refused"));
        assert_eq!(rows[1].index, 1);
    }

    #[tokio::test]
    async fn test_add_and_remove_host() {
        let transport = MockTransport::new().with_host("web3", MockHost::reachable());
        let fleet = Fleet::new(transport.clone(), &config(&["web1"]));

        let host = fleet.add_host("web3").await.unwrap();
        assert!(fleet.connections().test(&host).await);
        assert!(matches!(
            fleet.add_host("web3").await,
            Err(ShoalError::DuplicateHost(_))
        ));

        // Unreachable hosts are still registered
        fleet.add_host("nowhere").await.unwrap();
        assert_eq!(fleet.registry().len(), 3);

        assert_eq!(fleet.remove_host("web3").await.unwrap(), host);
        assert!(!transport.session_active("web3"));
        assert_eq!(fleet.registry().len(), 2);
        assert!(matches!(
            fleet.remove_host("web3").await,
            Err(ShoalError::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_job_timeout_clamps() {
        let fleet = Fleet::new(MockTransport::new(), &config(&[]));
        assert_eq!(fleet.job_timeout(), Duration::from_millis(100));

        assert_eq!(fleet.set_job_timeout(2.5), Duration::from_millis(2500));
        assert_eq!(fleet.set_job_timeout(-3.0), Duration::ZERO);
        assert_eq!(fleet.job_timeout(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_status_without_jobs() {
        let fleet = Fleet::new(MockTransport::new(), &config(&["a", "b"]));
        let status = fleet.status();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|(_, s)| s.is_none()));

        let (host, latest) = fleet.latest_job("b").unwrap();
        assert_eq!(host.as_str(), "b");
        assert!(latest.is_none());
    }
}
