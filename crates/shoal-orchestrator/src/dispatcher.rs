//! Job dispatch: run a command on one host or fan it out to all of them
//!
//! Every job gets a worker that waits for the remote exit status or the
//! job's kill order, whichever comes first. [`JobDispatcher::run_all`] waits
//! on the workers in registration order, giving each one the job timeout; a
//! worker that is still busy is left running and reported as pending.

use serde::Serialize;
use shoal_core::{HostSpec, JobStatus, Result, ShoalError};
use shoal_ssh::{ChannelEvent, SshTransport};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::fleet::Fleet;
use crate::history::JobRecord;

/// How one host fared in a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HostOutcome {
    /// The job ended within the timeout
    Finished { status: JobStatus },
    /// Still running; check `status` later
    StillPending,
    /// No job was started (connect or exec failed)
    Failed { reason: String },
}

impl HostOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished { status } if status.is_success())
    }
}

/// Task running one host's job; yields the record once the job ends
pub type JobWorker = JoinHandle<Result<Arc<JobRecord>>>;

/// Result of [`JobDispatcher::run_all`], one entry per host in registry order
///
/// Workers that outlived the timeout stay in the report. Dropping the report
/// leaves them running in the background.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<(HostSpec, HostOutcome)>,
    stragglers: Vec<(HostSpec, JobWorker)>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_success())
    }

    /// Hosts whose job outlived the timeout
    pub fn pending(&self) -> Vec<HostSpec> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, HostOutcome::StillPending))
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Hand over the workers of pending hosts, e.g. to wait for them
    pub fn take_stragglers(&mut self) -> Vec<(HostSpec, JobWorker)> {
        std::mem::take(&mut self.stragglers)
    }
}

/// Runs commands on the hosts of a [`Fleet`]
pub struct JobDispatcher<T> {
    fleet: Arc<Fleet<T>>,
}

impl<T> Clone for JobDispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            fleet: self.fleet.clone(),
        }
    }
}

impl<T: SshTransport + 'static> JobDispatcher<T> {
    pub fn new(fleet: Arc<Fleet<T>>) -> Self {
        Self { fleet }
    }

    pub fn fleet(&self) -> &Arc<Fleet<T>> {
        &self.fleet
    }

    /// Run `command` on `host` and wait for it to end or be killed.
    ///
    /// Fails without recording anything if the host cannot be reached or the
    /// channel cannot be opened.
    #[instrument(skip_all, fields(host = %host))]
    pub async fn run_one(&self, host: &HostSpec, command: &str) -> Result<Arc<JobRecord>> {
        let session = self
            .fleet
            .connections()
            .ensure_connected(host)
            .await
            .map_err(|e| {
                error!("Reconnection attempt to {} failed: {}", host, e);
                e
            })?;

        let channel = session.exec(command).await.map_err(|e| {
            error!("Could not start job on {}: {}", host, e);
            e
        })?;

        let (events, writer) = channel.into_parts();
        let record = JobRecord::new(host.clone(), command, writer);
        self.fleet.history().append(host, record.clone());
        tokio::spawn(collect_output(record.clone(), events));

        let status = wait_for_exit(&record).await;
        debug!("Job on {} ended: {}", host, status);
        Ok(record)
    }

    /// Run `command` on every registered host at once
    pub async fn run_all(&self, command: &str) -> DispatchReport {
        let hosts = self.fleet.registry().hosts();
        if hosts.is_empty() {
            warn!("No hosts specified.");
            return DispatchReport::default();
        }

        let mut workers: Vec<(HostSpec, JobWorker)> = Vec::with_capacity(hosts.len());
        for host in hosts {
            info!("Starting job on {}", host);
            let dispatcher = self.clone();
            let worker_host = host.clone();
            let command = command.to_string();
            let worker =
                tokio::spawn(async move { dispatcher.run_one(&worker_host, &command).await });
            workers.push((host, worker));
        }

        let timeout = self.fleet.job_timeout();
        let mut report = DispatchReport::default();
        for (host, mut worker) in workers {
            let outcome = match tokio::time::timeout(timeout, &mut worker).await {
                Err(_) => {
                    info!("Job on {} still pending", host);
                    report.stragglers.push((host.clone(), worker));
                    HostOutcome::StillPending
                }
                Ok(Ok(Ok(record))) => {
                    let status = record.status();
                    info!("Job on {} finished", host);
                    if !status.is_success() {
                        error!("Error running job on {} (exit code {})", host, status);
                    }
                    HostOutcome::Finished { status }
                }
                Ok(Ok(Err(e))) => HostOutcome::Failed {
                    reason: e.to_string(),
                },
                Ok(Err(e)) => {
                    error!("Worker for {} aborted: {}", host, e);
                    HostOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.outcomes.push((host, outcome));
        }

        report
    }

    /// Stop the pending job on the host `reference` resolves to
    pub fn kill(&self, reference: &str) -> Result<HostSpec> {
        let host = self.fleet.registry().resolve(reference)?;
        self.kill_host(&host)?;
        Ok(host)
    }

    /// Stop the pending job on `host`
    pub fn kill_host(&self, host: &HostSpec) -> Result<()> {
        match self.fleet.history().latest(host) {
            Some(record) if record.request_kill() => {
                info!("Requested stop for job on {}", host);
                Ok(())
            }
            _ => {
                info!("{} has no pending jobs.", host);
                Err(ShoalError::NoPendingJob(host.to_string()))
            }
        }
    }

    /// Stop every pending job. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        self.fleet
            .registry()
            .hosts()
            .iter()
            .filter(|host| {
                self.fleet
                    .history()
                    .latest(host)
                    .map(|record| record.is_pending())
                    .unwrap_or(false)
            })
            .filter(|host| self.kill_host(host).is_ok())
            .count()
    }

    /// Stop all jobs and close all sessions
    pub async fn shutdown(&self) {
        let killed = self.kill_all();
        if killed > 0 {
            info!("Stopped {} pending job(s)", killed);
        }
        self.fleet.disconnect_all().await;
    }
}

/// Wait for the remote exit or the job's kill order and record the outcome.
///
/// The kill flag is read under the record's state lock, the same lock
/// [`JobRecord::request_kill`] sets it under, so an accepted kill always
/// ends as `Cancelled`.
async fn wait_for_exit(record: &JobRecord) -> JobStatus {
    let kill = record.kill_order();
    loop {
        tokio::select! {
            biased;
            _ = kill.requested() => {
                if kill.take() {
                    record.close_channel();
                    record.finalize(JobStatus::Cancelled);
                    info!("Job on {} cancelled", record.host());
                    return record.status();
                }
            }
            code = record.remote_exit() => {
                return record.finalize_with(|| {
                    if kill.take() {
                        record.close_channel();
                        JobStatus::Cancelled
                    } else {
                        JobStatus::Exited(code)
                    }
                });
            }
        }
    }
}

/// Drain a job's channel into its record until the channel closes
async fn collect_output(
    record: Arc<JobRecord>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(bytes) => record.push_output(bytes),
            ChannelEvent::Exit(code) => record.note_remote_exit(code),
            ChannelEvent::Closed => break,
        }
    }
    record.mark_closed();
}
