//! One-shot mode: run a command everywhere, wait for it, report, exit

use serde_json::json;
use shoal_core::{HostSpec, JobStatus, Result};
use shoal_orchestrator::{Fleet, HostOutcome, JobDispatcher, JobRecord, JobWorker};
use shoal_ssh::SshTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::format::{format_columns, render_job, status_text};

/// Final state of one host after a batch run
struct HostResult {
    host: HostSpec,
    record: Option<Arc<JobRecord>>,
    error: Option<String>,
}

impl HostResult {
    fn status(&self) -> Option<JobStatus> {
        self.record.as_ref().map(|record| record.status())
    }

    fn succeeded(&self) -> bool {
        self.status().map(|status| status.is_success()).unwrap_or(false)
    }
}

/// How often an interrupted run repeats its stop request, for workers that
/// were still connecting the first time
const KILL_RETRY: Duration = Duration::from_millis(200);

/// Run `command` on every host and print the results.
/// Returns whether every host ran it successfully.
pub async fn run<T: SshTransport + 'static>(
    fleet: Arc<Fleet<T>>,
    command: &str,
    json: bool,
) -> Result<bool> {
    let dispatcher = JobDispatcher::new(fleet.clone());
    let mut report = dispatcher.run_all(command).await;
    let stragglers = report.take_stragglers();

    let mut results: Vec<HostResult> = report
        .outcomes
        .into_iter()
        .map(|(host, outcome)| {
            let (record, error) = match outcome {
                HostOutcome::Finished { .. } => (fleet.history().latest(&host), None),
                HostOutcome::Failed { reason } => (None, Some(reason)),
                HostOutcome::StillPending => (None, None),
            };
            HostResult { host, record, error }
        })
        .collect();

    for (host, joined) in wait_for_stragglers(&dispatcher, stragglers).await {
        if let Some(result) = results.iter_mut().find(|result| result.host == host) {
            match joined {
                Ok(record) => result.record = Some(record),
                Err(reason) => result.error = Some(reason),
            }
        }
    }

    if json {
        print_json(&results)?;
    } else {
        print_text(&results);
    }

    Ok(!results.is_empty() && results.iter().all(HostResult::succeeded))
}

/// Wait for the workers that outlived the job timeout. Ctrl-C stops their
/// jobs instead.
async fn wait_for_stragglers<T: SshTransport + 'static>(
    dispatcher: &JobDispatcher<T>,
    stragglers: Vec<(HostSpec, JobWorker)>,
) -> Vec<(HostSpec, std::result::Result<Arc<JobRecord>, String>)> {
    if stragglers.is_empty() {
        return Vec::new();
    }

    info!("Waiting for {} host(s) to finish", stragglers.len());
    let mut interrupted = false;
    let mut finished = Vec::with_capacity(stragglers.len());

    for (host, mut worker) in stragglers {
        let joined = loop {
            if interrupted {
                dispatcher.kill_all();
                if let Ok(joined) = tokio::time::timeout(KILL_RETRY, &mut worker).await {
                    break joined;
                }
                continue;
            }
            tokio::select! {
                joined = &mut worker => break joined,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping remaining jobs");
                    interrupted = true;
                }
            }
        };

        let result = match joined {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("worker aborted: {}", e)),
        };
        finished.push((host, result));
    }
    finished
}

fn print_text(results: &[HostResult]) {
    for result in results {
        if let Some(record) = &result.record {
            println!("{}", render_job(&result.host, record));
        }
    }

    let rows: Vec<Vec<String>> = results
        .iter()
        .map(|result| {
            let status = match &result.error {
                Some(reason) => format!("(failed) {}", reason),
                None => status_text(result.status()),
            };
            vec![result.host.to_string(), status]
        })
        .collect();

    println!();
    println!("{}", format_columns(&["host", "status"], &rows));
}

fn print_json(results: &[HostResult]) -> Result<()> {
    let rows: Vec<serde_json::Value> = results
        .iter()
        .map(|result| {
            json!({
                "host": result.host.to_string(),
                "error": result.error,
                "job": result.record.as_ref().map(|record| record.summary()),
            })
        })
        .collect();

    let text = serde_json::to_string_pretty(&rows)
        .map_err(|e| shoal_core::ShoalError::Other(format!("Failed to encode results: {}", e)))?;
    println!("{}", text);
    Ok(())
}
