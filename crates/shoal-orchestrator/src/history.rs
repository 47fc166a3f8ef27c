//! Job records and per-host job history
//!
//! A [`JobRecord`] is shared between the worker that waits on it, the
//! background task collecting its output, and whoever inspects or joins it.
//! Everything mutable sits behind the record's own state lock; the terminal
//! status is written at most once.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shoal_core::{HostSpec, JobStatus, LOST_SESSION_EXIT_CODE};
use shoal_ssh::ChannelWriter;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{broadcast, watch, Notify};
use uuid::Uuid;

/// Capacity of the live output feed a joined terminal listens on
const LIVE_FEED_CAPACITY: usize = 1024;

/// Growable byte buffer with a read cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    cursor: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Everything written so far, regardless of the cursor
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Read from the cursor to the end
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.bytes[self.cursor..].to_vec();
        self.cursor = self.bytes.len();
        rest
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Swap in new contents and rewind
    pub fn replace(&mut self, bytes: Vec<u8>) {
        self.bytes = bytes;
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Read for OutputBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.bytes[self.cursor..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }
}

/// Request to stop one job
#[derive(Debug, Default)]
pub struct KillOrder {
    requested: AtomicBool,
    wake: Notify,
}

impl KillOrder {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Consume the order; true if one was set
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Resolves once an order has been requested (may wake spuriously)
    pub async fn requested(&self) {
        self.wake.notified().await
    }
}

/// What a joined terminal sees after its replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Data(Vec<u8>),
    /// The remote end closed the channel; nothing follows
    Closed,
}

#[derive(Debug, Default)]
struct JobState {
    status: JobStatus,
    finished_at: Option<DateTime<Utc>>,
    output: OutputBuffer,
    stream_closed: bool,
}

/// Snapshot handed to a joining terminal
///
/// Taken under the record's state lock, so `live` starts exactly where
/// `replay` ends. `offset` is the length of the collected output at that
/// point.
pub struct Attachment {
    pub replay: Vec<u8>,
    pub offset: usize,
    pub live: broadcast::Receiver<LiveEvent>,
    pub closed: bool,
}

/// One command run on one host
pub struct JobRecord {
    id: Uuid,
    host: HostSpec,
    command: String,
    started_at: DateTime<Utc>,
    channel: ChannelWriter,
    kill: KillOrder,
    state: Mutex<JobState>,
    live: broadcast::Sender<LiveEvent>,
    remote_exit: watch::Sender<Option<u32>>,
    settled: watch::Sender<JobStatus>,
}

impl std::fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("host", &self.host.to_string())
            .field("command", &self.command)
            .field("status", &self.status())
            .finish()
    }
}

impl JobRecord {
    pub fn new(host: HostSpec, command: impl Into<String>, channel: ChannelWriter) -> Arc<Self> {
        let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        let (remote_exit, _) = watch::channel(None);
        let (settled, _) = watch::channel(JobStatus::Pending);
        Arc::new(Self {
            id: Uuid::new_v4(),
            host,
            command: command.into(),
            started_at: Utc::now(),
            channel,
            kill: KillOrder::default(),
            state: Mutex::new(JobState::default()),
            live,
            remote_exit,
            settled,
        })
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &HostSpec {
        &self.host
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock().finished_at
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status().is_pending()
    }

    /// Input side of the job's channel
    pub fn writer(&self) -> ChannelWriter {
        self.channel.clone()
    }

    /// Ask the transport to close the job's channel
    pub fn close_channel(&self) {
        self.channel.close();
    }

    pub fn kill_order(&self) -> &KillOrder {
        &self.kill
    }

    /// Ask this job's worker to stop waiting on it. Returns false if the job
    /// already ended.
    pub fn request_kill(&self) -> bool {
        self.if_pending(|| self.kill.request())
    }

    /// Move out of `Pending`. Later calls are ignored; returns whether this
    /// call did the transition.
    pub fn finalize(&self, status: JobStatus) -> bool {
        if status.is_pending() {
            return false;
        }
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.finished_at = Some(Utc::now());
        self.settled.send_replace(status);
        true
    }

    /// Like [`finalize`](Self::finalize), but the status is decided while the
    /// state lock is held. `decide` is not called if the job already ended.
    pub fn finalize_with(&self, decide: impl FnOnce() -> JobStatus) -> JobStatus {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return state.status;
        }
        let status = decide();
        if status.is_terminal() {
            state.status = status;
            state.finished_at = Some(Utc::now());
            self.settled.send_replace(status);
        }
        state.status
    }

    /// Wait until the job leaves `Pending`
    pub async fn wait(&self) -> JobStatus {
        let mut settled = self.settled.subscribe();
        let status = match settled.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Run `action` under the state lock if the job is still pending
    pub fn if_pending(&self, action: impl FnOnce()) -> bool {
        let state = self.lock();
        if state.status.is_pending() {
            action();
            true
        } else {
            false
        }
    }

    /// Whole output from the start; leaves the buffer rewound
    pub fn replay(&self) -> Vec<u8> {
        let mut state = self.lock();
        state.output.rewind();
        let bytes = state.output.read_remaining();
        state.output.rewind();
        bytes
    }

    /// Store a joined terminal's transcript as the job's output.
    ///
    /// `seen` is how much of the collected output the transcript already
    /// covers; whatever was collected past it is appended.
    pub fn store_transcript(&self, mut transcript: Vec<u8>, seen: usize) {
        let mut state = self.lock();
        if let Some(tail) = state.output.as_bytes().get(seen..) {
            transcript.extend_from_slice(tail);
        }
        state.output.replace(transcript);
    }

    pub fn output_len(&self) -> usize {
        self.lock().output.len()
    }

    /// Append remote output and forward it to any joined terminal
    pub fn push_output(&self, bytes: Vec<u8>) {
        let mut state = self.lock();
        state.output.append(&bytes);
        let _ = self.live.send(LiveEvent::Data(bytes));
    }

    /// The remote command reported its exit status
    pub fn note_remote_exit(&self, code: u32) {
        self.remote_exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(code);
                true
            } else {
                false
            }
        });
    }

    /// The channel is gone. A job that never reported a status counts as
    /// having lost its session.
    pub fn mark_closed(&self) {
        {
            let mut state = self.lock();
            state.stream_closed = true;
            let _ = self.live.send(LiveEvent::Closed);
        }
        self.note_remote_exit(LOST_SESSION_EXIT_CODE);
    }

    /// Exit status reported by the remote side, waiting for it if needed
    pub async fn remote_exit(&self) -> u32 {
        let mut exit = self.remote_exit.subscribe();
        let code = match exit.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(LOST_SESSION_EXIT_CODE),
            Err(_) => LOST_SESSION_EXIT_CODE,
        };
        code
    }

    /// Snapshot of the buffered output plus a feed of what follows
    pub fn attach(&self) -> Attachment {
        let state = self.lock();
        Attachment {
            replay: state.output.as_bytes().to_vec(),
            offset: state.output.len(),
            live: self.live.subscribe(),
            closed: state.stream_closed,
        }
    }

    pub fn summary(&self) -> JobSummary {
        let state = self.lock();
        JobSummary {
            id: self.id,
            host: self.host.to_string(),
            command: self.command.clone(),
            started_at: self.started_at,
            finished_at: state.finished_at,
            status: state.status,
            exit_code: state.status.code(),
            output: String::from_utf8_lossy(state.output.as_bytes()).into_owned(),
        }
    }
}

/// Serializable view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub host: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub output: String,
}

type HostJobs = Arc<Mutex<Vec<Arc<JobRecord>>>>;

/// Ordered job records per host
#[derive(Debug, Default)]
pub struct JobHistory {
    hosts: RwLock<HashMap<HostSpec, HostJobs>>,
}

impl JobHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self, host: &HostSpec) -> Option<HostJobs> {
        self.hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(host)
            .cloned()
    }

    fn jobs_or_insert(&self, host: &HostSpec) -> HostJobs {
        if let Some(jobs) = self.jobs(host) {
            return jobs;
        }
        self.hosts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.clone())
            .or_default()
            .clone()
    }

    pub fn append(&self, host: &HostSpec, record: Arc<JobRecord>) {
        let jobs = self.jobs_or_insert(host);
        jobs.lock().unwrap_or_else(|e| e.into_inner()).push(record);
    }

    pub fn latest(&self, host: &HostSpec) -> Option<Arc<JobRecord>> {
        let jobs = self.jobs(host)?;
        let jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.last().cloned()
    }

    /// Oldest first
    pub fn all(&self, host: &HostSpec) -> Vec<Arc<JobRecord>> {
        match self.jobs(host) {
            Some(jobs) => jobs.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, host: &HostSpec) -> usize {
        match self.jobs(host) {
            Some(jobs) => jobs.lock().unwrap_or_else(|e| e.into_inner()).len(),
            None => 0,
        }
    }

    /// Drop a host's records, keeping the host known
    pub fn clear(&self, host: &HostSpec) {
        if let Some(jobs) = self.jobs(host) {
            jobs.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    pub fn clear_all(&self) {
        let all: Vec<HostJobs> = self
            .hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for jobs in all {
            jobs.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }

    /// Drop a host entirely
    pub fn forget(&self, host: &HostSpec) {
        self.hosts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(host);
    }
}
