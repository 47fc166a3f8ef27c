//! Attach the local terminal to a running job
//!
//! Joining replays what the job has printed so far, then relays keystrokes
//! to the remote pseudo-terminal and remote output to the screen until one
//! side ends the session. `Ctrl-]` starts an escape sequence:
//!
//! | keys        | effect                                |
//! |-------------|---------------------------------------|
//! | `^]` `^]`   | send a literal `^]`                   |
//! | `^]` `.`    | detach, leaving the job running       |
//! | `^]` `d`    | same as `^]` `.`                      |
//! | `^]` `x`    | close the job's channel               |
//! | `^]` `?`    | print this summary                    |
//!
//! Whatever scrolled past while joined (remote output and local input)
//! becomes the job's stored output, so a later `show` sees it.

use shoal_core::{Result, ShoalError};
use shoal_ssh::{ChannelWriter, SshTransport};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, instrument, warn};

use crate::fleet::Fleet;
use crate::history::{Attachment, JobRecord, LiveEvent};
use crate::terminal::TerminalGuard;

/// `Ctrl-]`
pub const ESCAPE_BYTE: u8 = 0x1d;

const ESCAPE_HELP: &[u8] = b"\r\n\
[shoal] ^] ^]  send ^]\r\n\
[shoal] ^] .   detach (job keeps running)\r\n\
[shoal] ^] x   close the remote channel\r\n\
[shoal] ^] ?   this help\r\n";

/// Why a join ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The remote side closed the channel
    RemoteClosed,
    /// The user detached; the job is still running
    Detached,
    /// The user closed the job's channel
    Disconnected,
    /// Local input hit end of file
    LocalEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeCommand {
    Detach,
    Disconnect,
    Help,
}

/// Splits keystrokes into bytes for the remote side and escape commands
#[derive(Debug, Default)]
struct EscapeDecoder {
    armed: bool,
}

impl EscapeDecoder {
    fn feed(&mut self, byte: u8, outgoing: &mut Vec<u8>) -> Option<EscapeCommand> {
        if !self.armed {
            if byte == ESCAPE_BYTE {
                self.armed = true;
            } else {
                outgoing.push(byte);
            }
            return None;
        }

        self.armed = false;
        match byte {
            ESCAPE_BYTE => outgoing.push(ESCAPE_BYTE),
            b'.' | b'd' => return Some(EscapeCommand::Detach),
            b'x' => return Some(EscapeCommand::Disconnect),
            b'?' => return Some(EscapeCommand::Help),
            other => outgoing.extend_from_slice(&[ESCAPE_BYTE, other]),
        }
        None
    }
}

/// Joins the local terminal to pending jobs of a [`Fleet`]
pub struct InteractiveBridge<T> {
    fleet: Arc<Fleet<T>>,
}

impl<T: SshTransport + 'static> InteractiveBridge<T> {
    pub fn new(fleet: Arc<Fleet<T>>) -> Self {
        Self { fleet }
    }

    /// Latest job on the referenced host, if it is still pending
    pub fn pending_job(&self, reference: &str) -> Result<Arc<JobRecord>> {
        let (host, latest) = self.fleet.latest_job(reference)?;
        match latest {
            Some(record) if record.is_pending() => Ok(record),
            _ => {
                info!("{} has no pending jobs.", host);
                Err(ShoalError::NoPendingJob(host.to_string()))
            }
        }
    }

    /// Join the referenced host's pending job with the terminal in raw mode.
    ///
    /// Fails before touching the terminal if there is nothing to join.
    #[instrument(skip_all, fields(reference = %reference))]
    pub async fn join<R, W>(
        &self,
        reference: &str,
        input: &mut R,
        output: &mut W,
    ) -> Result<JoinOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let record = self.pending_job(reference)?;
        let _raw = TerminalGuard::acquire()?;
        let outcome = attach(&record, input, output).await;
        debug!("Join on {} ended: {:?}", record.host(), outcome);
        outcome
    }
}

/// Relay between `input`/`output` and `record` until the session ends.
///
/// The terminal mode is the caller's business. The transcript is stored
/// back into the record however the session ends, unless the live feed
/// overflowed and the transcript has gaps. Output collected after the
/// last chunk the session showed is kept behind the transcript.
pub async fn attach<R, W>(
    record: &JobRecord,
    input: &mut R,
    output: &mut W,
) -> Result<JoinOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Attachment {
        replay,
        offset,
        mut live,
        closed,
    } = record.attach();

    let mut session = Session {
        record,
        input,
        output,
        transcript: replay.clone(),
        seen: offset,
        complete: true,
        escape: EscapeDecoder::default(),
    };

    let outcome = session.run(&replay, closed, &mut live).await;

    if session.complete {
        record.store_transcript(session.transcript, session.seen);
    } else {
        warn!(
            "Terminal fell behind while joined to {}; keeping collected output",
            record.host()
        );
    }
    outcome
}

struct Session<'a, R, W> {
    record: &'a JobRecord,
    input: &'a mut R,
    output: &'a mut W,
    transcript: Vec<u8>,
    /// Collected output covered by the transcript
    seen: usize,
    complete: bool,
    escape: EscapeDecoder,
}

impl<R, W> Session<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(
        &mut self,
        replay: &[u8],
        closed: bool,
        live: &mut broadcast::Receiver<LiveEvent>,
    ) -> Result<JoinOutcome> {
        self.screen(replay).await?;
        if closed {
            return Ok(JoinOutcome::RemoteClosed);
        }

        let writer = self.record.writer();
        let mut buf = [0u8; 1024];

        loop {
            tokio::select! {
                event = live.recv() => match event {
                    Ok(LiveEvent::Data(bytes)) => {
                        self.screen(&bytes).await?;
                        self.seen += bytes.len();
                        self.transcript.extend_from_slice(&bytes);
                    }
                    Ok(LiveEvent::Closed) | Err(RecvError::Closed) => {
                        return Ok(JoinOutcome::RemoteClosed);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} output chunks from {}", skipped, self.record.host());
                        self.complete = false;
                    }
                },
                read = self.input.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(JoinOutcome::LocalEof);
                    }
                    if let Some(outcome) = self.keystrokes(&buf[..n], &writer).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn keystrokes(
        &mut self,
        bytes: &[u8],
        writer: &ChannelWriter,
    ) -> Result<Option<JoinOutcome>> {
        let mut outgoing = Vec::with_capacity(bytes.len());
        let mut outcome = None;

        for &byte in bytes {
            match self.escape.feed(byte, &mut outgoing) {
                None => {}
                Some(EscapeCommand::Help) => self.screen(ESCAPE_HELP).await?,
                Some(EscapeCommand::Detach) => {
                    outcome = Some(JoinOutcome::Detached);
                    break;
                }
                Some(EscapeCommand::Disconnect) => {
                    outcome = Some(JoinOutcome::Disconnected);
                    break;
                }
            }
        }

        if !outgoing.is_empty() {
            self.transcript.extend_from_slice(&outgoing);
            if writer.send(outgoing).is_err() {
                return Ok(Some(JoinOutcome::RemoteClosed));
            }
        }

        if outcome == Some(JoinOutcome::Disconnected) {
            warn!("Closing channel to {}", self.record.host());
            writer.close();
        }
        Ok(outcome)
    }

    async fn screen(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.write_all(bytes).await?;
        self.output.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{HostSpec, JobStatus, ShoalConfig};
    use shoal_ssh::{exec_pair, ChannelEnd, ChannelInput, MockHost, MockTransport};
    use tokio::io::{duplex, DuplexStream};

    use crate::dispatcher::JobDispatcher;

    fn record() -> (Arc<JobRecord>, ChannelEnd) {
        let (channel, end) = exec_pair();
        let (_, writer) = channel.into_parts();
        (JobRecord::new(HostSpec::from("web1"), "top", writer), end)
    }

    /// Run `attach` in the background; returns the keyboard and screen ends
    fn spawn_attach(
        record: Arc<JobRecord>,
    ) -> (
        DuplexStream,
        DuplexStream,
        tokio::task::JoinHandle<Result<JoinOutcome>>,
    ) {
        let (keyboard, mut input) = duplex(256);
        let (mut output, screen) = duplex(4096);
        let task = tokio::spawn(async move { attach(&record, &mut input, &mut output).await });
        (keyboard, screen, task)
    }

    async fn collect_input(end: &mut ChannelEnd, want: usize) -> Vec<u8> {
        let mut sent = Vec::new();
        while sent.len() < want {
            match end.next_input().await {
                Some(ChannelInput::Data(bytes)) => sent.extend(bytes),
                other => panic!("unexpected input {:?}", other),
            }
        }
        sent
    }

    #[test]
    fn test_escape_decoder() {
        let mut decoder = EscapeDecoder::default();
        let mut out = Vec::new();

        assert_eq!(decoder.feed(b'a', &mut out), None);
        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(b'q', &mut out), None);
        assert_eq!(out, vec![b'a', ESCAPE_BYTE, ESCAPE_BYTE, b'q']);

        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(b'?', &mut out), Some(EscapeCommand::Help));
        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(b'd', &mut out), Some(EscapeCommand::Detach));
        assert_eq!(decoder.feed(ESCAPE_BYTE, &mut out), None);
        assert_eq!(decoder.feed(b'x', &mut out), Some(EscapeCommand::Disconnect));
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn test_replay_then_live_until_remote_close() {
        let (job, _end) = record();
        job.push_output(b"old\r\n".to_vec());

        let (_keyboard, mut screen, task) = spawn_attach(job.clone());
        tokio::task::yield_now().await;
        job.push_output(b"new\r\n".to_vec());
        job.mark_closed();

        assert_eq!(task.await.unwrap().unwrap(), JoinOutcome::RemoteClosed);

        let mut seen = Vec::new();
        screen.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"old\r\nnew\r\n");
        assert_eq!(job.replay(), b"old\r\nnew\r\n");
    }

    #[tokio::test]
    async fn test_keystrokes_forwarded_then_detach() {
        let (job, mut end) = record();
        let (mut keyboard, _screen, task) = spawn_attach(job.clone());

        keyboard.write_all(b"ls\r").await.unwrap();
        assert_eq!(collect_input(&mut end, 3).await, b"ls\r");

        keyboard.write_all(&[ESCAPE_BYTE, ESCAPE_BYTE]).await.unwrap();
        assert_eq!(collect_input(&mut end, 1).await, vec![ESCAPE_BYTE]);

        keyboard.write_all(&[ESCAPE_BYTE, b'.']).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), JoinOutcome::Detached);

        // Detaching leaves the job alone; typed input is in the transcript
        assert!(job.is_pending());
        assert_eq!(job.replay(), [b'l', b's', b'\r', ESCAPE_BYTE]);
    }

    #[tokio::test]
    async fn test_disconnect_closes_channel() {
        let (job, mut end) = record();
        let (mut keyboard, _screen, task) = spawn_attach(job.clone());

        keyboard.write_all(&[ESCAPE_BYTE, b'x']).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), JoinOutcome::Disconnected);
        assert_eq!(end.next_input().await, Some(ChannelInput::Close));
    }

    #[tokio::test]
    async fn test_local_eof_ends_join() {
        let (job, _end) = record();
        let (keyboard, _screen, task) = spawn_attach(job.clone());

        drop(keyboard);
        assert_eq!(task.await.unwrap().unwrap(), JoinOutcome::LocalEof);
    }

    #[tokio::test]
    async fn test_help_is_shown_not_sent() {
        let (job, _end) = record();
        let (mut keyboard, mut screen, task) = spawn_attach(job.clone());

        keyboard.write_all(&[ESCAPE_BYTE, b'?']).await.unwrap();
        let mut seen = vec![0u8; ESCAPE_HELP.len()];
        screen.read_exact(&mut seen).await.unwrap();
        assert_eq!(seen, ESCAPE_HELP);

        keyboard.write_all(&[ESCAPE_BYTE, b'.']).await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), JoinOutcome::Detached);
        assert!(job.replay().is_empty());
    }

    #[tokio::test]
    async fn test_join_requires_pending_job() {
        let transport = MockTransport::new().with_host("web1", MockHost::reachable());
        let config = ShoalConfig {
            hosts: vec!["web1".to_string(), "web2".to_string()],
            ..Default::default()
        };
        let fleet = Fleet::new(transport, &config);
        let bridge = InteractiveBridge::new(fleet.clone());
        let (mut input, mut output) = duplex(64);

        // No jobs at all
        let err = bridge.join("web2", &mut input, &mut output).await.unwrap_err();
        assert!(matches!(err, ShoalError::NoPendingJob(_)));

        // Finished job
        let dispatcher = JobDispatcher::new(fleet);
        let record = dispatcher.run_one(&HostSpec::from("web1"), "true").await.unwrap();
        assert_eq!(record.status(), JobStatus::Exited(0));
        let err = bridge.join("web1", &mut input, &mut output).await.unwrap_err();
        assert!(matches!(err, ShoalError::NoPendingJob(_)));

        let err = bridge.join("db", &mut input, &mut output).await.unwrap_err();
        assert!(matches!(err, ShoalError::HostNotFound(_)));
    }
}
