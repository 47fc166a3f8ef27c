//! Scripted transport for testing
//!
//! Hosts are keyed by hostname. A reachable host runs each command from a
//! script (output, exit status, delay) and echoes any input straight back,
//! the way a pseudo-terminal with echo on would.

use async_trait::async_trait;
use shoal_core::{HostTarget, Result, ShoalError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{exec_pair, ChannelEvent, ChannelInput, ExecChannel};
use crate::transport::{RemoteSession, SshTransport};

/// How one scripted command behaves
#[derive(Debug, Clone)]
pub struct MockCommand {
    output: Vec<u8>,
    exit_code: Option<u32>,
    delay: Duration,
}

impl MockCommand {
    /// Exit immediately with `code`
    pub fn exits(code: u32) -> Self {
        Self {
            output: Vec::new(),
            exit_code: Some(code),
            delay: Duration::ZERO,
        }
    }

    /// Never finish on its own
    pub fn hangs() -> Self {
        Self::exits(0).with_delay(Duration::from_secs(3600))
    }

    pub fn with_output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.output = output.into();
        self
    }

    /// Time between the output and the exit status
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Close the channel without ever reporting a status
    pub fn without_exit_status(mut self) -> Self {
        self.exit_code = None;
        self
    }
}

impl Default for MockCommand {
    fn default() -> Self {
        Self::exits(0)
    }
}

/// Scripted behavior for one hostname
#[derive(Debug, Clone)]
pub enum MockHost {
    /// Every connect fails with this reason
    Unreachable(String),
    /// Connects; commands not listed exit 0 with no output
    Reachable(HashMap<String, MockCommand>),
}

impl MockHost {
    pub fn reachable() -> Self {
        Self::Reachable(HashMap::new())
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable(reason.into())
    }

    pub fn with_command(mut self, command: &str, script: MockCommand) -> Self {
        if let Self::Reachable(commands) = &mut self {
            commands.insert(command.to_string(), script);
        }
        self
    }
}

/// Mock transport for testing
#[derive(Clone, Default)]
pub struct MockTransport {
    hosts: Arc<Mutex<HashMap<String, MockHost>>>,
    sessions: Arc<Mutex<HashMap<String, Arc<MockSession>>>>,
    connects: Arc<AtomicUsize>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, hostname: &str, host: MockHost) -> Self {
        self.set_host(hostname, host);
        self
    }

    /// Delay every connect attempt, like a slow network
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace a host's script, e.g. to bring an unreachable host back
    pub fn set_host(&self, hostname: &str, host: MockHost) {
        if let Ok(mut hosts) = self.hosts.lock() {
            hosts.insert(hostname.to_string(), host);
        }
    }

    /// Total successful and failed connect attempts
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Kill the transport of the latest session to `hostname`
    pub fn drop_session(&self, hostname: &str) {
        if let Some(session) = self.session(hostname) {
            session.active.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the latest session to `hostname` is still up
    pub fn session_active(&self, hostname: &str) -> bool {
        self.session(hostname)
            .map(|s| s.active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn session(&self, hostname: &str) -> Option<Arc<MockSession>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(hostname).cloned())
    }
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn RemoteSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let host = self
            .hosts
            .lock()
            .map_err(|_| ShoalError::Other("mock transport poisoned".to_string()))?
            .get(&target.hostname)
            .cloned();

        match host {
            None => Err(ShoalError::connection(
                target.to_string(),
                "failed to lookup address information: Name or service not known",
            )),
            Some(MockHost::Unreachable(reason)) => {
                Err(ShoalError::connection(target.to_string(), reason))
            }
            Some(MockHost::Reachable(commands)) => {
                let session = Arc::new(MockSession {
                    commands,
                    active: AtomicBool::new(true),
                });
                if let Ok(mut sessions) = self.sessions.lock() {
                    sessions.insert(target.hostname.clone(), session.clone());
                }
                Ok(session as Arc<dyn RemoteSession>)
            }
        }
    }
}

struct MockSession {
    commands: HashMap<String, MockCommand>,
    active: AtomicBool,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str) -> Result<ExecChannel> {
        if !self.is_active() {
            return Err(ShoalError::Channel("session not active".to_string()));
        }

        let script = self.commands.get(command).cloned().unwrap_or_default();
        let (local, mut end) = exec_pair();

        tokio::spawn(async move {
            if !script.output.is_empty() {
                end.emit(ChannelEvent::Data(script.output.clone()));
            }

            let finished = tokio::time::sleep(script.delay);
            tokio::pin!(finished);
            let mut input_open = true;

            loop {
                tokio::select! {
                    _ = &mut finished => {
                        if let Some(code) = script.exit_code {
                            end.emit(ChannelEvent::Exit(code));
                        }
                        break;
                    }
                    input = end.next_input(), if input_open => match input {
                        Some(ChannelInput::Data(bytes)) => {
                            end.emit(ChannelEvent::Data(bytes));
                        }
                        Some(ChannelInput::Close) => break,
                        None => input_open = false,
                    },
                }
            }
        });

        Ok(local)
    }

    async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::{HostDefaults, HostSpec};

    fn target(spec: &str) -> HostTarget {
        let defaults = HostDefaults {
            username: "test".to_string(),
            password: None,
            port: 22,
        };
        HostTarget::parse(&HostSpec::from(spec), &defaults).unwrap()
    }

    #[tokio::test]
    async fn test_scripted_command() {
        let transport = MockTransport::new().with_host(
            "web1",
            MockHost::reachable()
                .with_command("uptime", MockCommand::exits(0).with_output("up 3 days\n")),
        );

        let session = transport.connect(&target("web1")).await.unwrap();
        let mut channel = session.exec("uptime").await.unwrap();

        assert_eq!(channel.next_event().await, ChannelEvent::Data(b"up 3 days\n".to_vec()));
        assert_eq!(channel.next_event().await, ChannelEvent::Exit(0));
        assert_eq!(channel.next_event().await, ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_and_unknown_hosts_fail() {
        let transport =
            MockTransport::new().with_host("db9", MockHost::unreachable("No route to host"));

        let err = transport.connect(&target("db9")).await.err().unwrap();
        assert!(err.to_string().contains("No route to host"));

        let err = transport.connect(&target("nowhere")).await.err().unwrap();
        assert!(matches!(err, ShoalError::Connection { .. }));
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_input_is_echoed_and_close_ends_channel() {
        let transport = MockTransport::new().with_host(
            "web1",
            MockHost::reachable().with_command("cat", MockCommand::hangs()),
        );

        let session = transport.connect(&target("web1")).await.unwrap();
        let mut channel = session.exec("cat").await.unwrap();
        let writer = channel.writer();

        writer.send(b"hi".to_vec()).unwrap();
        assert_eq!(channel.next_event().await, ChannelEvent::Data(b"hi".to_vec()));

        writer.close();
        assert_eq!(channel.next_event().await, ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn test_latency_delays_connect() {
        let transport = MockTransport::new()
            .with_host("web1", MockHost::reachable())
            .with_latency(Duration::from_millis(100));

        let started = std::time::Instant::now();
        transport.connect(&target("web1")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_dropped_session_is_inactive() {
        let transport = MockTransport::new().with_host("web1", MockHost::reachable());
        let session = transport.connect(&target("web1")).await.unwrap();

        assert!(session.is_active());
        transport.drop_session("web1");
        assert!(!session.is_active());
        assert!(session.exec("true").await.is_err());
    }
}
