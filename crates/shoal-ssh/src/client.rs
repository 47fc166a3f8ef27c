//! russh-backed transport

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use shoal_core::{HostTarget, Result, ShoalConfig, ShoalError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{exec_pair, ChannelEnd, ChannelEvent, ChannelInput, ExecChannel};
use crate::transport::{RemoteSession, SshTransport};

/// What to do with a host key that is not in known_hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Refuse the connection
    #[default]
    Reject,
    /// Trust on first use and remember the key
    AutoAdd,
}

/// Real SSH transport
#[derive(Clone)]
pub struct RusshTransport {
    config: Arc<client::Config>,
    policy: HostKeyPolicy,
    identity_files: Vec<PathBuf>,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
}

impl RusshTransport {
    /// Build a transport from the user's configuration
    pub fn from_config(config: &ShoalConfig) -> Self {
        let policy = if config.auto_add_hosts {
            warn!("auto_add_hosts is enabled: unknown host keys will be trusted and saved");
            HostKeyPolicy::AutoAdd
        } else {
            HostKeyPolicy::Reject
        };

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        Self {
            config: Arc::new(ssh_config),
            policy,
            identity_files: config.identity_files.clone(),
            known_hosts: config.known_hosts_path(),
            connect_timeout: config.connect_timeout(),
        }
    }

    async fn authenticate(
        &self,
        handle: &mut Handle<HostKeyCheck>,
        target: &HostTarget,
    ) -> Result<()> {
        if let Some(password) = &target.password {
            let accepted = handle
                .authenticate_password(target.username.as_str(), password.as_str())
                .await
                .map_err(|e| ShoalError::connection(target.to_string(), e))?;
            if accepted {
                return Ok(());
            }
            debug!("Password rejected for {}", target);
        }

        for path in &self.identity_files {
            if !path.exists() {
                continue;
            }

            let key_pair = match russh_keys::load_secret_key(path, None) {
                Ok(key_pair) => key_pair,
                Err(e) => {
                    debug!("Skipping identity {}: {}", path.display(), e);
                    continue;
                }
            };

            let accepted = handle
                .authenticate_publickey(target.username.as_str(), Arc::new(key_pair))
                .await
                .map_err(|e| ShoalError::connection(target.to_string(), e))?;
            if accepted {
                debug!("Authenticated {} with {}", target, path.display());
                return Ok(());
            }
        }

        Err(ShoalError::Authentication(target.to_string()))
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    #[instrument(skip(self), fields(target = %target))]
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn RemoteSession>> {
        let handler = HostKeyCheck {
            hostname: target.hostname.clone(),
            port: target.port,
            policy: self.policy,
            known_hosts: self.known_hosts.clone(),
        };

        let connecting = client::connect(
            self.config.clone(),
            (target.hostname.clone(), target.port),
            handler,
        );

        // A zero timeout means "no bound"
        let connected = if self.connect_timeout.is_zero() {
            connecting.await
        } else {
            tokio::time::timeout(self.connect_timeout, connecting)
                .await
                .map_err(|_| {
                    ShoalError::connection(
                        target.to_string(),
                        format!("timed out after {:?}", self.connect_timeout),
                    )
                })?
        };

        let mut handle = connected.map_err(|e| match e {
            russh::Error::UnknownKey => ShoalError::HostKeyRejected(target.hostname.clone()),
            other => ShoalError::connection(target.to_string(), other),
        })?;

        self.authenticate(&mut handle, target).await?;
        info!("Connected to {}", target);

        Ok(Arc::new(RusshSession {
            handle: Mutex::new(handle),
            label: target.to_string(),
        }))
    }
}

/// Known-hosts verification applied during the handshake
struct HostKeyCheck {
    hostname: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl HostKeyCheck {
    fn verify(&self, server_key: &key::PublicKey) -> bool {
        let known = match &self.known_hosts {
            Some(path) => {
                russh_keys::check_known_hosts_path(&self.hostname, self.port, server_key, path)
            }
            None => russh_keys::check_known_hosts(&self.hostname, self.port, server_key),
        };

        match known {
            Ok(true) => true,
            Err(russh_keys::Error::KeyChanged { line }) => {
                error!(
                    "Host key for {} has CHANGED (known_hosts line {}); refusing to connect",
                    self.hostname, line
                );
                false
            }
            Ok(false) => self.on_unknown_key(server_key),
            Err(e) => {
                debug!("Could not read known hosts: {}", e);
                self.on_unknown_key(server_key)
            }
        }
    }

    fn on_unknown_key(&self, server_key: &key::PublicKey) -> bool {
        match self.policy {
            HostKeyPolicy::Reject => {
                warn!(
                    "Unknown host key for {}:{}; refusing (set auto_add_hosts to trust it)",
                    self.hostname, self.port
                );
                false
            }
            HostKeyPolicy::AutoAdd => {
                warn!(
                    "Adding unknown host key for {}:{} to known hosts",
                    self.hostname, self.port
                );
                let (hostname, port) = (self.hostname.as_str(), self.port);
                let learned = match &self.known_hosts {
                    Some(path) => {
                        russh_keys::learn_known_hosts_path(hostname, port, server_key, path)
                    }
                    None => russh_keys::learn_known_hosts(hostname, port, server_key),
                };
                if let Err(e) = learned {
                    warn!("Failed to save host key for {}: {}", self.hostname, e);
                }
                true
            }
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(self.verify(server_public_key))
    }
}

/// An authenticated russh session
struct RusshSession {
    handle: Mutex<Handle<HostKeyCheck>>,
    label: String,
}

#[async_trait]
impl RemoteSession for RusshSession {
    fn is_active(&self) -> bool {
        match self.handle.try_lock() {
            Ok(handle) => !handle.is_closed(),
            // Busy opening a channel, so still alive
            Err(_) => true,
        }
    }

    async fn exec(&self, command: &str) -> Result<ExecChannel> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_session()
                .await
                .map_err(|e| ShoalError::Channel(format!("{}: {}", self.label, e)))?
        };

        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| {
                ShoalError::Channel(format!("{}: pty request failed: {}", self.label, e))
            })?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ShoalError::Channel(format!("{}: exec failed: {}", self.label, e)))?;

        let (local, end) = exec_pair();
        tokio::spawn(pump(channel, end, self.label.clone()));
        Ok(local)
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("Error during disconnect from {}: {}", self.label, e);
        }
    }
}

/// Shuttle bytes between a russh channel and its local half until it closes
async fn pump(mut channel: Channel<client::Msg>, mut end: ChannelEnd, label: String) {
    let mut input_open = true;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    end.emit(ChannelEvent::Data(data.to_vec()));
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    end.emit(ChannelEvent::Data(data.to_vec()));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{} exited with {}", label, exit_status);
                    end.emit(ChannelEvent::Exit(exit_status));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!("{} killed by signal {:?}", label, signal_name);
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            input = end.next_input(), if input_open => match input {
                Some(ChannelInput::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!("Write to {} failed: {}", label, e);
                        break;
                    }
                }
                Some(ChannelInput::Close) => {
                    let _ = channel.close().await;
                    break;
                }
                None => input_open = false,
            },
        }
    }

    debug!("Channel to {} closed", label);
}
