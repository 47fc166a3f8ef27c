//! Core type definitions for shoal

use serde::{Deserialize, Serialize};

use crate::{Result, ShoalError};

/// Exit code reported for a job whose local wait was abandoned by a kill
pub const CANCELLED_EXIT_CODE: i32 = -1;

/// Exit code recorded when a channel closes without reporting a status
/// (matches what the OpenSSH client returns for a lost session)
pub const LOST_SESSION_EXIT_CODE: u32 = 255;

/// A registered host, as typed by the user: `[user[:password]@]host[:port]`
///
/// Two specs name the same host only if the strings are identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostSpec(String);

impl HostSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never echo an embedded password
        match self.0.split_once('@') {
            Some((user, host)) if user.contains(':') => {
                let name = user.split_once(':').map(|(u, _)| u).unwrap_or(user);
                write!(f, "{}:***@{}", name, host)
            }
            _ => f.write_str(&self.0),
        }
    }
}

impl From<&str> for HostSpec {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HostSpec {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for HostSpec {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Connection defaults for the parts a host spec leaves out
#[derive(Clone, PartialEq, Eq)]
pub struct HostDefaults {
    pub username: String,
    pub password: Option<String>,
    pub port: u16,
}

impl std::fmt::Debug for HostDefaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDefaults")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("port", &self.port)
            .finish()
    }
}

/// A fully resolved connection target
#[derive(Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub username: String,
    pub password: Option<String>,
    pub hostname: String,
    pub port: u16,
}

impl HostTarget {
    /// Split `spec` by the `[user[:password]@]hostname[:port]` grammar.
    ///
    /// Empty components fall back to `defaults`.
    pub fn parse(spec: &HostSpec, defaults: &HostDefaults) -> Result<Self> {
        let raw = spec.as_str().trim();

        let (user_part, host_part) = match raw.split_once('@') {
            Some((user, host)) => (user, host),
            None => ("", raw),
        };

        let (user, password) = match user_part.split_once(':') {
            Some((user, password)) => (user, Some(password)),
            None => (user_part, None),
        };

        let (hostname, port) = match host_part.split_once(':') {
            Some((hostname, port)) => (hostname, Some(port)),
            None => (host_part, None),
        };

        if hostname.is_empty() {
            return Err(ShoalError::InvalidHostSpec(format!(
                "{}: missing hostname",
                spec
            )));
        }

        let port = match port.filter(|p| !p.is_empty()) {
            Some(p) => p.parse::<u16>().map_err(|_| {
                ShoalError::InvalidHostSpec(format!("{}: bad port '{}'", spec, p))
            })?,
            None => defaults.port,
        };

        Ok(Self {
            username: if user.is_empty() {
                defaults.username.clone()
            } else {
                user.to_string()
            },
            password: match password.filter(|p| !p.is_empty()) {
                Some(p) => Some(p.to_string()),
                None => defaults.password.clone(),
            },
            hostname: hostname.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for HostTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

impl std::fmt::Debug for HostTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTarget")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .finish()
    }
}

/// Exit state of one job on one host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Still running (or at least not yet observed to finish)
    #[default]
    Pending,
    /// The local wait was abandoned by a kill order
    Cancelled,
    /// The remote process exited with this status
    Exited(u32),
}

impl JobStatus {
    /// Status as a code: `None` pending, `-1` cancelled, otherwise the exit status
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Pending => None,
            Self::Cancelled => Some(CANCELLED_EXIT_CODE),
            Self::Exited(code) => Some(i32::try_from(*code).unwrap_or(i32::MAX)),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    /// Exited with status zero
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "(still pending)"),
            Self::Cancelled => write!(f, "{} (stopped)", CANCELLED_EXIT_CODE),
            Self::Exited(code) => write!(f, "{}", code),
        }
    }
}
