//! Ordered registry of managed hosts

use shoal_core::{HostSpec, Result, ShoalError};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Insertion-ordered set of host specs
///
/// Order matters: it drives numeric references (`:show 0`, `:kill -1`) and the
/// row order of `list` and `status`.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<Vec<HostSpec>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-seeded with `hosts`, duplicates dropped
    pub fn with_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<HostSpec>,
    {
        let registry = Self::new();
        for host in hosts {
            let _ = registry.add(host.into());
        }
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<HostSpec>> {
        self.hosts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<HostSpec>> {
        self.hosts.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `spec`; `DuplicateHost` if it is already registered
    pub fn add(&self, spec: HostSpec) -> Result<()> {
        let mut hosts = self.write();
        if hosts.contains(&spec) {
            return Err(ShoalError::DuplicateHost(spec.to_string()));
        }
        hosts.push(spec);
        Ok(())
    }

    /// Remove an exact entry. Returns whether it was present.
    pub fn remove(&self, spec: &HostSpec) -> bool {
        let mut hosts = self.write();
        let before = hosts.len();
        hosts.retain(|h| h != spec);
        hosts.len() != before
    }

    /// Resolve a user reference to a registered host.
    ///
    /// Integers index the registry (negative counts from the end). Anything
    /// else is an exact match, or failing that a unique substring match.
    pub fn resolve(&self, reference: &str) -> Result<HostSpec> {
        let reference = reference.trim();
        let hosts = self.read();

        if let Ok(index) = reference.parse::<i64>() {
            let len = hosts.len() as i64;
            let position = if index < 0 { index + len } else { index };
            return if (0..len).contains(&position) {
                Ok(hosts[position as usize].clone())
            } else {
                Err(ShoalError::HostNotFound(reference.to_string()))
            };
        }

        if let Some(exact) = hosts.iter().find(|h| h.as_str() == reference) {
            return Ok(exact.clone());
        }

        let candidates: Vec<&HostSpec> = hosts
            .iter()
            .filter(|h| h.as_str().contains(reference))
            .collect();

        match candidates.as_slice() {
            [] => Err(ShoalError::HostNotFound(reference.to_string())),
            [only] => Ok((*only).clone()),
            many => {
                let candidates: Vec<String> = many.iter().map(|h| h.to_string()).collect();
                warn!(
                    "Host name is ambiguous: {} matches {}",
                    reference,
                    candidates.join(", ")
                );
                Err(ShoalError::AmbiguousHost {
                    reference: reference.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Snapshot of the registered hosts in order
    pub fn hosts(&self) -> Vec<HostSpec> {
        self.read().clone()
    }

    pub fn contains(&self, spec: &HostSpec) -> bool {
        self.read().contains(spec)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
