//! Finding live Unity editors.
//!
//! Peers advertise themselves by writing port and status files into a
//! shared registry directory ([`registry`]). Nothing written there is
//! trusted on its own: every port is confirmed with a protocol-level
//! [`probe`] before it is reported.

pub mod instance;
pub mod probe;
pub mod registry;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;

pub use instance::{InstanceInfo, InstanceStatus, project_name};
pub use probe::{LivenessProbe, TcpProbe};
pub use registry::{PortFile, Registry, StatusFile, read_json};

use crate::config::{BridgeConfig, DEFAULT_PORT};

pub struct Discovery {
    registry: Registry,
    probe: Arc<dyn LivenessProbe>,
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Discovery {
    pub fn new(registry: Registry, probe: Arc<dyn LivenessProbe>) -> Self {
        Self { registry, probe }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            Registry::new(config.registry_dir.clone()),
            Arc::new(TcpProbe::new(config.probe_timeout)),
        )
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run a registry read on the blocking pool. `None` only if the read
    /// panicked.
    pub async fn scan<T, F>(&self, read: F) -> Option<T>
    where
        F: FnOnce(&Registry) -> T + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        match tokio::task::spawn_blocking(move || read(&registry)).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Registry scan failed");
                None
            }
        }
    }

    pub async fn list_candidates(&self) -> Vec<PathBuf> {
        self.scan(|registry| registry.list_candidates())
            .await
            .unwrap_or_default()
    }

    pub async fn read_status(&self, hash: Option<&str>) -> Option<StatusFile> {
        let hash = hash.map(str::to_owned);
        self.scan(move |registry| registry.read_status(hash.as_deref()))
            .await
            .flatten()
    }

    pub async fn probe(&self, port: u16) -> bool {
        self.probe.is_alive(port).await
    }

    /// Best port to connect to when no instance is named.
    ///
    /// Order: the newest status file's port if it answers; each port file
    /// newest-first if it answers; the first port file that parsed at all;
    /// [`DEFAULT_PORT`].
    pub async fn discover_port(&self) -> u16 {
        if let Some(status) = self.read_status(None).await
            && self.probe(status.unity_port).await
        {
            tracing::debug!(port = status.unity_port, "Using port from newest status file");
            return status.unity_port;
        }

        let port_files = self
            .scan(|registry| {
                registry
                    .list_candidates()
                    .into_iter()
                    .map(|path| {
                        let port = read_json::<PortFile>(&path).map(|f| f.unity_port);
                        (path, port)
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

        let mut first_parsed = None;
        for (path, port) in port_files {
            let port = match port {
                Ok(port) => port,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable port file");
                    continue;
                }
            };
            if self.probe(port).await {
                tracing::debug!(port, path = %path.display(), "Using live port from registry");
                return port;
            }
            first_parsed.get_or_insert(port);
        }

        match first_parsed {
            Some(port) => {
                tracing::debug!(port, "No live port found; using newest registry entry");
                port
            }
            None => {
                tracing::debug!(port = DEFAULT_PORT, "No registry entries; using default port");
                DEFAULT_PORT
            }
        }
    }

    /// Every status file whose port answers a probe, newest first. Older
    /// status files that claim an already-seen port are dropped.
    pub async fn discover_all_instances(&self) -> Vec<InstanceInfo> {
        let status_files = self
            .scan(|registry| {
                registry
                    .status_files()
                    .into_iter()
                    .map(|entry| {
                        let status = read_json::<StatusFile>(&entry.path);
                        (entry, status)
                    })
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

        let mut seen_ports = HashSet::new();
        let mut candidates = Vec::new();
        for (entry, status) in status_files {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable status file");
                    continue;
                }
            };
            if !seen_ports.insert(status.unity_port) {
                tracing::trace!(
                    port = status.unity_port,
                    hash = %entry.hash,
                    "Dropping stale status file for already-seen port"
                );
                continue;
            }
            candidates.push(InstanceInfo::from_status(&entry.hash, status));
        }

        let liveness = join_all(candidates.iter().map(|c| self.probe(c.port))).await;
        let instances: Vec<InstanceInfo> = candidates
            .into_iter()
            .zip(liveness)
            .filter_map(|(info, alive)| {
                if !alive {
                    tracing::debug!(instance = %info.id, port = info.port, "Instance did not answer probe");
                }
                alive.then_some(info)
            })
            .collect();

        tracing::debug!(count = instances.len(), "Discovered live instances");
        instances
    }
}
