//! Process-wide pool of editor connections.
//!
//! The pool is the only owner of [`Connection`]s: callers borrow an `Arc`
//! for one call at a time. One lock guards both the id-to-connection map
//! and the discovery cache; it is never held across an `.await`.

pub mod resolve;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;

pub use resolve::{resolve, resolve_identifier};

use crate::config::BridgeConfig;
use crate::connection::Connection;
use crate::discovery::{Discovery, InstanceInfo};
use crate::error::{CommandError, ResolutionError};

struct DiscoveryCache {
    instances: Arc<Vec<InstanceInfo>>,
    scanned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, Arc<Connection>>,
    cache: Option<DiscoveryCache>,
}

pub struct ConnectionPool {
    config: BridgeConfig,
    discovery: Arc<Discovery>,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(config: BridgeConfig) -> Self {
        let discovery = Arc::new(Discovery::from_config(&config));
        Self::with_discovery(config, discovery)
    }

    pub fn with_discovery(config: BridgeConfig, discovery: Arc<Discovery>) -> Self {
        Self {
            config,
            discovery,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Live instances, from cache when the last scan is younger than the
    /// scan interval.
    pub async fn discover_all_instances(&self, force_refresh: bool) -> Arc<Vec<InstanceInfo>> {
        if !force_refresh && let Some(instances) = self.fresh_cache() {
            return instances;
        }

        let instances = Arc::new(self.discovery.discover_all_instances().await);
        self.state().cache = Some(DiscoveryCache {
            instances: instances.clone(),
            scanned_at: Instant::now(),
        });
        instances
    }

    fn fresh_cache(&self) -> Option<Arc<Vec<InstanceInfo>>> {
        let state = self.state();
        let cache = state.cache.as_ref()?;
        (cache.scanned_at.elapsed() < self.config.scan_interval).then(|| cache.instances.clone())
    }

    /// Current cache contents without scanning.
    pub fn list_instances(&self) -> Arc<Vec<InstanceInfo>> {
        self.state()
            .cache
            .as_ref()
            .map(|c| c.instances.clone())
            .unwrap_or_default()
    }

    pub async fn resolve(&self, identifier: Option<&str>) -> Result<InstanceInfo, ResolutionError> {
        let mut instances = self.discover_all_instances(false).await;
        if instances.is_empty() {
            instances = self.discover_all_instances(true).await;
        }
        resolve(
            identifier,
            &instances,
            self.config.default_instance.as_deref(),
        )
        .cloned()
    }

    /// Connection for the instance `identifier` resolves to, opening one if
    /// none is pooled yet.
    ///
    /// A pooled connection whose instance has moved to another port gets the
    /// new port recorded but is not reconnected. A new connection enters the
    /// pool only once it has connected.
    pub async fn get_connection(
        &self,
        identifier: Option<&str>,
    ) -> Result<Arc<Connection>, CommandError> {
        let target = self.resolve(identifier).await?;
        if let Some(existing) = self.pooled(&target) {
            return Ok(existing);
        }

        let conn = Arc::new(Connection::for_instance(
            &target,
            self.config.connection.clone(),
            self.discovery.clone(),
        ));
        if let Err(e) = conn.connect().await {
            tracing::warn!(instance = %target.id, port = target.port, error = %e, "Failed to connect to Unity");
            return Err(CommandError::Transport(e));
        }

        let winner = {
            let mut state = self.state();
            match state.connections.entry(target.id.clone()) {
                Entry::Occupied(entry) => Some(entry.get().clone()),
                Entry::Vacant(entry) => {
                    entry.insert(conn.clone());
                    None
                }
            }
        };
        if let Some(winner) = winner {
            // Another caller pooled this instance while we were connecting.
            conn.disconnect().await;
            winner.set_port(target.port);
            return Ok(winner);
        }
        tracing::info!(instance = %target.id, port = target.port, "Pooled new Unity connection");
        Ok(conn)
    }

    fn pooled(&self, target: &InstanceInfo) -> Option<Arc<Connection>> {
        let existing = self.state().connections.get(&target.id).cloned()?;
        existing.set_port(target.port);
        Some(existing)
    }

    /// Resolve, connect and run one command, polling through reloads.
    pub async fn send_command(
        &self,
        identifier: Option<&str>,
        command_type: &str,
        params: Value,
    ) -> Result<Value, CommandError> {
        let conn = self.get_connection(identifier).await?;
        conn.send_command_with_retry(command_type, params).await
    }

    /// Close every pooled connection and empty the pool.
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.state().connections.drain().collect();
        for (id, conn) in connections {
            conn.disconnect().await;
            tracing::debug!(instance = %id, "Closed pooled connection");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Health check for a resolved instance.
    pub async fn ping(&self, identifier: Option<&str>) -> Result<(), CommandError> {
        let conn = self.get_connection(identifier).await?;
        conn.ping().await
    }
}
