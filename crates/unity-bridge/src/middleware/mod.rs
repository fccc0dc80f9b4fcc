//! Session-scoped instance routing and tool visibility.
//!
//! One server process serves many client sessions. Each session picks its
//! own active Unity instance; every call is stamped with that instance
//! before tool code runs, and the tool list a session sees is narrowed to
//! what that instance has enabled.
//!
//! The session-to-instance map, the visibility cache and the tracked
//! sessions each sit behind their own lock; none is held across an await.

pub mod session;
pub mod visibility;
pub mod watch;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

pub use session::{CallContext, CallState, GLOBAL_SESSION, SessionNotifier};
pub use visibility::{ToolRegistry, ToolSpec, ToolTarget, VisibilitySnapshot};
pub use watch::ToolWatch;

use crate::config::BridgeConfig;
use crate::discovery::{Registry, read_json};
use crate::discovery::registry::StatusFile;
use crate::error::MiddlewareError;
use crate::pool::ConnectionPool;

/// Enabled tools per project hash, for every instance with a fresh status.
pub type ToolSignature = BTreeMap<String, BTreeSet<String>>;

/// Instance lookups for multi-tenant hosting, where instances belong to
/// users and are not found through the local registry.
#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// Peer-side session id for `instance_id` as seen by `user_id`.
    async fn peer_session(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<Option<String>, MiddlewareError>;

    async fn enabled_tools(
        &self,
        user_id: &str,
        instance_id: &str,
    ) -> Result<Option<BTreeSet<String>>, MiddlewareError>;
}

struct VisibilityCache {
    snapshot: Option<Arc<VisibilitySnapshot>>,
    tool_sets: Arc<ToolSignature>,
    refreshed_at: Instant,
}

pub struct InstanceRoutingMiddleware {
    pool: Arc<ConnectionPool>,
    registry: Option<Arc<dyn ToolRegistry>>,
    directory: Option<Arc<dyn InstanceDirectory>>,
    remote_hosted: bool,
    status_ttl: Duration,
    visibility_refresh: Duration,
    active: DashMap<String, String>,
    visibility: Mutex<Option<VisibilityCache>>,
    sessions: DashMap<String, Arc<dyn SessionNotifier>>,
}

impl std::fmt::Debug for InstanceRoutingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRoutingMiddleware")
            .field("remote_hosted", &self.remote_hosted)
            .field("active_sessions", &self.active.len())
            .field("tracked_sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

fn is_fresh(status: &StatusFile, modified: SystemTime, ttl: Duration) -> bool {
    let seen: DateTime<Utc> = status.heartbeat().unwrap_or_else(|| modified.into());
    (Utc::now() - seen)
        .to_std()
        .map(|age| age <= ttl)
        // Heartbeat in the future: clock skew, count it as fresh.
        .unwrap_or(true)
}

fn read_signature(registry: &Registry, ttl: Duration) -> ToolSignature {
    registry
        .status_files()
        .into_iter()
        .filter_map(|entry| {
            let status: StatusFile = read_json(&entry.path).ok()?;
            if !is_fresh(&status, entry.modified, ttl) {
                return None;
            }
            let tools = status.enabled_tools?;
            Some((entry.hash, tools.into_iter().collect()))
        })
        .collect()
}

impl InstanceRoutingMiddleware {
    pub fn new(pool: Arc<ConnectionPool>, config: &BridgeConfig) -> Self {
        Self {
            pool,
            registry: None,
            directory: None,
            remote_hosted: config.remote_hosted,
            status_ttl: config.status_ttl,
            visibility_refresh: config.visibility_refresh,
            active: DashMap::new(),
            visibility: Mutex::new(None),
            sessions: DashMap::new(),
        }
    }

    pub fn with_tool_registry(mut self, registry: Arc<dyn ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn InstanceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn key(&self, ctx: &CallContext) -> String {
        ctx.session_key(self.remote_hosted)
    }

    // --- active instance -------------------------------------------------

    /// Pin `identifier` as the session's active instance. Locally the
    /// identifier is resolved to a full `Name@hash` id first; in multi-tenant
    /// hosting it is stored as given.
    pub async fn set_active_instance(
        &self,
        ctx: &CallContext,
        identifier: &str,
    ) -> Result<String, MiddlewareError> {
        let id = if self.remote_hosted {
            identifier.trim().to_string()
        } else {
            self.pool.resolve(Some(identifier)).await?.id
        };
        let key = self.key(ctx);
        tracing::info!(session = %key, instance = %id, "Active instance selected");
        self.active.insert(key, id.clone());
        Ok(id)
    }

    pub fn get_active_instance(&self, ctx: &CallContext) -> Option<String> {
        self.active.get(&self.key(ctx)).map(|id| id.value().clone())
    }

    pub fn clear_active_instance(&self, ctx: &CallContext) {
        if let Some((key, id)) = self.active.remove(&self.key(ctx)) {
            tracing::info!(session = %key, instance = %id, "Active instance cleared");
        }
    }

    /// Select the only live instance for a session that has none. Never
    /// happens in multi-tenant hosting.
    async fn auto_select(&self, key: &str) -> Option<String> {
        if self.remote_hosted {
            return None;
        }
        let instances = self.pool.discover_all_instances(false).await;
        let [only] = instances.as_slice() else {
            return None;
        };
        let id = self
            .active
            .entry(key.to_string())
            .or_insert_with(|| only.id.clone())
            .value()
            .clone();
        tracing::info!(session = %key, instance = %id, "Auto-selected the only live instance");
        Some(id)
    }

    // --- per-call routing ------------------------------------------------

    /// Resolve identity and instance for one call before any tool runs.
    pub async fn prepare_call(&self, ctx: &CallContext) -> Result<CallState, MiddlewareError> {
        let user_id = match ctx.user_id.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => Some(user),
            None if self.remote_hosted => {
                return Err(MiddlewareError::Unauthorized(
                    "no authenticated user for this call".to_string(),
                ));
            }
            None => None,
        };

        let session_key = self.key(ctx);
        if let Some(notifier) = &ctx.notifier {
            self.track_session(&session_key, notifier.clone());
        }

        let pinned = self.active.get(&session_key).map(|id| id.value().clone());
        let instance_id = match pinned {
            Some(id) => Some(id),
            None => self.auto_select(&session_key).await,
        };

        let peer_session_id = match (&self.directory, user_id, &instance_id) {
            (Some(directory), Some(user), Some(instance)) if self.remote_hosted => {
                directory.peer_session(user, instance).await?
            }
            _ => None,
        };

        Ok(CallState {
            session_key,
            instance_id,
            peer_session_id,
        })
    }

    // --- tool visibility -------------------------------------------------

    fn visibility(&self) -> MutexGuard<'_, Option<VisibilityCache>> {
        self.visibility
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Enabled tools per fresh status file, read straight from the registry.
    pub async fn tool_signature(&self) -> ToolSignature {
        let ttl = self.status_ttl;
        self.pool
            .discovery()
            .scan(move |registry| read_signature(registry, ttl))
            .await
            .unwrap_or_default()
    }

    /// Drop cached visibility data so the next listing rebuilds it.
    pub fn invalidate_visibility(&self) {
        *self.visibility() = None;
    }

    fn fresh_visibility(&self) -> Option<(Option<Arc<VisibilitySnapshot>>, Arc<ToolSignature>)> {
        let cache = self.visibility();
        let c = cache
            .as_ref()
            .filter(|c| c.refreshed_at.elapsed() < self.visibility_refresh)?;
        Some((c.snapshot.clone(), c.tool_sets.clone()))
    }

    async fn cached_visibility(&self) -> (Option<Arc<VisibilitySnapshot>>, Arc<ToolSignature>) {
        if let Some(hit) = self.fresh_visibility() {
            return hit;
        }

        let snapshot = self
            .registry
            .as_ref()
            .map(|r| Arc::new(VisibilitySnapshot::build(r.as_ref())));
        let tool_sets = Arc::new(self.tool_signature().await);
        *self.visibility() = Some(VisibilityCache {
            snapshot: snapshot.clone(),
            tool_sets: tool_sets.clone(),
            refreshed_at: Instant::now(),
        });
        (snapshot, tool_sets)
    }

    /// Tool names the session's instance(s) have enabled, or `None` when the
    /// list should not be filtered at all.
    ///
    /// With no instance selected the result is the union over every live
    /// instance, and `None` if any of them has not declared its tools.
    pub async fn enabled_tools_for(
        &self,
        ctx: &CallContext,
    ) -> Result<Option<BTreeSet<String>>, MiddlewareError> {
        let active = self.get_active_instance(ctx);

        if self.remote_hosted {
            return match (&self.directory, ctx.user_id.as_deref(), active) {
                (Some(directory), Some(user), Some(instance)) => {
                    directory.enabled_tools(user, &instance).await
                }
                _ => Ok(None),
            };
        }

        let (_, tool_sets) = self.cached_visibility().await;
        let instances = self.pool.discover_all_instances(false).await;

        if let Some(active) = active {
            let hash = instances
                .iter()
                .find(|i| i.id == active)
                .map(|i| i.hash.as_str())
                .or_else(|| active.rsplit_once('@').map(|(_, hash)| hash));
            return Ok(hash.and_then(|h| tool_sets.get(h)).cloned());
        }

        if instances.is_empty() {
            return Ok(None);
        }
        let mut union = BTreeSet::new();
        for instance in instances.iter() {
            match tool_sets.get(&instance.hash) {
                Some(tools) => union.extend(tools.iter().cloned()),
                None => return Ok(None),
            }
        }
        Ok(Some(union))
    }

    /// Keep only the tools this session should see. `name` extracts a tool's
    /// registered name.
    pub async fn filter_tools<T, F>(
        &self,
        ctx: &CallContext,
        tools: Vec<T>,
        name: F,
    ) -> Result<Vec<T>, MiddlewareError>
    where
        F: Fn(&T) -> &str,
    {
        let enabled = self.enabled_tools_for(ctx).await?;
        let Some(enabled) = enabled else {
            return Ok(tools);
        };
        let (snapshot, _) = self.cached_visibility().await;
        let Some(snapshot) = snapshot else {
            return Ok(tools);
        };
        Ok(tools
            .into_iter()
            .filter(|t| snapshot.is_visible(name(t), Some(&enabled)))
            .collect())
    }

    // --- change notification ---------------------------------------------

    pub fn track_session(&self, session_key: &str, notifier: Arc<dyn SessionNotifier>) {
        self.sessions.insert(session_key.to_string(), notifier);
    }

    pub fn untrack_session(&self, session_key: &str) {
        self.sessions.remove(session_key);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Tell every tracked session its tool list changed. Sessions whose
    /// notification fails are no longer tracked.
    pub async fn notify_tools_changed(&self) {
        let targets: Vec<(String, Arc<dyn SessionNotifier>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, notifier) in targets {
            if let Err(e) = notifier.notify_tools_changed().await {
                tracing::debug!(session = %key, error = %e, "Dropping session after failed notification");
                self.sessions.remove(&key);
            }
        }
    }

    /// Start the background watcher that calls
    /// [`notify_tools_changed`](Self::notify_tools_changed) on changes.
    pub fn spawn_tool_watch(self: &Arc<Self>, period: Duration) -> ToolWatch {
        ToolWatch::spawn(self.clone(), period)
    }
}
