//! Process-wide bridge state, built once and handed to request handlers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OnceCell;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::middleware::{
    CallContext, InstanceDirectory, InstanceRoutingMiddleware, ToolRegistry, ToolWatch,
};
use crate::pool::ConnectionPool;

/// The connection pool and routing middleware for one server process.
#[derive(Debug)]
pub struct BridgeContext {
    config: BridgeConfig,
    pool: Arc<ConnectionPool>,
    middleware: Arc<InstanceRoutingMiddleware>,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let middleware = Arc::new(InstanceRoutingMiddleware::new(pool.clone(), &config));
        Self::from_parts(config, pool, middleware)
    }

    pub fn from_parts(
        config: BridgeConfig,
        pool: Arc<ConnectionPool>,
        middleware: Arc<InstanceRoutingMiddleware>,
    ) -> Self {
        Self {
            config,
            pool,
            middleware,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn middleware(&self) -> &Arc<InstanceRoutingMiddleware> {
        &self.middleware
    }

    /// Route one command for a caller: resolve its identity and active
    /// instance, then send through the pool.
    pub async fn call(
        &self,
        ctx: &CallContext,
        command_type: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let state = self.middleware.prepare_call(ctx).await?;
        tracing::debug!(
            session = %state.session_key,
            instance = ?state.instance_id,
            command = command_type,
            "Routing command"
        );
        let result = self
            .pool
            .send_command(state.instance_id.as_deref(), command_type, params)
            .await?;
        Ok(result)
    }

    pub fn spawn_tool_watch(&self) -> ToolWatch {
        self.middleware
            .spawn_tool_watch(self.config.tool_watch_interval)
    }

    pub async fn shutdown(&self) {
        self.pool.disconnect_all().await;
    }
}

/// Builds the [`BridgeContext`] on first use and hands out the same one
/// afterwards.
pub struct ContextFactory {
    config: BridgeConfig,
    registry: Option<Arc<dyn ToolRegistry>>,
    directory: Option<Arc<dyn InstanceDirectory>>,
    cell: OnceCell<Arc<BridgeContext>>,
}

impl ContextFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            registry: None,
            directory: None,
            cell: OnceCell::new(),
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

    pub async fn get(&self) -> Arc<BridgeContext> {
        self.cell
            .get_or_init(|| async {
                let config = self.config.clone();
                let pool = Arc::new(ConnectionPool::new(config.clone()));
                let mut middleware = InstanceRoutingMiddleware::new(pool.clone(), &config);
                if let Some(registry) = &self.registry {
                    middleware = middleware.with_tool_registry(registry.clone());
                }
                if let Some(directory) = &self.directory {
                    middleware = middleware.with_directory(directory.clone());
                }

                let instances = pool.discover_all_instances(true).await;
                tracing::info!(
                    registry_dir = %config.registry_dir.display(),
                    instances = instances.len(),
                    remote_hosted = config.remote_hosted,
                    "Bridge context initialized"
                );
                Arc::new(BridgeContext::from_parts(config, pool, Arc::new(middleware)))
            })
            .await
            .clone()
    }

    /// The context, if something already asked for it.
    pub fn initialized(&self) -> Option<Arc<BridgeContext>> {
        self.cell.get().cloned()
    }
}
