//! Per-call identity and the state handed to tool code.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MiddlewareError;

pub const GLOBAL_SESSION: &str = "global";

/// Pushes a tool-list-changed notification to one client session.
#[async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn notify_tools_changed(&self) -> Result<(), MiddlewareError>;
}

/// Who is making a call, as far as the hosting server knows.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Stable id of the client connection, when the transport provides one.
    pub client_id: Option<String>,
    /// Authenticated user, in multi-tenant hosting.
    pub user_id: Option<String>,
    pub notifier: Option<Arc<dyn SessionNotifier>>,
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn SessionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// `client:<id>`, else `user:<id>` when multi-tenant, else `global`.
    pub fn session_key(&self, remote_hosted: bool) -> String {
        if let Some(id) = self.client_id.as_deref().filter(|s| !s.is_empty()) {
            return format!("client:{id}");
        }
        if remote_hosted && let Some(user) = self.user_id.as_deref().filter(|s| !s.is_empty()) {
            return format!("user:{user}");
        }
        GLOBAL_SESSION.to_string()
    }
}

/// Call-scoped state tool code reads after routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallState {
    pub session_key: String,
    pub instance_id: Option<String>,
    /// Peer-side session for the instance, in multi-tenant hosting.
    pub peer_session_id: Option<String>,
}
