//! Which tools a session gets to see.
//!
//! The hosting server registers every tool it can serve. Tools backed by a
//! Unity-side implementation are only advertised when the selected
//! instance enables them; server-only and unregistered tools always are.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// What a registered tool is backed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTarget {
    /// A Unity tool of the same name.
    Peer,
    /// A Unity tool registered under another name.
    Alias(String),
    ServerOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub target: ToolTarget,
}

impl ToolSpec {
    pub fn peer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ToolTarget::Peer,
        }
    }

    pub fn alias(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ToolTarget::Alias(target.into()),
        }
    }

    pub fn server_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: ToolTarget::ServerOnly,
        }
    }
}

/// Source of the hosting server's tool registrations.
pub trait ToolRegistry: Send + Sync {
    fn tools(&self) -> Vec<ToolSpec>;
}

impl ToolRegistry for Vec<ToolSpec> {
    fn tools(&self) -> Vec<ToolSpec> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
pub struct VisibilitySnapshot {
    targets: HashMap<String, ToolTarget>,
    built_at: Instant,
}

impl VisibilitySnapshot {
    pub fn build(registry: &dyn ToolRegistry) -> Self {
        let targets = registry
            .tools()
            .into_iter()
            .map(|spec| (spec.name, spec.target))
            .collect();
        Self {
            targets,
            built_at: Instant::now(),
        }
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.built_at.elapsed() >= max_age
    }

    /// `enabled == None` means the instance declared nothing; show everything.
    pub fn is_visible(&self, tool: &str, enabled: Option<&BTreeSet<String>>) -> bool {
        let Some(enabled) = enabled else {
            return true;
        };
        match self.targets.get(tool) {
            None | Some(ToolTarget::ServerOnly) => true,
            Some(ToolTarget::Peer) => enabled.contains(tool),
            Some(ToolTarget::Alias(target)) => enabled.contains(target) || enabled.contains(tool),
        }
    }
}
