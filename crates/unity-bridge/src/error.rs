//! Error taxonomy for discovery, resolution, transport and session routing.
//!
//! Discovery errors never escape the discovery layer: callers fall back to
//! defaults. Transport errors are retried by [`crate::Connection`] before
//! they surface. Only [`MiddlewareError::Unauthorized`] is meant to abort a
//! call at the outer boundary ([`BridgeError::is_fatal`]).

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};

use crate::bridge::codec::FrameError;

/// Failure reading a peer-written registry or status file.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One instance offered back to the user when an identifier is ambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub path: String,
    pub port: u16,
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (port {}, {})", self.id, self.port, self.path)
    }
}

fn join_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A user-supplied instance identifier could not be mapped to one instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolutionError {
    #[error(
        "No Unity Editor instances found. Ensure Unity is running with the MCP bridge enabled."
    )]
    NoInstances,

    #[error(
        "{kind} '{identifier}' matches {} instances; use a full id such as '{}'. Candidates: {}",
        .candidates.len(),
        .candidates.first().map(|c| c.id.as_str()).unwrap_or_default(),
        join_candidates(.candidates)
    )]
    Ambiguous {
        kind: &'static str,
        identifier: String,
        candidates: Vec<Candidate>,
    },

    #[error("Unity instance '{identifier}' not found. Available instances: {}", .available.join(", "))]
    NotFound {
        identifier: String,
        available: Vec<String>,
    },
}

impl ResolutionError {
    /// Fully-qualified ids the user can retry with.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::NoInstances => Vec::new(),
            Self::Ambiguous { candidates, .. } => candidates.iter().map(|c| c.id.clone()).collect(),
            Self::NotFound { available, .. } => available.clone(),
        }
    }
}

/// Socket-level failure talking to a peer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to Unity on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("timed out during {op}")]
    Timeout { op: &'static str },

    #[error("Unity did not advertise FRAMING=1 (banner: {banner:?})")]
    HandshakeRejected { banner: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Refused, reset and timed-out errors clear up quickly and get a tight
    /// backoff cap.
    pub fn is_transient(&self) -> bool {
        let kind = match self {
            Self::Timeout { .. } => return true,
            Self::Connect { source, .. } => source.kind(),
            Self::Io(e) => e.kind(),
            Self::Frame(FrameError::Io(e)) => e.kind(),
            _ => return false,
        };
        matches!(
            kind,
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::TimedOut
        )
    }
}

/// Outcome of a failed command, as seen by the tool layer.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer answered with an error status.
    #[error("{message}")]
    Peer { message: String },

    /// The peer is mid domain reload; the call may be retried.
    #[error("{message}")]
    Reloading {
        message: String,
        retry_after: Option<Duration>,
    },
}

impl CommandError {
    pub fn reloading(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::Reloading {
            message: message.into(),
            retry_after,
        }
    }

    pub fn peer(message: impl Into<String>) -> Self {
        Self::Peer {
            message: message.into(),
        }
    }

    pub fn is_reloading(&self) -> bool {
        matches!(self, Self::Reloading { .. })
    }

    /// Render the uniform `{success: false, message}` object tool wrappers
    /// return instead of raising.
    pub fn to_tool_result(&self) -> Value {
        match self {
            Self::Reloading {
                message,
                retry_after,
            } => json!({
                "success": false,
                "message": message,
                "data": {
                    "state": "reloading",
                    "retry_after_ms": retry_after.map(|d| d.as_millis() as u64),
                },
            }),
            Self::Resolution(e) => json!({
                "success": false,
                "message": e.to_string(),
                "data": { "suggestions": e.suggestions() },
            }),
            other => json!({
                "success": false,
                "message": other.to_string(),
            }),
        }
    }
}

/// Failures in per-call routing.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    /// Multi-tenant mode without a resolvable caller identity.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("instance directory lookup failed: {0}")]
    Directory(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("session closed")]
    SessionClosed,
}

/// Anything a routed call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl BridgeError {
    /// Authorization failures abort the call; everything else becomes a
    /// `{success: false}` tool result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Middleware(MiddlewareError::Unauthorized(_)))
    }

    pub fn to_tool_result(&self) -> Value {
        match self {
            Self::Command(e) => e.to_tool_result(),
            Self::Middleware(MiddlewareError::Resolution(e)) => {
                CommandError::Resolution(e.clone()).to_tool_result()
            }
            Self::Middleware(e) => json!({
                "success": false,
                "message": e.to_string(),
            }),
        }
    }
}
