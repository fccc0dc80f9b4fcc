//! Peer-written registry and status files.
//!
//! Layout of the registry directory:
//!
//! - `unity-mcp-port.json`: legacy single-project port file
//! - `unity-mcp-port-<hash>.json`: per-project port file
//! - `unity-mcp-status-<hash>.json`: per-project heartbeat/status file
//!
//! This module only ever reads these files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::DiscoveryError;

pub const LEGACY_PORT_FILE: &str = "unity-mcp-port.json";
const PORT_FILE_PREFIX: &str = "unity-mcp-port-";
const STATUS_FILE_PREFIX: &str = "unity-mcp-status-";
const JSON_SUFFIX: &str = ".json";

/// Contents of a port file.
#[derive(Debug, Clone, Deserialize)]
pub struct PortFile {
    pub unity_port: u16,
}

/// Contents of a heartbeat/status file.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusFile {
    #[serde(default)]
    pub project_path: String,
    pub unity_port: u16,
    #[serde(default)]
    pub reloading: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<String>,
    #[serde(default)]
    pub unity_version: Option<String>,
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

impl StatusFile {
    pub fn is_reloading(&self) -> bool {
        self.reloading || self.reason.as_deref() == Some("reloading")
    }

    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.as_deref().and_then(parse_heartbeat)
    }
}

/// Parse an ISO-8601 heartbeat. Offsets are honoured; a timestamp without
/// one is taken as UTC.
pub fn parse_heartbeat(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// A status file found on disk, before parsing.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    pub path: PathBuf,
    pub hash: String,
    pub modified: SystemTime,
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DiscoveryError> {
    let data = fs::read(path).map_err(|source| DiscoveryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&data).map_err(|source| DiscoveryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read-only view of the registry directory.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files named `<prefix><hash>.json`, newest first.
    fn files_with_prefix(&self, prefix: &str) -> Vec<(PathBuf, String, SystemTime)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::trace!(dir = %self.dir.display(), error = %e, "Registry directory unreadable");
                return Vec::new();
            }
        };

        let mut files: Vec<_> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let hash = name.strip_prefix(prefix)?.strip_suffix(JSON_SUFFIX)?;
                if hash.is_empty() {
                    return None;
                }
                let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((entry.path(), hash.to_string(), modified))
            })
            .collect();

        files.sort_by(|a, b| b.2.cmp(&a.2));
        files
    }

    /// Port files newest-first by modification time, with the legacy file
    /// appended last regardless of its age.
    pub fn list_candidates(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self
            .files_with_prefix(PORT_FILE_PREFIX)
            .into_iter()
            .map(|(path, _, _)| path)
            .collect();

        let legacy = self.dir.join(LEGACY_PORT_FILE);
        if legacy.is_file() {
            candidates.push(legacy);
        }
        candidates
    }

    /// Status files newest-first.
    pub fn status_files(&self) -> Vec<StatusEntry> {
        self.files_with_prefix(STATUS_FILE_PREFIX)
            .into_iter()
            .map(|(path, hash, modified)| StatusEntry {
                path,
                hash,
                modified,
            })
            .collect()
    }

    /// Status for one project hash, or the newest status file when `hash`
    /// is `None`. Unreadable or malformed files read as `None`.
    pub fn read_status(&self, hash: Option<&str>) -> Option<StatusFile> {
        let path = match hash {
            Some(hash) => self
                .dir
                .join(format!("{STATUS_FILE_PREFIX}{hash}{JSON_SUFFIX}")),
            None => self.status_files().into_iter().next()?.path,
        };
        match read_json(&path) {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::trace!(error = %e, "No usable status file");
                None
            }
        }
    }
}
