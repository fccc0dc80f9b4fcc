use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::registry::StatusFile;

const UNKNOWN_PROJECT: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Reloading,
}

/// One live editor process as seen by the latest discovery scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    /// `name@hash`
    pub id: String,
    pub name: String,
    pub path: String,
    pub hash: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unity_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<BTreeSet<String>>,
}

impl InstanceInfo {
    pub fn from_status(hash: &str, status: StatusFile) -> Self {
        let name = project_name(&status.project_path);
        let heartbeat = status.heartbeat();
        let state = if status.is_reloading() {
            InstanceStatus::Reloading
        } else {
            InstanceStatus::Running
        };
        Self {
            id: format!("{name}@{hash}"),
            name,
            path: status.project_path,
            hash: hash.to_string(),
            port: status.unity_port,
            status: state,
            last_heartbeat: heartbeat,
            unity_version: status.unity_version,
            enabled_tools: status
                .enabled_tools
                .map(|tools| tools.into_iter().collect()),
        }
    }
}

/// Project name from a path such as `/work/MyGame/Assets`: the segment
/// before `Assets`, else the last segment, else `Unknown`.
pub fn project_name(project_path: &str) -> String {
    let trimmed = project_path.trim_end_matches(['/', '\\']);
    let segments: Vec<&str> = trimmed
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect();

    let name = match segments.iter().rposition(|s| *s == "Assets") {
        Some(0) => None,
        Some(i) => segments.get(i - 1).copied(),
        None => Path::new(trimmed).file_name().and_then(|s| s.to_str()),
    };

    name.filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN_PROJECT)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_is_segment_before_assets() {
        assert_eq!(project_name("/work/MyGame/Assets"), "MyGame");
        assert_eq!(project_name("/work/MyGame/Assets/"), "MyGame");
        assert_eq!(project_name(r"C:\Projects\Racer\Assets"), "Racer");
        assert_eq!(project_name("/work/Plain"), "Plain");
        assert_eq!(project_name("Assets"), "Unknown");
        assert_eq!(project_name(""), "Unknown");
    }

    #[test]
    fn builds_from_status_file() {
        let status: StatusFile = serde_json::from_str(
            r#"{
                "project_path": "/work/Foo/Assets",
                "unity_port": 6401,
                "reloading": true,
                "last_heartbeat": "2025-03-01T10:00:00Z",
                "unity_version": "6000.0.1f1",
                "enabled_tools": ["manage_scene", "read_console"]
            }"#,
        )
        .unwrap();

        let info = InstanceInfo::from_status("abc123", status);
        assert_eq!(info.id, "Foo@abc123");
        assert_eq!(info.port, 6401);
        assert_eq!(info.status, InstanceStatus::Reloading);
        assert!(info.last_heartbeat.is_some());
        assert_eq!(
            info.enabled_tools.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["manage_scene", "read_console"]
        );
    }
}
