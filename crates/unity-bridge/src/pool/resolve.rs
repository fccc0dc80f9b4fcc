//! Mapping a user-supplied identifier onto one discovered instance.
//!
//! Identifiers are tried, in order, as: a full `Name@hash` id, a project
//! name, a hash or hash prefix, a `Name@hint` composite where the hint is a
//! hash prefix or a port, a port number, and finally a project path.

use crate::discovery::InstanceInfo;
use crate::error::{Candidate, ResolutionError};

fn candidates(matches: &[&InstanceInfo]) -> Vec<Candidate> {
    matches
        .iter()
        .map(|i| Candidate {
            id: i.id.clone(),
            path: i.path.clone(),
            port: i.port,
        })
        .collect()
}

fn unique<'a>(
    kind: &'static str,
    identifier: &str,
    matches: Vec<&'a InstanceInfo>,
) -> Result<Option<&'a InstanceInfo>, ResolutionError> {
    match matches.as_slice() {
        [] => Ok(None),
        [one] => Ok(Some(*one)),
        many => Err(ResolutionError::Ambiguous {
            kind,
            identifier: identifier.to_string(),
            candidates: candidates(many),
        }),
    }
}

fn by_hash<'a>(
    identifier: &str,
    instances: &'a [InstanceInfo],
) -> Result<Option<&'a InstanceInfo>, ResolutionError> {
    if let Some(exact) = instances.iter().find(|i| i.hash == identifier) {
        return Ok(Some(exact));
    }
    let prefixed = instances
        .iter()
        .filter(|i| i.hash.starts_with(identifier))
        .collect();
    unique("Hash", identifier, prefixed)
}

fn by_composite<'a>(
    identifier: &str,
    instances: &'a [InstanceInfo],
) -> Result<Option<&'a InstanceInfo>, ResolutionError> {
    let Some((name, hint)) = identifier.split_once('@') else {
        return Ok(None);
    };
    if name.is_empty() || hint.is_empty() {
        return Ok(None);
    }
    let hint_port = hint.parse::<u16>().ok();
    let matches = instances
        .iter()
        .filter(|i| i.name == name)
        .filter(|i| i.hash.starts_with(hint) || hint_port == Some(i.port))
        .collect();
    unique("Instance", identifier, matches)
}

/// Resolve a non-empty identifier against `instances`.
pub fn resolve_identifier<'a>(
    identifier: &str,
    instances: &'a [InstanceInfo],
) -> Result<&'a InstanceInfo, ResolutionError> {
    let identifier = identifier.trim();
    if instances.is_empty() {
        return Err(ResolutionError::NoInstances);
    }

    if let Some(exact) = instances.iter().find(|i| i.id == identifier) {
        return Ok(exact);
    }

    let named = instances.iter().filter(|i| i.name == identifier).collect();
    if let Some(found) = unique("Project name", identifier, named)? {
        return Ok(found);
    }

    if let Some(found) = by_hash(identifier, instances)? {
        return Ok(found);
    }

    if let Some(found) = by_composite(identifier, instances)? {
        return Ok(found);
    }

    if let Ok(port) = identifier.parse::<u16>()
        && let Some(found) = instances.iter().find(|i| i.port == port)
    {
        return Ok(found);
    }

    if let Some(found) = instances.iter().find(|i| i.path == identifier) {
        return Ok(found);
    }

    Err(ResolutionError::NotFound {
        identifier: identifier.to_string(),
        available: instances.iter().map(|i| i.id.clone()).collect(),
    })
}

/// Resolve `identifier`, or pick an instance when none is given: the
/// configured default if it resolves, else the most recent heartbeat.
pub fn resolve<'a>(
    identifier: Option<&str>,
    instances: &'a [InstanceInfo],
    default_instance: Option<&str>,
) -> Result<&'a InstanceInfo, ResolutionError> {
    if instances.is_empty() {
        return Err(ResolutionError::NoInstances);
    }

    if let Some(identifier) = identifier.map(str::trim).filter(|s| !s.is_empty()) {
        return resolve_identifier(identifier, instances);
    }

    if let Some(default) = default_instance {
        match resolve_identifier(default, instances) {
            Ok(found) => return Ok(found),
            Err(e) => {
                tracing::warn!(default, error = %e, "Configured default instance is not available");
            }
        }
    }

    // Ties go to the earlier (newer status file) entry; no heartbeat sorts last.
    instances
        .iter()
        .rev()
        .max_by_key(|i| i.last_heartbeat)
        .ok_or(ResolutionError::NoInstances)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::discovery::InstanceStatus;

    pub(crate) fn instance(name: &str, hash: &str, port: u16, heartbeat: Option<i64>) -> InstanceInfo {
        InstanceInfo {
            id: format!("{name}@{hash}"),
            name: name.to_string(),
            path: format!("/work/{hash}/{name}/Assets"),
            hash: hash.to_string(),
            port,
            status: InstanceStatus::Running,
            last_heartbeat: heartbeat.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            unity_version: None,
            enabled_tools: None,
        }
    }

    fn fleet() -> Vec<InstanceInfo> {
        vec![
            instance("Foo", "aaa111", 6400, Some(100)),
            instance("Foo", "bbb222", 6401, Some(300)),
            instance("Bar", "ccc333", 6402, None),
        ]
    }

    #[test]
    fn duplicate_project_names_are_ambiguous() {
        let instances = fleet();
        let err = resolve(Some("Foo"), &instances, None).unwrap_err();
        let ResolutionError::Ambiguous { candidates, .. } = &err else {
            panic!("expected ambiguity, got {err:?}");
        };
        assert_eq!(candidates.len(), 2);
        assert_eq!(err.suggestions(), vec!["Foo@aaa111", "Foo@bbb222"]);
    }

    #[test]
    fn resolves_each_identifier_form() {
        let instances = fleet();
        let id = |ident: &str| resolve(Some(ident), &instances, None).unwrap().id.clone();

        assert_eq!(id("Foo@bbb222"), "Foo@bbb222");
        assert_eq!(id("Bar"), "Bar@ccc333");
        assert_eq!(id("aaa111"), "Foo@aaa111");
        assert_eq!(id("bb"), "Foo@bbb222");
        assert_eq!(id("Foo@aa"), "Foo@aaa111");
        assert_eq!(id("Foo@6401"), "Foo@bbb222");
        assert_eq!(id("6402"), "Bar@ccc333");
        assert_eq!(id("/work/aaa111/Foo/Assets"), "Foo@aaa111");
    }

    #[test]
    fn ambiguous_hash_prefix_is_an_error() {
        let instances = vec![
            instance("Foo", "abc111", 6400, None),
            instance("Bar", "abc222", 6401, None),
        ];
        let err = resolve(Some("abc"), &instances, None).unwrap_err();
        assert!(matches!(err, ResolutionError::Ambiguous { kind: "Hash", .. }));
    }

    #[test]
    fn unknown_identifier_lists_available_ids() {
        let instances = fleet();
        let err = resolve(Some("Nope"), &instances, None).unwrap_err();
        assert_eq!(
            err.suggestions(),
            vec!["Foo@aaa111", "Foo@bbb222", "Bar@ccc333"]
        );
    }

    #[test]
    fn omitted_identifier_uses_default_then_latest_heartbeat() {
        let instances = fleet();
        assert_eq!(
            resolve(None, &instances, Some("Bar")).unwrap().id,
            "Bar@ccc333"
        );
        assert_eq!(resolve(None, &instances, None).unwrap().id, "Foo@bbb222");
        assert_eq!(
            resolve(Some("  "), &instances, Some("Gone@000")).unwrap().id,
            "Foo@bbb222"
        );
    }

    #[test]
    fn no_instances_is_reported() {
        assert!(matches!(
            resolve(None, &[], None),
            Err(ResolutionError::NoInstances)
        ));
        assert!(matches!(
            resolve(Some("Foo"), &[], None),
            Err(ResolutionError::NoInstances)
        ));
    }
}
