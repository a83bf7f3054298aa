//! Compose volume extraction
//!
//! Service volume entries come in two shapes: the short `source:dest[:mode]`
//! string and the long mapping form with `type`/`source`/`target` keys. Both
//! are normalized into [`MountSpec`] in one pass, and everything downstream
//! works from that.

use serde_yaml::{Mapping, Value};
use stackshift_common::{MountSpec, VolumeInventory};

use crate::error::{MigrationError, Result};

/// A volume entry together with the service that declares it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMount {
    pub service: String,
    pub mount: MountSpec,
}

/// Parsed volume information of a Compose document
#[derive(Debug, Clone, Default)]
pub struct ComposeVolumes {
    pub inventory: VolumeInventory,
    pub mounts: Vec<ServiceMount>,
}

impl ComposeVolumes {
    /// Parse Compose YAML text
    ///
    /// Malformed YAML yields [`MigrationError::ComposeParse`]; well-formed YAML
    /// of an unexpected shape yields [`MigrationError::VolumeExtraction`].
    pub fn parse(content: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(content).map_err(|e| MigrationError::ComposeParse {
            reason: e.to_string(),
        })?;

        let root = match &document {
            Value::Mapping(map) => map,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(extraction_error(format!(
                    "expected a mapping at the top level, found {}",
                    kind_of(other)
                )));
            }
        };

        let mut parsed = Self::default();

        if let Some(definitions) = root.get("volumes") {
            parsed.inventory.volume_definitions = volume_definitions(definitions)?;
        }

        if let Some(services) = root.get("services") {
            let services = match services {
                Value::Mapping(map) => map,
                Value::Null => return Ok(parsed),
                other => {
                    return Err(extraction_error(format!(
                        "'services' must be a mapping, found {}",
                        kind_of(other)
                    )));
                }
            };

            for (key, service) in services {
                let service_name = key_string(key)?;
                for mount in service_mounts(&service_name, service)? {
                    match &mount {
                        MountSpec::BindMount { source, .. } => {
                            parsed.inventory.bind_mounts.insert(source.clone());
                        }
                        MountSpec::NamedVolume { name, .. } => {
                            parsed.inventory.named_volumes.insert(name.clone());
                        }
                    }
                    parsed.mounts.push(ServiceMount {
                        service: service_name.clone(),
                        mount,
                    });
                }
            }
        }

        log::debug!(
            "Compose volumes: {} named, {} bind, {} defined",
            parsed.inventory.named_volumes.len(),
            parsed.inventory.bind_mounts.len(),
            parsed.inventory.volume_definitions.len()
        );

        Ok(parsed)
    }
}

/// Parse a Compose document into its volume inventory
pub fn parse_compose_volumes(content: &str) -> Result<VolumeInventory> {
    ComposeVolumes::parse(content).map(|parsed| parsed.inventory)
}

/// Name the container engine uses for a volume declared in a Compose project
///
/// An explicit `name:` wins, external volumes keep their declared name, and
/// everything else is prefixed with the project name the way Compose does it.
pub fn engine_volume_name(project: &str, volume: &str, inventory: &VolumeInventory) -> String {
    let definition = inventory.volume_definitions.get(volume);

    if let Some(name) = definition
        .and_then(|d| d.get("name"))
        .and_then(serde_json::Value::as_str)
    {
        return name.to_string();
    }

    let external = match definition.and_then(|d| d.get("external")) {
        Some(serde_json::Value::Bool(flag)) => *flag,
        // legacy `external: { name: ... }`
        Some(serde_json::Value::Object(ext)) => {
            if let Some(name) = ext.get("name").and_then(serde_json::Value::as_str) {
                return name.to_string();
            }
            true
        }
        _ => false,
    };

    if external {
        volume.to_string()
    } else {
        format!("{project}_{volume}")
    }
}

fn extraction_error(reason: impl Into<String>) -> MigrationError {
    MigrationError::VolumeExtraction {
        reason: reason.into(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

fn key_string(key: &Value) -> Result<String> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(extraction_error(format!(
            "expected a string key, found {}",
            kind_of(other)
        ))),
    }
}

fn volume_definitions(
    definitions: &Value,
) -> Result<std::collections::BTreeMap<String, serde_json::Value>> {
    let map = match definitions {
        Value::Mapping(map) => map,
        Value::Null => return Ok(Default::default()),
        other => {
            return Err(extraction_error(format!(
                "top-level 'volumes' must be a mapping, found {}",
                kind_of(other)
            )));
        }
    };

    let mut out = std::collections::BTreeMap::new();
    for (name, config) in map {
        let name = key_string(name)?;
        let config = serde_json::to_value(config)
            .map_err(|e| extraction_error(format!("volume '{name}': {e}")))?;
        out.insert(name, config);
    }
    Ok(out)
}

fn service_mounts(service: &str, definition: &Value) -> Result<Vec<MountSpec>> {
    let volumes = match definition {
        Value::Mapping(map) => map.get("volumes"),
        Value::Null => None,
        other => {
            return Err(extraction_error(format!(
                "service '{service}' must be a mapping, found {}",
                kind_of(other)
            )));
        }
    };

    let entries = match volumes {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Sequence(entries)) => entries,
        Some(other) => {
            return Err(extraction_error(format!(
                "service '{service}': 'volumes' must be a list, found {}",
                kind_of(other)
            )));
        }
    };

    let mut mounts = Vec::new();
    for entry in entries {
        let mount = match entry {
            Value::String(spec) => parse_short_syntax(spec),
            Value::Mapping(map) => parse_long_syntax(service, map)?,
            other => {
                return Err(extraction_error(format!(
                    "service '{service}': volume entry must be a string or mapping, found {}",
                    kind_of(other)
                )));
            }
        };
        if let Some(mount) = mount {
            mounts.push(mount);
        }
    }
    Ok(mounts)
}

/// `source:dest[:mode]`. A bare container path is an anonymous volume and
/// has nothing to migrate.
fn parse_short_syntax(spec: &str) -> Option<MountSpec> {
    let mut parts = spec.splitn(3, ':');
    let source = parts.next()?.trim();
    let dest = parts.next()?.trim();
    let mode = parts
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    if source.is_empty() {
        return None;
    }
    Some(MountSpec::classify(source, dest, mode))
}

fn parse_long_syntax(service: &str, map: &Mapping) -> Result<Option<MountSpec>> {
    let field = |key: &str| map.get(key).and_then(Value::as_str).map(str::trim);

    let declared_type = field("type").unwrap_or("volume");
    if declared_type == "tmpfs" || declared_type == "npipe" {
        return Ok(None);
    }

    let Some(source) = field("source").filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let dest = field("target")
        .ok_or_else(|| {
            extraction_error(format!(
                "service '{service}': volume '{source}' has no target"
            ))
        })?
        .to_string();

    let mode = match map.get("read_only").and_then(Value::as_bool) {
        Some(true) => Some("ro".to_string()),
        _ => None,
    };

    let mount = MountSpec::classify(source, dest, mode);
    if mount.is_bind() != (declared_type == "bind") {
        log::debug!(
            "service '{}': volume source '{}' declared as {} but classified by path",
            service,
            source,
            declared_type
        );
    }
    Ok(Some(mount))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_and_relative_bind() {
        let compose = r#"
services:
  app:
    image: example/app
    volumes:
      - data:/var/lib/app
      - ./cfg:/etc/app
volumes:
  data:
"#;
        let inventory = parse_compose_volumes(compose).unwrap();
        assert_eq!(inventory.named_volumes.iter().collect::<Vec<_>>(), vec!["data"]);
        assert_eq!(inventory.bind_mounts.iter().collect::<Vec<_>>(), vec!["./cfg"]);
        assert_eq!(inventory.volume_definitions.get("data"), Some(&serde_json::Value::Null));
    }

    #[test]
    fn test_long_syntax_classified_like_short_syntax() {
        let compose = r#"
services:
  db:
    image: postgres
    volumes:
      - type: volume
        source: pgdata
        target: /var/lib/postgresql/data
      - type: bind
        source: /srv/backups
        target: /backups
        read_only: true
      - type: bind
        source: ~/dumps
        target: /dumps
      - type: tmpfs
        target: /run
"#;
        let parsed = ComposeVolumes::parse(compose).unwrap();
        let inventory = &parsed.inventory;
        assert!(inventory.named_volumes.contains("pgdata"));
        assert!(inventory.bind_mounts.contains("/srv/backups"));
        assert!(inventory.bind_mounts.contains("~/dumps"));
        assert_eq!(parsed.mounts.len(), 3);
        assert_eq!(
            parsed.mounts[1].mount,
            MountSpec::BindMount {
                source: "/srv/backups".to_string(),
                dest: "/backups".to_string(),
                mode: Some("ro".to_string()),
            }
        );
    }

    #[test]
    fn test_deduplicates_across_services() {
        let compose = r#"
services:
  web:
    volumes:
      - shared:/shared
      - /srv/media:/media:ro
  worker:
    volumes:
      - shared:/data
      - /srv/media:/media
"#;
        let inventory = parse_compose_volumes(compose).unwrap();
        assert_eq!(inventory.named_volumes.len(), 1);
        assert_eq!(inventory.bind_mounts.len(), 1);
    }

    #[test]
    fn test_anonymous_volume_ignored() {
        let compose = r#"
services:
  app:
    volumes:
      - /var/cache/app
"#;
        let inventory = parse_compose_volumes(compose).unwrap();
        assert!(inventory.is_empty());
    }

    #[test]
    fn test_short_syntax_mode() {
        let mount = parse_short_syntax("/srv/data:/data:rw,z").unwrap();
        assert_eq!(
            mount,
            MountSpec::BindMount {
                source: "/srv/data".to_string(),
                dest: "/data".to_string(),
                mode: Some("rw,z".to_string()),
            }
        );
    }

    #[test]
    fn test_definitions_kept_verbatim() {
        let compose = r#"
services: {}
volumes:
  media:
    external: true
  cache:
    driver: local
    driver_opts:
      type: tmpfs
"#;
        let inventory = parse_compose_volumes(compose).unwrap();
        assert_eq!(
            inventory.volume_definitions["media"],
            serde_json::json!({ "external": true })
        );
        assert_eq!(inventory.volume_definitions["cache"]["driver"], "local");
    }

    #[test]
    fn test_engine_volume_names() {
        let compose = r#"
volumes:
  data:
  media:
    external: true
  cache:
    name: shared-cache
  legacy:
    external:
      name: old-legacy
"#;
        let inventory = parse_compose_volumes(compose).unwrap();
        assert_eq!(engine_volume_name("web", "data", &inventory), "web_data");
        assert_eq!(engine_volume_name("web", "media", &inventory), "media");
        assert_eq!(engine_volume_name("web", "cache", &inventory), "shared-cache");
        assert_eq!(engine_volume_name("web", "legacy", &inventory), "old-legacy");
        assert_eq!(engine_volume_name("web", "undeclared", &inventory), "web_undeclared");
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let err = parse_compose_volumes("services:\n  web: [unclosed").unwrap_err();
        match err {
            MigrationError::ComposeParse { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unexpected_shape_is_extraction_error() {
        let err = parse_compose_volumes("services:\n  web:\n    volumes: data\n").unwrap_err();
        assert!(matches!(err, MigrationError::VolumeExtraction { .. }));

        let err = parse_compose_volumes("- just\n- a list\n").unwrap_err();
        assert!(matches!(err, MigrationError::VolumeExtraction { .. }));
    }
}
