//! Compose-style configuration parsing.
//!
//! An alternative input format shaped like a docker-compose file: a bare
//! mapping of application name to definition, with `"host:container"`
//! port strings and `"target[:alias]"` link strings. Definitions are
//! lifted into the same model the native parser produces.
//!
//! A link's target may appear later in the file than the application
//! referencing it, so definitions are parsed in two passes: every
//! application is lifted without links first, then the recorded link
//! references are resolved against the targets' declared ports.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde_yaml::Value;

use crate::config::{parse_environment, yaml_type_name};
use crate::error::{Error, Result};
use crate::model::{Application, AttachedVolume, ImageReference, Link, Port};

/// Options valid in compose files but not expressible in the model.
/// These are rejected as unsupported, which is a different failure than
/// an unrecognised key.
const UNSUPPORTED_KEYS: [&str; 12] = [
    "command",
    "dns",
    "domainname",
    "entrypoint",
    "expose",
    "hostname",
    "mem_limit",
    "net",
    "privileged",
    "user",
    "volumes_from",
    "working_dir",
];

const ALLOWED_KEYS: [&str; 5] = ["image", "environment", "ports", "links", "volumes"];

/// Whether a configuration is in the compose style.
///
/// True iff at least one top-level value is a mapping containing exactly
/// one of `image` or `build`.
pub fn is_compose_configuration(config: &Value) -> bool {
    let Some(mapping) = config.as_mapping() else {
        return false;
    };
    mapping.values().any(|definition| {
        definition.is_mapping()
            && (definition.get("image").is_some() != definition.get("build").is_some())
    })
}

/// A link reference waiting for its target to be parsed.
struct LinkReference {
    target: String,
    alias: String,
}

struct ParsedDefinition {
    image: ImageReference,
    ports: BTreeSet<Port>,
    volume: Option<AttachedVolume>,
    environment: Option<BTreeMap<String, String>>,
    links: Vec<LinkReference>,
}

/// Validate and parse a compose-style application configuration.
pub fn applications_from_compose_configuration(
    config: &Value,
) -> Result<BTreeMap<String, Application>> {
    let mapping = config.as_mapping().ok_or_else(|| {
        Error::invalid_config(format!(
            "Application configuration must be a mapping, got {}.",
            yaml_type_name(config)
        ))
    })?;

    let mut parsed = BTreeMap::new();
    for (name_value, definition) in mapping {
        let name = name_value.as_str().ok_or_else(|| {
            Error::invalid_config(format!(
                "Application names must be strings, got {}.",
                yaml_type_name(name_value)
            ))
        })?;
        parsed.insert(name.to_string(), parse_definition(name, definition)?);
    }

    let mut applications = BTreeMap::new();
    for (name, definition) in &parsed {
        let links = resolve_links(name, &definition.links, &parsed)?;
        applications.insert(
            name.clone(),
            Application {
                name: name.clone(),
                image: Some(definition.image.clone()),
                ports: definition.ports.clone(),
                links,
                volume: definition.volume.clone(),
                environment: definition.environment.clone(),
            },
        );
    }
    Ok(applications)
}

fn parse_definition(name: &str, definition: &Value) -> Result<ParsedDefinition> {
    let mapping = definition.as_mapping().ok_or_else(|| {
        Error::application_config(
            name,
            format!(
                "Application definition must be a mapping, got {}.",
                yaml_type_name(definition)
            ),
        )
    })?;

    if definition.get("build").is_some() {
        return Err(Error::application_config(
            name,
            "'build' is not supported; please specify 'image'.",
        ));
    }

    let keys: Vec<&str> = mapping.keys().filter_map(Value::as_str).collect();
    let mut unsupported: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|key| UNSUPPORTED_KEYS.contains(key))
        .collect();
    unsupported.sort_unstable();
    if !unsupported.is_empty() {
        return Err(Error::application_config(
            name,
            format!("Unsupported configuration option(s): {}.", unsupported.join(", ")),
        ));
    }
    let mut unrecognised: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|key| !ALLOWED_KEYS.contains(key))
        .collect();
    unrecognised.sort_unstable();
    if !unrecognised.is_empty() {
        return Err(Error::application_config(
            name,
            format!("Unrecognised keys: {}.", unrecognised.join(", ")),
        ));
    }

    let image_value = definition
        .get("image")
        .ok_or_else(|| Error::application_config(name, "Missing value for 'image'."))?;
    let image_name = image_value.as_str().ok_or_else(|| {
        Error::application_config(
            name,
            format!(
                "Image name must be a string, got {}.",
                yaml_type_name(image_value)
            ),
        )
    })?;
    let image = match image_name.parse() {
        Ok(image) => image,
        Err(Error::InvalidConfig { message }) => {
            return Err(Error::application_config(
                name,
                format!("Invalid image name. {message}"),
            ))
        }
        Err(err) => return Err(err),
    };

    let ports = match definition.get("ports") {
        Some(value) => parse_port_strings(value).map_err(|detail| {
            Error::application_config(name, format!("Invalid ports specification. {detail}"))
        })?,
        None => BTreeSet::new(),
    };

    let volume = match definition.get("volumes") {
        Some(value) => Some(parse_volumes(name, value).map_err(|detail| {
            Error::application_config(name, format!("Invalid volumes specification. {detail}"))
        })?),
        None => None,
    };

    let environment = match definition.get("environment") {
        Some(value) => Some(parse_environment(name, value)?),
        None => None,
    };

    let links = match definition.get("links") {
        Some(value) => parse_link_strings(value).map_err(|detail| {
            Error::application_config(name, format!("Invalid links specification. {detail}"))
        })?,
        None => Vec::new(),
    };

    Ok(ParsedDefinition {
        image,
        ports,
        volume,
        environment,
        links,
    })
}

fn parse_port_strings(value: &Value) -> std::result::Result<BTreeSet<Port>, String> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| format!("'ports' must be a list, got {}.", yaml_type_name(value)))?;
    let mut ports = BTreeSet::new();
    for entry in entries {
        let spec = entry.as_str().ok_or_else(|| {
            format!(
                "Port entries must be strings in the form 'host:container', got {}.",
                yaml_type_name(entry)
            )
        })?;
        let (host, container) = spec
            .split_once(':')
            .ok_or_else(|| format!("Port entry '{spec}' is not in the form 'host:container'."))?;
        ports.insert(Port {
            internal_port: compose_port_number(container, spec)?,
            external_port: compose_port_number(host, spec)?,
        });
    }
    Ok(ports)
}

fn compose_port_number(text: &str, spec: &str) -> std::result::Result<u16, String> {
    text.parse::<u16>()
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| {
            format!("Port entry '{spec}' must use integers in the range 1-65535.")
        })
}

fn parse_volumes(name: &str, value: &Value) -> std::result::Result<AttachedVolume, String> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| format!("'volumes' must be a list, got {}.", yaml_type_name(value)))?;
    if entries.len() != 1 {
        return Err("Only one volume per application is supported.".to_string());
    }
    let path = entries[0].as_str().ok_or_else(|| {
        format!(
            "Volume entries must be strings, got {}.",
            yaml_type_name(&entries[0])
        )
    })?;
    if !Path::new(path).is_absolute() {
        return Err(format!("Mountpoint {path} is not an absolute path."));
    }
    Ok(AttachedVolume::new(name, path))
}

fn parse_link_strings(value: &Value) -> std::result::Result<Vec<LinkReference>, String> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| format!("'links' must be a list, got {}.", yaml_type_name(value)))?;
    let mut links = Vec::new();
    for entry in entries {
        let spec = entry.as_str().ok_or_else(|| {
            format!(
                "Link entries must be strings in the form 'application[:alias]', got {}.",
                yaml_type_name(entry)
            )
        })?;
        let (target, alias) = match spec.split_once(':') {
            Some((target, alias)) => (target, alias),
            None => (spec, spec),
        };
        if target.is_empty() || alias.is_empty() {
            return Err(format!(
                "Link entry '{spec}' is not in the form 'application[:alias]'."
            ));
        }
        links.push(LinkReference {
            target: target.to_string(),
            alias: alias.to_string(),
        });
    }
    Ok(links)
}

/// Turn recorded link references into concrete links, one per port the
/// target application declares.
fn resolve_links(
    name: &str,
    references: &[LinkReference],
    parsed: &BTreeMap<String, ParsedDefinition>,
) -> Result<BTreeSet<Link>> {
    let mut links = BTreeSet::new();
    for reference in references {
        let target = parsed.get(&reference.target).ok_or_else(|| {
            Error::application_config(
                name,
                format!(
                    "Invalid links specification. \
                     Link to unknown application: {}.",
                    reference.target
                ),
            )
        })?;
        for port in &target.ports {
            links.insert(
                Link::new(port.internal_port, port.external_port, &reference.alias)
                    .map_err(|err| {
                        Error::application_config(
                            name,
                            format!("Invalid links specification. {err}"),
                        )
                    })?,
            );
        }
    }
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(source: &str) -> Value {
        serde_yaml::from_str(source).unwrap()
    }

    #[test]
    fn test_detection() {
        assert!(is_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest'}}"
        )));
        assert!(is_compose_configuration(&yaml(
            "{wordpress: {build: .}}"
        )));
        assert!(!is_compose_configuration(&yaml(
            "{version: 1, applications: {web: {image: 'repo/web:1'}}}"
        )));
        assert!(!is_compose_configuration(&yaml("{wordpress: {ports: []}}")));
        // Exactly one of image or build must be present.
        assert!(!is_compose_configuration(&yaml(
            "{wordpress: {image: 'a:b', build: .}}"
        )));
    }

    #[test]
    fn test_build_is_unsupported() {
        let err =
            applications_from_compose_configuration(&yaml("{wordpress: {build: .}}")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'wordpress' has a config error. \
             'build' is not supported; please specify 'image'."
        );
    }

    #[test]
    fn test_unsupported_keys() {
        let err = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', expose: [80], privileged: true}}",
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'wordpress' has a config error. \
             Unsupported configuration option(s): expose, privileged."
        );
    }

    #[test]
    fn test_unrecognised_keys() {
        let err = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', glitter: maximum}}",
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'wordpress' has a config error. Unrecognised keys: glitter."
        );
    }

    #[test]
    fn test_ports_and_environment() {
        let applications = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', ports: ['8080:80'], \
             environment: {WORDPRESS_ADMIN: admin}}}",
        ))
        .unwrap();
        let app = &applications["wordpress"];
        assert_eq!(
            app.ports.iter().next().unwrap(),
            &Port {
                internal_port: 80,
                external_port: 8080
            }
        );
        assert_eq!(
            app.environment.as_ref().unwrap()["WORDPRESS_ADMIN"],
            "admin"
        );
    }

    #[test]
    fn test_invalid_port_string() {
        let err = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', ports: ['8080']}}",
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'wordpress' has a config error. Invalid ports specification. \
             Port entry '8080' is not in the form 'host:container'."
        );
    }

    #[test]
    fn test_single_volume() {
        let applications = applications_from_compose_configuration(&yaml(
            "{mysql: {image: 'sample/mysql:5', volumes: ['/var/lib/mysql']}}",
        ))
        .unwrap();
        assert_eq!(
            applications["mysql"].volume,
            Some(AttachedVolume::new("mysql", "/var/lib/mysql"))
        );
    }

    #[test]
    fn test_multiple_volumes_rejected() {
        let err = applications_from_compose_configuration(&yaml(
            "{mysql: {image: 'sample/mysql:5', volumes: ['/a', '/b']}}",
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'mysql' has a config error. Invalid volumes specification. \
             Only one volume per application is supported."
        );
    }

    #[test]
    fn test_link_resolution_is_order_independent() {
        // The link target appears after the application referencing it.
        let applications = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', links: ['mysql:db']}, \
             mysql: {image: 'sample/mysql:5', ports: ['3306:3306', '3307:3307']}}",
        ))
        .unwrap();
        let links = &applications["wordpress"].links;
        assert_eq!(links.len(), 2);
        for link in links {
            assert_eq!(link.alias, "db");
        }
    }

    #[test]
    fn test_link_alias_defaults_to_target() {
        let applications = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', links: ['mysql']}, \
             mysql: {image: 'sample/mysql:5', ports: ['3306:3306']}}",
        ))
        .unwrap();
        let link = applications["wordpress"].links.iter().next().unwrap();
        assert_eq!(link.alias, "mysql");
        assert_eq!(link.local_port, 3306);
    }

    #[test]
    fn test_link_ports_come_from_target() {
        let applications = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', links: ['mysql:db']}, \
             mysql: {image: 'sample/mysql:5', ports: ['13306:3306']}}",
        ))
        .unwrap();
        let mysql_ports = &applications["mysql"].ports;
        for link in &applications["wordpress"].links {
            assert!(mysql_ports
                .iter()
                .any(|port| port.external_port == link.remote_port));
        }
    }

    #[test]
    fn test_link_to_unknown_application() {
        let err = applications_from_compose_configuration(&yaml(
            "{wordpress: {image: 'sample/wordpress:latest', links: ['mysql']}}",
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Application 'wordpress' has a config error. Invalid links specification. \
             Link to unknown application: mysql."
        );
    }
}
