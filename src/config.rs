//! Configuration parsing and persistence.
//!
//! Two configuration formats are accepted. The native format is a
//! versioned mapping with an explicit `applications` section; the
//! compose-style format (feature `compose`) is a bare mapping of
//! application definitions and is auto-detected. Both are lifted into
//! the same model so nothing downstream cares which one was loaded.
//!
//! A parser in lenient mode additionally accepts the sentinels produced
//! when marshalling observed state: the `"unknown"` image and a null
//! mountpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{
    Application, AttachedVolume, Deployment, ImageReference, Link, Node, NodeState, Port,
};

/// The only configuration schema version this crate accepts.
pub const CONFIGURATION_VERSION: u64 = 1;

/// Where the agent persists its own node's observed state.
pub const DEFAULT_STATE_PATH: &str = "/etc/herder/node-state.yml";

/// Sentinel emitted when the observed image is unknown.
pub(crate) const UNKNOWN_IMAGE: &str = "unknown";

/// Validate and parse configurations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Configuration {
    lenient: bool,
}

impl Configuration {
    /// A strict parser for user-supplied configuration.
    pub fn new() -> Self {
        Self { lenient: false }
    }

    /// A parser that accepts the unknown-image and unknown-mountpoint
    /// sentinels found in marshalled observed state.
    pub fn lenient() -> Self {
        Self { lenient: true }
    }

    /// Validate and parse an application configuration in either format.
    pub fn applications_from_configuration(
        &self,
        config: &Value,
    ) -> Result<BTreeMap<String, Application>> {
        #[cfg(feature = "compose")]
        if crate::compose::is_compose_configuration(config) {
            debug!("detected compose-style application configuration");
            return crate::compose::applications_from_compose_configuration(config);
        }
        self.native_applications_from_configuration(config)
    }

    /// Validate and parse a native-format application configuration.
    pub fn native_applications_from_configuration(
        &self,
        config: &Value,
    ) -> Result<BTreeMap<String, Application>> {
        if !config.is_mapping() {
            return Err(Error::invalid_config(format!(
                "Application configuration must be a mapping, got {}.",
                yaml_type_name(config)
            )));
        }

        let applications_value = config.get("applications").ok_or_else(|| {
            Error::invalid_config(
                "Application configuration has an error. Missing 'applications' key.",
            )
        })?;
        let version = config.get("version").ok_or_else(|| {
            Error::invalid_config("Application configuration has an error. Missing 'version' key.")
        })?;
        if version.as_u64() != Some(CONFIGURATION_VERSION) {
            return Err(Error::invalid_config(
                "Application configuration has an error. Incorrect version specified.",
            ));
        }

        let applications_mapping = applications_value.as_mapping().ok_or_else(|| {
            Error::invalid_config(format!(
                "Application configuration has an error. \
                 'applications' must be a mapping, got {}.",
                yaml_type_name(applications_value)
            ))
        })?;

        let mut applications = BTreeMap::new();
        for (name_value, definition) in applications_mapping {
            let name = name_value.as_str().ok_or_else(|| {
                Error::invalid_config(format!(
                    "Application names must be strings, got {}.",
                    yaml_type_name(name_value)
                ))
            })?;
            let application = self.parse_application(name, definition)?;
            applications.insert(name.to_string(), application);
        }
        Ok(applications)
    }

    fn parse_application(&self, name: &str, definition: &Value) -> Result<Application> {
        let mapping = definition.as_mapping().ok_or_else(|| {
            Error::application_config(
                name,
                format!(
                    "Application definition must be a mapping, got {}.",
                    yaml_type_name(definition)
                ),
            )
        })?;

        let mut unrecognised: Vec<String> = mapping
            .keys()
            .filter_map(Value::as_str)
            .filter(|key| !["image", "environment", "ports", "links", "volume"].contains(key))
            .map(str::to_string)
            .collect();
        unrecognised.sort();
        if !unrecognised.is_empty() {
            return Err(Error::application_config(
                name,
                format!("Unrecognised keys: {}.", unrecognised.join(", ")),
            ));
        }

        let image_value = definition.get("image").ok_or_else(|| {
            Error::application_config(name, "Missing value for 'image'.")
        })?;
        let image = self.parse_image(name, image_value)?;

        let ports = match definition.get("ports") {
            Some(value) => parse_ports(value).map_err(|detail| {
                Error::application_config(
                    name,
                    format!("Invalid ports specification. {detail}"),
                )
            })?,
            None => BTreeSet::new(),
        };

        let links = match definition.get("links") {
            Some(value) => parse_links(value).map_err(|detail| {
                Error::application_config(
                    name,
                    format!("Invalid links specification. {detail}"),
                )
            })?,
            None => BTreeSet::new(),
        };

        let volume = match definition.get("volume") {
            Some(value) => Some(self.parse_volume(name, value).map_err(|detail| {
                Error::application_config(
                    name,
                    format!("Invalid volume specification. {detail}"),
                )
            })?),
            None => None,
        };

        let environment = match definition.get("environment") {
            Some(value) => Some(parse_environment(name, value)?),
            None => None,
        };

        Ok(Application {
            name: name.to_string(),
            image,
            ports,
            links,
            volume,
            environment,
        })
    }

    fn parse_image(&self, name: &str, value: &Value) -> Result<Option<ImageReference>> {
        let image_name = value.as_str().ok_or_else(|| {
            Error::application_config(
                name,
                format!("Image name must be a string, got {}.", yaml_type_name(value)),
            )
        })?;
        if self.lenient && image_name == UNKNOWN_IMAGE {
            return Ok(None);
        }
        match image_name.parse() {
            Ok(image) => Ok(Some(image)),
            Err(Error::InvalidConfig { message }) => Err(Error::application_config(
                name,
                format!("Invalid image name. {message}"),
            )),
            Err(err) => Err(err),
        }
    }

    fn parse_volume(
        &self,
        name: &str,
        value: &Value,
    ) -> std::result::Result<AttachedVolume, String> {
        let mapping = value
            .as_mapping()
            .ok_or_else(|| format!("Unexpected value: {}.", yaml_type_name(value)))?;
        let mountpoint = value.get("mountpoint").ok_or("Missing mountpoint.")?;

        let mut unrecognised: Vec<String> = mapping
            .keys()
            .filter_map(Value::as_str)
            .filter(|key| *key != "mountpoint")
            .map(str::to_string)
            .collect();
        unrecognised.sort();
        if !unrecognised.is_empty() {
            return Err(format!("Unrecognised keys: {}.", unrecognised.join(", ")));
        }

        if self.lenient && mountpoint.is_null() {
            return Ok(AttachedVolume::unknown_mountpoint(name));
        }

        let path = mountpoint.as_str().ok_or_else(|| {
            format!(
                "Mountpoint must be a string, got {}.",
                yaml_type_name(mountpoint)
            )
        })?;
        if !path.is_ascii() {
            return Err(format!("Mountpoint {path} contains non-ASCII (unsupported)."));
        }
        if !Path::new(path).is_absolute() {
            return Err(format!("Mountpoint {path} is not an absolute path."));
        }
        Ok(AttachedVolume::new(name, path))
    }

    /// Validate and parse a deployment configuration against previously
    /// parsed applications.
    pub fn deployment_from_configuration(
        &self,
        config: &Value,
        all_applications: &BTreeMap<String, Application>,
    ) -> Result<BTreeSet<Node>> {
        if !config.is_mapping() {
            return Err(Error::invalid_config(format!(
                "Deployment configuration must be a mapping, got {}.",
                yaml_type_name(config)
            )));
        }

        let nodes_value = config.get("nodes").ok_or_else(|| {
            Error::invalid_config("Deployment configuration has an error. Missing 'nodes' key.")
        })?;
        let version = config.get("version").ok_or_else(|| {
            Error::invalid_config("Deployment configuration has an error. Missing 'version' key.")
        })?;
        if version.as_u64() != Some(CONFIGURATION_VERSION) {
            return Err(Error::invalid_config(
                "Deployment configuration has an error. Incorrect version specified.",
            ));
        }

        let nodes_mapping = nodes_value.as_mapping().ok_or_else(|| {
            Error::invalid_config(format!(
                "Deployment configuration has an error. \
                 'nodes' must be a mapping, got {}.",
                yaml_type_name(nodes_value)
            ))
        })?;

        let mut nodes = BTreeSet::new();
        for (hostname_value, names_value) in nodes_mapping {
            let hostname = hostname_value.as_str().ok_or_else(|| {
                Error::invalid_config(format!(
                    "Node hostnames must be strings, got {}.",
                    yaml_type_name(hostname_value)
                ))
            })?;
            let names = names_value.as_sequence().ok_or_else(|| {
                Error::invalid_config(format!(
                    "Node {hostname} has a config error. \
                     Wrong value type: {}. Should be list.",
                    yaml_type_name(names_value)
                ))
            })?;

            let mut node_applications = Vec::new();
            for name_value in names {
                let name = name_value.as_str().ok_or_else(|| {
                    Error::invalid_config(format!(
                        "Node {hostname} has a config error. \
                         Application names must be strings, got {}.",
                        yaml_type_name(name_value)
                    ))
                })?;
                let application = all_applications.get(name).ok_or_else(|| {
                    Error::invalid_config(format!(
                        "Node {hostname} has a config error. \
                         Unrecognised application name: {name}."
                    ))
                })?;
                node_applications.push(application.clone());
            }
            nodes.insert(Node::new(hostname, node_applications)?);
        }
        Ok(nodes)
    }

    /// Validate and coerce an application configuration plus a deployment
    /// configuration into a [`Deployment`].
    pub fn model_from_configuration(
        &self,
        application_config: &Value,
        deployment_config: &Value,
    ) -> Result<Deployment> {
        let applications = self.applications_from_configuration(application_config)?;
        let nodes = self.deployment_from_configuration(deployment_config, &applications)?;
        Deployment::new(nodes)
    }
}

fn parse_ports(value: &Value) -> std::result::Result<BTreeSet<Port>, String> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| format!("'ports' must be a list, got {}.", yaml_type_name(value)))?;
    let mut ports = BTreeSet::new();
    for entry in entries {
        let mapping = entry
            .as_mapping()
            .ok_or_else(|| format!("Unexpected value: {}.", yaml_type_name(entry)))?;
        let internal = entry.get("internal").ok_or("Missing internal port.")?;
        let external = entry.get("external").ok_or("Missing external port.")?;

        let mut unrecognised: Vec<String> = mapping
            .keys()
            .filter_map(Value::as_str)
            .filter(|key| !["internal", "external"].contains(key))
            .map(str::to_string)
            .collect();
        unrecognised.sort();
        if !unrecognised.is_empty() {
            return Err(format!("Unrecognised keys: {}.", unrecognised.join(", ")));
        }

        ports.insert(Port {
            internal_port: port_number(internal)?,
            external_port: port_number(external)?,
        });
    }
    Ok(ports)
}

fn parse_links(value: &Value) -> std::result::Result<BTreeSet<Link>, String> {
    let entries = value
        .as_sequence()
        .ok_or_else(|| format!("'links' must be a list, got {}.", yaml_type_name(value)))?;
    let mut links = BTreeSet::new();
    for entry in entries {
        let mapping = entry
            .as_mapping()
            .ok_or_else(|| format!("Unexpected value: {}.", yaml_type_name(entry)))?;
        let local_port = entry.get("local_port").ok_or("Missing local port.")?;
        let remote_port = entry.get("remote_port").ok_or("Missing remote port.")?;
        let alias = entry
            .get("alias")
            .ok_or("Missing alias.")?
            .as_str()
            .ok_or("Link alias must be a string.")?;

        let mut unrecognised: Vec<String> = mapping
            .keys()
            .filter_map(Value::as_str)
            .filter(|key| !["local_port", "remote_port", "alias"].contains(key))
            .map(str::to_string)
            .collect();
        unrecognised.sort();
        if !unrecognised.is_empty() {
            return Err(format!("Unrecognised keys: {}.", unrecognised.join(", ")));
        }

        links.insert(
            Link::new(port_number(local_port)?, port_number(remote_port)?, alias)
                .map_err(|err| err.to_string())?,
        );
    }
    Ok(links)
}

fn port_number(value: &Value) -> std::result::Result<u16, String> {
    value
        .as_u64()
        .filter(|port| (1..=65535).contains(port))
        .map(|port| port as u16)
        .ok_or_else(|| {
            format!(
                "Ports must be integers in the range 1-65535, got {}.",
                yaml_scalar_display(value)
            )
        })
}

pub(crate) fn parse_environment(
    name: &str,
    value: &Value,
) -> Result<BTreeMap<String, String>> {
    let mapping = value.as_mapping().ok_or_else(|| {
        Error::application_config(
            name,
            format!(
                "'environment' must be a dictionary of key/value pairs. Got type '{}'.",
                yaml_type_name(value)
            ),
        )
    })?;
    let mut environment = BTreeMap::new();
    for (key_value, value_value) in mapping {
        let key = key_value.as_str().ok_or_else(|| {
            Error::application_config(
                name,
                format!(
                    "Environment keys must be strings, got {}.",
                    yaml_type_name(key_value)
                ),
            )
        })?;
        let value = value_value.as_str().ok_or_else(|| {
            Error::application_config(
                name,
                format!(
                    "Environment variable '{key}' must be of type string; got '{}'.",
                    yaml_type_name(value_value)
                ),
            )
        })?;
        environment.insert(key.to_string(), value.to_string());
    }
    Ok(environment)
}

/// The YAML type of a value, for error messages.
pub(crate) fn yaml_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn yaml_scalar_display(value: &Value) -> String {
    match value {
        Value::Number(number) => number.to_string(),
        Value::String(string) => format!("'{string}'"),
        other => yaml_type_name(other).to_string(),
    }
}

/// Lift the aggregated per-node observed configurations into a cluster
/// deployment.
///
/// The input maps hostnames to the native-format configuration each node
/// marshalled from its own observation, so parsing is lenient.
pub fn current_from_configuration(
    current_configuration: &BTreeMap<String, Value>,
) -> Result<Deployment> {
    let configuration = Configuration::lenient();
    let mut nodes = Vec::new();
    for (hostname, node_config) in current_configuration {
        let applications = configuration.applications_from_configuration(node_config)?;
        nodes.push(Node::new(hostname, applications.into_values())?);
    }
    Deployment::new(nodes)
}

/// Marshal a node's observed state and write it to the agent-owned path.
///
/// The write goes to a temporary file in the same directory which is then
/// renamed over the target, so a crash never leaves a half-written file.
/// Failures surface as [`Error::CreateConfiguration`].
pub async fn persist_node_state(path: &Path, state: &NodeState) -> Result<()> {
    let contents = crate::marshal::marshal_node_state(state)?;
    write_configuration(path, &contents).await
}

async fn write_configuration(path: &Path, contents: &str) -> Result<()> {
    let describe =
        |err: std::io::Error| Error::create_configuration(path, err.to_string());

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(describe)?;
    }
    let temporary: PathBuf = path.with_extension("partial");
    tokio::fs::write(&temporary, contents)
        .await
        .map_err(describe)?;
    tokio::fs::rename(&temporary, path).await.map_err(describe)?;
    debug!(path = %path.display(), "persisted node state");
    Ok(())
}
