//! Emit the native configuration shape from a node's observed state.
//!
//! The output re-parses with the lenient parser, which is how a node's
//! observation travels to its peers: ports are sorted by (external,
//! internal), links by (alias, local, remote), an unobservable image
//! becomes the `"unknown"` sentinel and an unobservable mountpoint
//! becomes null.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{CONFIGURATION_VERSION, UNKNOWN_IMAGE};
use crate::error::Result;
use crate::model::{Application, NodeState};

#[derive(Serialize)]
struct NodeStateRepr {
    version: u64,
    applications: BTreeMap<String, ApplicationRepr>,
    used_ports: Vec<u16>,
}

#[derive(Serialize)]
struct ApplicationRepr {
    image: String,
    ports: Vec<PortRepr>,
    links: Vec<LinkRepr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<VolumeRepr>,
}

#[derive(Serialize)]
struct PortRepr {
    internal: u16,
    external: u16,
}

#[derive(Serialize)]
struct LinkRepr {
    local_port: u16,
    remote_port: u16,
    alias: String,
}

#[derive(Serialize)]
struct VolumeRepr {
    mountpoint: Option<String>,
}

fn application_repr(application: &Application) -> ApplicationRepr {
    let mut ports: Vec<&crate::model::Port> = application.ports.iter().collect();
    ports.sort_by_key(|port| (port.external_port, port.internal_port));

    let mut links: Vec<&crate::model::Link> = application.links.iter().collect();
    links.sort_by_key(|link| (link.alias.clone(), link.local_port, link.remote_port));

    ApplicationRepr {
        image: application
            .image
            .as_ref()
            .map_or_else(|| UNKNOWN_IMAGE.to_string(), |image| image.full_name()),
        ports: ports
            .into_iter()
            .map(|port| PortRepr {
                internal: port.internal_port,
                external: port.external_port,
            })
            .collect(),
        links: links
            .into_iter()
            .map(|link| LinkRepr {
                local_port: link.local_port,
                remote_port: link.remote_port,
                alias: link.alias.clone(),
            })
            .collect(),
        environment: application.environment.clone(),
        volume: application.volume.as_ref().map(|volume| VolumeRepr {
            mountpoint: volume
                .mountpoint
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        }),
    }
}

/// Serialize a node's observed state as native-format YAML.
pub fn marshal_node_state(state: &NodeState) -> Result<String> {
    let repr = NodeStateRepr {
        version: CONFIGURATION_VERSION,
        applications: state
            .all_applications()
            .map(|application| (application.name.clone(), application_repr(application)))
            .collect(),
        used_ports: state.used_ports.iter().copied().collect(),
    };
    Ok(serde_yaml::to_string(&repr)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::{AttachedVolume, Link, Port};

    fn state_with(application: Application) -> NodeState {
        NodeState {
            running: [application].into(),
            not_running: BTreeSet::new(),
            used_ports: [443, 22].into(),
        }
    }

    #[test]
    fn test_unknown_image_sentinel() {
        let yaml = marshal_node_state(&state_with(Application::named("site"))).unwrap();
        assert!(yaml.contains("image: unknown"));
    }

    #[test]
    fn test_known_image() {
        let mut app = Application::named("site");
        app.image = Some("clusterhq/site:5".parse().unwrap());
        let yaml = marshal_node_state(&state_with(app)).unwrap();
        assert!(yaml.contains("image: clusterhq/site:5"));
    }

    #[test]
    fn test_ports_sorted_by_external_then_internal() {
        let mut app = Application::named("site");
        app.ports = [
            Port {
                internal_port: 90,
                external_port: 9000,
            },
            Port {
                internal_port: 80,
                external_port: 8080,
            },
        ]
        .into();
        let yaml = marshal_node_state(&state_with(app)).unwrap();
        let external_8080 = yaml.find("external: 8080").unwrap();
        let external_9000 = yaml.find("external: 9000").unwrap();
        assert!(external_8080 < external_9000);
    }

    #[test]
    fn test_links_sorted_by_alias() {
        let mut app = Application::named("site");
        app.links = [
            Link::new(80, 8080, "zebra").unwrap(),
            Link::new(80, 8080, "aardvark").unwrap(),
        ]
        .into();
        let yaml = marshal_node_state(&state_with(app)).unwrap();
        assert!(yaml.find("aardvark").unwrap() < yaml.find("zebra").unwrap());
    }

    #[test]
    fn test_unknown_mountpoint_is_null() {
        let app = Application::named("db").with_volume(AttachedVolume::unknown_mountpoint("db"));
        let yaml = marshal_node_state(&state_with(app)).unwrap();
        assert!(yaml.contains("mountpoint: null"));
    }

    #[test]
    fn test_used_ports_sorted() {
        let yaml = marshal_node_state(&state_with(Application::named("site"))).unwrap();
        assert!(yaml.find("- 22").unwrap() < yaml.find("- 443").unwrap());
    }

    #[test]
    fn test_marshalled_state_reparses() {
        let mut app = Application::named("db");
        app.image = Some("clusterhq/postgresql:9".parse().unwrap());
        app.volume = Some(AttachedVolume::new("db", "/var/lib/data"));
        app.environment = Some([("PGDATA".to_string(), "/var/lib/data".to_string())].into());

        let yaml = marshal_node_state(&state_with(app.clone())).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let reparsed = crate::config::Configuration::lenient()
            .applications_from_configuration(&value)
            .unwrap();
        assert_eq!(reparsed["db"], app);
    }
}
