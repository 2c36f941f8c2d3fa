//! End-to-end planner scenarios.
//!
//! Each test builds a desired deployment, a last-known cluster state and
//! an observed node state, then compares the computed plan against the
//! exact expected tree of state changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use herder::testing::{active_unit, stopped_unit, FakePool, FakeRemoteNodes, FakeRuntime};
use herder::{
    make_memory_network_in, Application, AttachedVolume, Deployment, Deployer, MemoryNetwork,
    Network, Node, NodeState, Port, Proxy, StateChange, VolumePool,
};

const NAMESPACE: &str = "planner-tests";

fn deployer() -> Deployer {
    deployer_with(FakeRuntime::new(), make_memory_network_in(NAMESPACE))
}

fn deployer_with(runtime: FakeRuntime, network: MemoryNetwork) -> Deployer {
    Deployer::new(
        Arc::new(FakePool::new()),
        Arc::new(runtime),
        Arc::new(network),
        Arc::new(FakeRemoteNodes::new()),
    )
}

fn app(name: &str, image: &str) -> Application {
    let mut app = Application::named(name);
    app.image = Some(image.parse().unwrap());
    app
}

fn app_with_port(name: &str, image: &str, internal: u16, external: u16) -> Application {
    let mut app = app(name, image);
    app.ports = [Port {
        internal_port: internal,
        external_port: external,
    }]
    .into();
    app
}

fn app_with_volume(name: &str, image: &str, mountpoint: &str) -> Application {
    app(name, image).with_volume(AttachedVolume::new(name, mountpoint))
}

fn node(hostname: &str, applications: Vec<Application>) -> Node {
    Node::new(hostname, applications).unwrap()
}

fn deployment(nodes: Vec<Node>) -> Deployment {
    Deployment::new(nodes).unwrap()
}

fn running(applications: Vec<Application>) -> NodeState {
    NodeState {
        running: applications.into_iter().collect(),
        not_running: BTreeSet::new(),
        used_ports: BTreeSet::new(),
    }
}

fn not_running(applications: Vec<Application>) -> NodeState {
    NodeState {
        running: BTreeSet::new(),
        not_running: applications.into_iter().collect(),
        used_ports: BTreeSet::new(),
    }
}

async fn plan(
    deployer: &Deployer,
    desired: &Deployment,
    current: &Deployment,
    observed: &NodeState,
    hostname: &str,
) -> StateChange {
    deployer
        .calculate_necessary_state_changes(desired, current, observed, hostname)
        .await
        .unwrap()
}

/// Every leaf change in the plan, in execution order.
fn flatten(change: &StateChange) -> Vec<&StateChange> {
    match change {
        StateChange::Sequentially { changes } | StateChange::InParallel { changes } => {
            changes.iter().flat_map(flatten).collect()
        }
        leaf => vec![leaf],
    }
}

#[tokio::test]
async fn start_from_empty_node() {
    let mysql = app("mysql-hybridcluster", "clusterhq/mysql:14");
    let desired = deployment(vec![node("node1.example.com", vec![mysql.clone()])]);

    let changes = plan(
        &deployer(),
        &desired,
        &Deployment::default(),
        &NodeState::default(),
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![StateChange::in_parallel(vec![
            StateChange::StartApplication {
                application: mysql,
                hostname: "node1.example.com".to_string(),
            }
        ])])
    );
}

#[tokio::test]
async fn stop_extraneous_application() {
    let observed = running(vec![Application::named("site-hybridcluster")]);

    let changes = plan(
        &deployer(),
        &Deployment::default(),
        &Deployment::default(),
        &observed,
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![StateChange::in_parallel(vec![
            StateChange::StopApplication {
                application: Application::named("site-hybridcluster"),
            }
        ])])
    );
}

#[tokio::test]
async fn remote_exposure_sets_proxies() {
    let web = app_with_port("web", "clusterhq/web:1", 80, 8080);
    let desired = deployment(vec![
        node("node1.example.com", vec![]),
        node("node2.example.com", vec![web]),
    ]);

    let changes = plan(
        &deployer(),
        &desired,
        &Deployment::default(),
        &NodeState::default(),
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![StateChange::SetProxies {
            proxies: [Proxy::new("node2.example.com", 8080, NAMESPACE)].into(),
        }])
    );
}

#[tokio::test]
async fn proxies_already_correct_are_left_alone() {
    let web = app_with_port("web", "clusterhq/web:1", 80, 8080);
    let desired = deployment(vec![
        node("node1.example.com", vec![]),
        node("node2.example.com", vec![web]),
    ]);

    let network = make_memory_network_in(NAMESPACE);
    network
        .create_proxy_to("node2.example.com", 8080)
        .await
        .unwrap();
    let deployer = deployer_with(FakeRuntime::new(), network);

    let changes = plan(
        &deployer,
        &desired,
        &Deployment::default(),
        &NodeState::default(),
        "node1.example.com",
    )
    .await;

    assert!(changes.is_empty());
}

#[tokio::test]
async fn volume_creation_precedes_start() {
    let psql = app_with_volume("psql-hybridcluster", "clusterhq/postgresql:9", "/var/lib/data");
    let desired = deployment(vec![node("node1.example.com", vec![psql.clone()])]);

    let changes = plan(
        &deployer(),
        &desired,
        &Deployment::default(),
        &NodeState::default(),
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![
            StateChange::in_parallel(vec![StateChange::CreateVolume {
                volume: AttachedVolume::new("psql-hybridcluster", "/var/lib/data"),
            }]),
            StateChange::in_parallel(vec![StateChange::StartApplication {
                application: psql,
                hostname: "node1.example.com".to_string(),
            }]),
        ])
    );
}

#[tokio::test]
async fn volume_swap_between_two_nodes() {
    let volume_a = AttachedVolume::new("app-a", "/var/lib/a");
    let volume_b = AttachedVolume::new("app-b", "/var/lib/b");
    let app_a = app_with_volume("app-a", "clusterhq/a:1", "/var/lib/a");
    let app_b = app_with_volume("app-b", "clusterhq/b:1", "/var/lib/b");

    let current = deployment(vec![
        node("node1.example.com", vec![app_a.clone()]),
        node("node2.example.com", vec![app_b.clone()]),
    ]);
    let desired = deployment(vec![
        node("node1.example.com", vec![app_b.clone()]),
        node("node2.example.com", vec![app_a.clone()]),
    ]);
    let observed = running(vec![Application::named("app-a")]);

    let changes = plan(
        &deployer(),
        &desired,
        &current,
        &observed,
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![
            StateChange::in_parallel(vec![StateChange::PushVolume {
                volume: volume_a.clone(),
                hostname: "node2.example.com".to_string(),
            }]),
            StateChange::in_parallel(vec![StateChange::StopApplication {
                application: Application::named("app-a"),
            }]),
            StateChange::in_parallel(vec![StateChange::HandoffVolume {
                volume: volume_a,
                hostname: "node2.example.com".to_string(),
            }]),
            StateChange::in_parallel(vec![StateChange::WaitForVolume { volume: volume_b }]),
            StateChange::in_parallel(vec![StateChange::StartApplication {
                application: app_b,
                hostname: "node1.example.com".to_string(),
            }]),
        ])
    );
}

#[tokio::test]
async fn handoffs_always_precede_waits() {
    let app_a = app_with_volume("app-a", "clusterhq/a:1", "/var/lib/a");
    let app_b = app_with_volume("app-b", "clusterhq/b:1", "/var/lib/b");
    let current = deployment(vec![
        node("node1.example.com", vec![app_a.clone()]),
        node("node2.example.com", vec![app_b.clone()]),
    ]);
    let desired = deployment(vec![
        node("node1.example.com", vec![app_b]),
        node("node2.example.com", vec![app_a]),
    ]);
    let observed = running(vec![Application::named("app-a")]);

    let changes = plan(
        &deployer(),
        &desired,
        &current,
        &observed,
        "node1.example.com",
    )
    .await;

    let leaves = flatten(&changes);
    let handoffs: Vec<usize> = leaves
        .iter()
        .enumerate()
        .filter(|(_, leaf)| matches!(leaf, StateChange::HandoffVolume { .. }))
        .map(|(index, _)| index)
        .collect();
    let waits: Vec<usize> = leaves
        .iter()
        .enumerate()
        .filter(|(_, leaf)| matches!(leaf, StateChange::WaitForVolume { .. }))
        .map(|(index, _)| index)
        .collect();
    assert!(!handoffs.is_empty());
    assert!(!waits.is_empty());
    assert!(handoffs.iter().max() < waits.iter().min());
}

#[tokio::test]
async fn stopped_but_wanted_application_is_restarted() {
    let mysql = app("mysql-hybridcluster", "clusterhq/mysql:14");
    let desired = deployment(vec![node("node1.example.com", vec![mysql.clone()])]);
    let observed = not_running(vec![Application::named("mysql-hybridcluster")]);

    let changes = plan(
        &deployer(),
        &desired,
        &Deployment::default(),
        &observed,
        "node1.example.com",
    )
    .await;

    assert_eq!(
        changes,
        StateChange::sequentially(vec![StateChange::in_parallel(vec![
            StateChange::sequentially(vec![
                StateChange::StopApplication {
                    application: mysql.clone(),
                },
                StateChange::StartApplication {
                    application: mysql,
                    hostname: "node1.example.com".to_string(),
                },
            ])
        ])])
    );
}

#[tokio::test]
async fn converged_node_plans_nothing() {
    let mysql = app("mysql-hybridcluster", "clusterhq/mysql:14");
    let desired = deployment(vec![node("node1.example.com", vec![mysql])]);
    let observed = running(vec![Application::named("mysql-hybridcluster")]);

    let changes = plan(
        &deployer(),
        &desired,
        &desired.clone(),
        &observed,
        "node1.example.com",
    )
    .await;

    assert_eq!(changes, StateChange::empty());
    assert!(changes.is_empty());
}

#[tokio::test]
async fn converged_node_with_volume_plans_nothing() {
    let psql = app_with_volume("psql-hybridcluster", "clusterhq/postgresql:9", "/var/lib/data");
    let desired = deployment(vec![
        node("node1.example.com", vec![psql]),
        node("node2.example.com", vec![]),
    ]);
    let mut observed_app = Application::named("psql-hybridcluster");
    observed_app.volume = Some(AttachedVolume::unknown_mountpoint("psql-hybridcluster"));
    let observed = running(vec![observed_app]);

    let changes = plan(
        &deployer(),
        &desired,
        &desired.clone(),
        &observed,
        "node1.example.com",
    )
    .await;

    assert!(changes.is_empty());
}

#[tokio::test]
async fn discover_node_configuration_splits_by_activation_state() {
    let runtime = FakeRuntime::with_units([
        active_unit("site-hybridcluster"),
        stopped_unit("mysql-hybridcluster"),
    ]);
    let pool = FakePool::new();
    pool.create("mysql-hybridcluster").await.unwrap();
    let network = make_memory_network_in(NAMESPACE).with_used_ports([4000]);
    let deployer = Deployer::new(
        Arc::new(pool),
        Arc::new(runtime),
        Arc::new(network),
        Arc::new(FakeRemoteNodes::new()),
    );

    let observed = deployer.discover_node_configuration().await.unwrap();

    assert_eq!(
        observed.running,
        [Application::named("site-hybridcluster")].into()
    );
    let mut expected_stopped = Application::named("mysql-hybridcluster");
    expected_stopped.volume = Some(AttachedVolume::unknown_mountpoint("mysql-hybridcluster"));
    assert_eq!(observed.not_running, [expected_stopped].into());
    assert!(observed.used_ports.contains(&4000));
}

#[tokio::test]
async fn change_node_state_executes_the_plan() {
    let runtime = Arc::new(FakeRuntime::new());
    let pool = Arc::new(FakePool::new());
    let deployer = Deployer::new(
        Arc::clone(&pool) as Arc<dyn herder::VolumePool>,
        Arc::clone(&runtime) as Arc<dyn herder::ContainerRuntime>,
        Arc::new(make_memory_network_in(NAMESPACE)),
        Arc::new(FakeRemoteNodes::new()),
    );

    let psql = app_with_volume("psql-hybridcluster", "clusterhq/postgresql:9", "/var/lib/data");
    let desired = deployment(vec![node("node1.example.com", vec![psql])]);

    deployer
        .change_node_state(&desired, &Deployment::default(), "node1.example.com")
        .await
        .unwrap();

    assert!(runtime.has_unit("psql-hybridcluster").await);
    assert!(pool.get("psql-hybridcluster").await.is_ok());
    assert_eq!(
        pool.exposed_at("psql-hybridcluster").await.unwrap(),
        std::path::PathBuf::from("/var/lib/data")
    );
}

#[tokio::test]
async fn volume_handoff_executes_against_pool_and_transport() {
    let runtime = Arc::new(FakeRuntime::with_units([active_unit("app-a")]));
    let pool = Arc::new(FakePool::new());
    pool.create("app-a").await.unwrap();
    let remote_nodes = Arc::new(FakeRemoteNodes::new());
    let deployer = Deployer::new(
        Arc::clone(&pool) as Arc<dyn herder::VolumePool>,
        Arc::clone(&runtime) as Arc<dyn herder::ContainerRuntime>,
        Arc::new(make_memory_network_in(NAMESPACE)),
        Arc::clone(&remote_nodes) as Arc<dyn herder::RemoteNodes>,
    );

    let app_a = app_with_volume("app-a", "clusterhq/a:1", "/var/lib/a");
    let current = deployment(vec![
        node("node1.example.com", vec![app_a.clone()]),
        node("node2.example.com", vec![]),
    ]);
    let desired = deployment(vec![
        node("node1.example.com", vec![]),
        node("node2.example.com", vec![app_a]),
    ]);

    deployer
        .change_node_state(&desired, &current, "node1.example.com")
        .await
        .unwrap();

    assert_eq!(pool.pushed().await, vec!["app-a".to_string()]);
    assert_eq!(pool.handed_off().await, vec!["app-a".to_string()]);
    assert!(!runtime.has_unit("app-a").await);
    // Push connects first, then handoff connects again.
    assert_eq!(
        remote_nodes.connections().await,
        vec!["node2.example.com".to_string(), "node2.example.com".to_string()]
    );
}

#[tokio::test]
async fn started_application_receives_link_environment() {
    let runtime = Arc::new(FakeRuntime::new());
    let deployer = Deployer::new(
        Arc::new(FakePool::new()),
        Arc::clone(&runtime) as Arc<dyn herder::ContainerRuntime>,
        Arc::new(make_memory_network_in(NAMESPACE)),
        Arc::new(FakeRemoteNodes::new()),
    );

    let mut web = app("web", "clusterhq/web:1");
    web.links = [herder::Link::new(3306, 13306, "mysql").unwrap()].into();
    let desired = deployment(vec![node("node1.example.com", vec![web])]);

    deployer
        .change_node_state(&desired, &Deployment::default(), "node1.example.com")
        .await
        .unwrap();

    let environment = runtime.environment_of("web").await.unwrap();
    assert_eq!(
        environment["MYSQL_PORT_3306_TCP"],
        "tcp://node1.example.com:13306"
    );
    assert_eq!(environment["MYSQL_PORT_3306_TCP_PORT"], "13306");
}
