//! iptables-backed port proxying.
//!
//! Each proxy is three NAT rules: a PREROUTING DNAT that rewrites the
//! destination of inbound traffic, a POSTROUTING MASQUERADE so replies
//! route back through this node, and an OUTPUT DNAT so connections
//! originating on the node itself are proxied too. The PREROUTING rule
//! carries a comment of the form `herder <namespace>` which is the only
//! durable record of proxy ownership; enumeration works by reading the
//! rules back out of `iptables-save` output.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Proxy;
use crate::network::{Network, DEFAULT_NAMESPACE};

/// Fixed ASCII prefix identifying rules managed by this crate. The
/// controller namespace is appended to form the rule comment.
pub const COMMENT_MARKER: &str = "herder ";

/// TCP connection states that occupy a port: established and listen.
const OCCUPYING_TCP_STATES: [&str; 2] = ["01", "0A"];

/// An iptables-backed [`Network`] controller.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    namespace: String,
    iptables_path: PathBuf,
    iptables_save_path: PathBuf,
}

/// Create a [`HostNetwork`] in the default namespace.
pub fn make_host_network() -> Result<HostNetwork> {
    make_host_network_in(DEFAULT_NAMESPACE)
}

/// Create a [`HostNetwork`] owning the given namespace.
pub fn make_host_network_in(namespace: impl Into<String>) -> Result<HostNetwork> {
    Ok(HostNetwork {
        namespace: namespace.into(),
        iptables_path: find_binary("iptables")?,
        iptables_save_path: find_binary("iptables-save")?,
    })
}

fn find_binary(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::kernel_rule(name, "binary not found in PATH"))
}

impl HostNetwork {
    fn comment(&self) -> String {
        format!("{COMMENT_MARKER}{}", self.namespace)
    }

    /// Run iptables with the given argv, failing on non-zero exit.
    async fn iptables(&self, args: &[&str]) -> Result<()> {
        debug!(argv = ?args, "iptables");
        let output = Command::new(&self.iptables_path)
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::kernel_rule(
                format!("iptables {}", args.join(" ")),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }

    async fn save_nat_table(&self) -> Result<String> {
        let output = Command::new(&self.iptables_save_path)
            .args(["--table", "nat"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::kernel_rule(
                "iptables-save --table nat",
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Flip the kernel knobs proxying depends on: forwarding on the
    /// default interface, and route_localnet on every interface so the
    /// OUTPUT chain DNAT affects loopback-originated traffic.
    async fn enable_routing_knobs(&self) -> Result<()> {
        write_knob("/proc/sys/net/ipv4/conf/default/forwarding").await?;
        let mut conf = tokio::fs::read_dir("/proc/sys/net/ipv4/conf").await?;
        while let Some(entry) = conf.next_entry().await? {
            let knob = entry.path().join("route_localnet");
            write_knob(&knob.to_string_lossy()).await?;
        }
        Ok(())
    }

    async fn enumerate_all_proxies(&self) -> Result<Vec<Proxy>> {
        let output = self.save_nat_table().await?;
        Ok(proxies_from_nat_save(&output))
    }
}

async fn write_knob(path: &str) -> Result<()> {
    tokio::fs::write(path, "1")
        .await
        .map_err(|err| Error::kernel_rule(format!("sysctl {path}"), err.to_string()))
}

#[async_trait]
impl Network for HostNetwork {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_proxy_to(&self, ip: &str, port: u16) -> Result<Proxy> {
        debug!(target_ip = ip, target_port = port, "create_proxy_to");
        let port_str = port.to_string();
        let destination = format!("{ip}:{port}");
        let comment = self.comment();

        // Rewrite the destination of inbound traffic before the routing
        // decision, so the normal routing rules deliver it to the peer.
        // Only traffic addressed to this host on the proxied port is
        // touched. The comment tags the rule as ours.
        self.iptables(&[
            "--table", "nat",
            "--append", "PREROUTING",
            "--protocol", "tcp", "--destination-port", &port_str,
            "--match", "addrtype", "--dst-type", "LOCAL",
            "--match", "comment", "--comment", &comment,
            "--jump", "DNAT", "--to-destination", &destination,
        ])
        .await?;

        // The peer must see this node as the connection source, or it
        // would reply directly to the downstream client and break the
        // TCP session. Masquerade on the way out.
        self.iptables(&[
            "--table", "nat",
            "--append", "POSTROUTING",
            "--protocol", "tcp", "--destination-port", &port_str,
            "--jump", "MASQUERADE",
        ])
        .await?;

        // Locally-originated traffic bypasses PREROUTING and goes through
        // OUTPUT instead, so the same DNAT is needed there.
        self.iptables(&[
            "--table", "nat",
            "--append", "OUTPUT",
            "--protocol", "tcp", "--destination-port", &port_str,
            "--match", "addrtype", "--dst-type", "LOCAL",
            "--jump", "DNAT", "--to-destination", &destination,
        ])
        .await?;

        self.enable_routing_knobs().await?;

        Ok(Proxy::new(ip, port, self.namespace.clone()))
    }

    async fn delete_proxy(&self, proxy: &Proxy) -> Result<()> {
        debug!(
            target_ip = %proxy.target_ip,
            target_port = proxy.target_port,
            "delete_proxy"
        );
        let port_str = proxy.target_port.to_string();
        let destination = format!("{}:{}", proxy.target_ip, proxy.target_port);
        let comment = format!("{COMMENT_MARKER}{}", proxy.namespace);

        let commands: [&[&str]; 3] = [
            &[
                "--table", "nat",
                "--delete", "PREROUTING",
                "--protocol", "tcp", "--destination-port", &port_str,
                "--match", "addrtype", "--dst-type", "LOCAL",
                "--match", "comment", "--comment", &comment,
                "--jump", "DNAT", "--to-destination", &destination,
            ],
            &[
                "--table", "nat",
                "--delete", "POSTROUTING",
                "--protocol", "tcp", "--destination-port", &port_str,
                "--jump", "MASQUERADE",
            ],
            &[
                "--table", "nat",
                "--delete", "OUTPUT",
                "--protocol", "tcp", "--destination-port", &port_str,
                "--match", "addrtype", "--dst-type", "LOCAL",
                "--jump", "DNAT", "--to-destination", &destination,
            ],
        ];

        for argv in commands {
            match self.iptables(argv).await {
                Ok(()) => {}
                // A rule that is already gone is not fatal.
                Err(Error::KernelRule { stderr, .. })
                    if stderr.contains("does a matching rule exist") =>
                {
                    warn!(
                        target_port = proxy.target_port,
                        "proxy rule already removed"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn enumerate_proxies(&self) -> Result<Vec<Proxy>> {
        Ok(self
            .enumerate_all_proxies()
            .await?
            .into_iter()
            .filter(|proxy| proxy.namespace == self.namespace)
            .collect())
    }

    async fn enumerate_used_ports(&self) -> Result<BTreeSet<u16>> {
        let mut ports = observed_tcp_ports().await?;
        // Proxy ports are used no matter which namespace installed them.
        ports.extend(
            self.enumerate_all_proxies()
                .await?
                .into_iter()
                .map(|proxy| proxy.target_port),
        );
        Ok(ports)
    }
}

/// Options recognized on a single NAT table rule line.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RuleOptions {
    pub(crate) comment: Option<String>,
    pub(crate) destination_port: Option<u16>,
    pub(crate) to_destination: Option<String>,
}

/// Recover the proxies recorded in `iptables-save --table nat` output,
/// across all namespaces.
pub(crate) fn proxies_from_nat_save(output: &str) -> Vec<Proxy> {
    let mut proxies = Vec::new();
    for line in nat_table_section(output) {
        let options = parse_rule_options(&split_rule_words(line));
        let (Some(comment), Some(port), Some(destination)) = (
            options.comment,
            options.destination_port,
            options.to_destination,
        ) else {
            continue;
        };
        let Some(namespace) = comment.strip_prefix(COMMENT_MARKER) else {
            continue;
        };
        proxies.push(Proxy::new(destination_host(&destination), port, namespace));
    }
    proxies
}

/// The rule lines between the `*nat` header and its `COMMIT` footer.
fn nat_table_section(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .skip_while(|line| line.trim() != "*nat")
        .skip(1)
        .take_while(|line| line.trim() != "COMMIT")
        .filter(|line| !line.starts_with(':') && !line.starts_with('#'))
}

/// Split a rule line into words, honoring the double quoting
/// iptables-save applies to comments.
fn split_rule_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in line.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch.is_whitespace() && !in_quotes {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Scan a rule's words for the options a proxy rule carries. Unknown
/// options are ignored rather than parsed; only `--dport`,
/// `--to-destination` and `--comment` matter here.
fn parse_rule_options(words: &[String]) -> RuleOptions {
    let value_after = |flag: &str| {
        words
            .iter()
            .position(|word| word == flag)
            .and_then(|index| words.get(index + 1))
            .cloned()
    };
    RuleOptions {
        comment: value_after("--comment"),
        destination_port: value_after("--dport").and_then(|port| port.parse().ok()),
        to_destination: value_after("--to-destination"),
    }
}

/// The host part of a DNAT destination, with any `:port` suffix removed.
fn destination_host(destination: &str) -> &str {
    match destination.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => destination,
    }
}

/// Ports of local TCP endpoints in the listening or established state,
/// from the kernel's connection tables.
async fn observed_tcp_ports() -> Result<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match tokio::fs::read_to_string(table).await {
            Ok(contents) => ports.extend(parse_proc_net_tcp(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ports)
}

/// Parse `/proc/net/tcp`-format connection tables. Each row carries the
/// local endpoint as `hexaddr:hexport` and the connection state as a
/// two-digit hex code.
fn parse_proc_net_tcp(contents: &str) -> BTreeSet<u16> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if !OCCUPYING_TCP_STATES.contains(state) {
                return None;
            }
            let (_, hex_port) = local.rsplit_once(':')?;
            u16::from_str_radix(hex_port, 16).ok()
        })
        .collect()
}
