//! Inventory of hosts and groups
//!
//! The inventory is a YAML file with connection `defaults`, a `hosts` map keyed
//! by address and a `groups` map. Every host is implicitly a member of `all`.
//! A group may list `children`; their hosts become members of the parent too.

pub mod injected;
pub mod resolver;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::debug;

use crate::connection::keys::KeySource;
use crate::connection::ConnectionInfo;
use crate::error::ConfigError;

pub use injected::{AccountRecord, InjectedDecl, InjectedSources, InjectedVars, Shape};
pub use resolver::Resolver;

/// Name of the implicit group containing every host
pub const ALL_GROUP: &str = "all";

const DEFAULT_PORT: u16 = 22;

/// How the runner reaches a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ssh,
    Local,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectionDecl {
    user: Option<String>,
    port: Option<u16>,
    private_key: Option<String>,
    private_key_env: Option<String>,
    #[serde(rename = "become")]
    escalate: Option<bool>,
    connection: Option<Transport>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostDecl {
    user: Option<String>,
    port: Option<u16>,
    private_key: Option<String>,
    private_key_env: Option<String>,
    #[serde(rename = "become")]
    escalate: Option<bool>,
    connection: Option<Transport>,
    #[serde(default)]
    vars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupDecl {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default)]
    vars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryFile {
    #[serde(default)]
    defaults: ConnectionDecl,
    #[serde(default)]
    hosts: BTreeMap<String, Option<HostDecl>>,
    #[serde(default)]
    groups: BTreeMap<String, GroupDecl>,
}

/// A target host with its resolved transport parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub address: String,
    pub user: String,
    pub port: u16,
    pub private_key: Option<String>,
    pub private_key_env: Option<String>,
    /// Host-level escalation; `None` follows the play
    #[serde(rename = "become", skip_serializing_if = "Option::is_none")]
    pub escalate: Option<bool>,
    pub transport: Transport,
    /// Sorted group memberships, excluding `all`
    pub groups: Vec<String>,
    pub vars: BTreeMap<String, Value>,
}

impl Host {
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
        }
    }

    /// Escalation for a play, unless the host pins its own
    pub fn escalates(&self, play_become: bool) -> bool {
        self.escalate.unwrap_or(play_become)
    }

    pub fn in_group(&self, group: &str) -> bool {
        group == ALL_GROUP || self.groups.iter().any(|g| g == group)
    }
}

/// A named set of hosts with shared variables
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Group {
    pub name: String,
    /// Own hosts followed by those of every descendant group
    pub hosts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Longest parent chain above this group; 0 for top-level groups
    #[serde(skip)]
    pub depth: usize,
    pub vars: BTreeMap<String, Value>,
}

/// Every group's hosts with its children folded in, in declaration order
fn expand_groups(
    groups: &BTreeMap<String, GroupDecl>,
) -> Result<BTreeMap<String, Vec<String>>, ConfigError> {
    fn visit<'a>(
        name: &'a str,
        groups: &'a BTreeMap<String, GroupDecl>,
        trail: &mut Vec<&'a str>,
        done: &mut BTreeMap<String, Vec<String>>,
    ) -> Result<(), ConfigError> {
        if done.contains_key(name) {
            return Ok(());
        }
        if trail.contains(&name) {
            return Err(ConfigError::Invalid(format!(
                "group cycle: {} -> {name}",
                trail.join(" -> ")
            )));
        }
        let decl = groups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))?;
        trail.push(name);
        let mut hosts = decl.hosts.clone();
        for child in &decl.children {
            visit(child, groups, trail, done)?;
            for address in &done[child.as_str()] {
                if !hosts.contains(address) {
                    hosts.push(address.clone());
                }
            }
        }
        trail.pop();
        done.insert(name.to_string(), hosts);
        Ok(())
    }

    let mut done = BTreeMap::new();
    for name in groups.keys() {
        visit(name, groups, &mut Vec::new(), &mut done)?;
    }
    Ok(done)
}

/// Depth of every group below its ancestors; the hierarchy must be acyclic
fn group_depths(groups: &BTreeMap<String, GroupDecl>) -> BTreeMap<String, usize> {
    fn depth_of<'a>(
        name: &'a str,
        parents: &BTreeMap<&'a str, Vec<&'a str>>,
        depths: &mut BTreeMap<String, usize>,
    ) -> usize {
        if let Some(depth) = depths.get(name) {
            return *depth;
        }
        let depth = parents
            .get(name)
            .into_iter()
            .flatten()
            .map(|parent| depth_of(parent, parents, depths) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(name.to_string(), depth);
        depth
    }

    let mut parents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, decl) in groups {
        for child in &decl.children {
            parents.entry(child.as_str()).or_default().push(name.as_str());
        }
    }
    let mut depths = BTreeMap::new();
    for name in groups.keys() {
        depth_of(name, &parents, &mut depths);
    }
    depths
}

/// Parsed and cross-checked inventory
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: BTreeMap<String, Host>,
    groups: BTreeMap<String, Group>,
}

impl Inventory {
    /// Load an inventory file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents, path)
    }

    /// Parse inventory YAML; `origin` names the source in errors
    pub fn from_yaml(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file: InventoryFile =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::from_file(file)
    }

    fn from_file(file: InventoryFile) -> Result<Self, ConfigError> {
        for (name, group) in &file.groups {
            if name == ALL_GROUP && !(group.hosts.is_empty() && group.children.is_empty()) {
                return Err(ConfigError::Invalid(
                    "group 'all' is implicit and cannot list hosts or children".to_string(),
                ));
            }
            if let Some(address) = group.hosts.iter().find(|a| !file.hosts.contains_key(*a)) {
                return Err(ConfigError::UnknownHost {
                    group: name.clone(),
                    host: address.clone(),
                });
            }
        }
        let mut expanded = expand_groups(&file.groups)?;
        let depths = group_depths(&file.groups);

        let mut memberships: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (name, hosts) in &expanded {
            for address in hosts {
                memberships
                    .entry(address.as_str())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let defaults = &file.defaults;
        let mut hosts = BTreeMap::new();
        for (address, decl) in &file.hosts {
            let conn = decl.clone().unwrap_or_default();
            let transport = conn
                .connection
                .or(defaults.connection)
                .unwrap_or_default();

            let host_key = conn.private_key.clone();
            let host_key_env = conn.private_key_env.clone();
            // a key declared on the host replaces both default key sources
            let (private_key, private_key_env) = if host_key.is_some() || host_key_env.is_some() {
                (host_key, host_key_env)
            } else {
                (
                    defaults.private_key.clone(),
                    defaults.private_key_env.clone(),
                )
            };

            let user = conn.user.clone().or_else(|| defaults.user.clone());
            let user = match (transport, user) {
                (_, Some(user)) => user,
                (Transport::Local, None) => String::new(),
                (Transport::Ssh, None) => {
                    return Err(ConfigError::Invalid(format!(
                        "host {address}: no login user declared"
                    )))
                }
            };
            if transport == Transport::Ssh && private_key.is_none() && private_key_env.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "host {address}: no private_key or private_key_env declared"
                )));
            }

            let groups = memberships
                .get(address.as_str())
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();

            hosts.insert(
                address.clone(),
                Host {
                    address: address.clone(),
                    user,
                    port: conn.port.or(defaults.port).unwrap_or(DEFAULT_PORT),
                    private_key,
                    private_key_env,
                    escalate: conn.escalate.or(defaults.escalate),
                    transport,
                    groups,
                    vars: conn.vars,
                },
            );
        }

        let mut groups: BTreeMap<String, Group> = file
            .groups
            .into_iter()
            .map(|(name, decl)| {
                let group = Group {
                    name: name.clone(),
                    hosts: expanded.remove(&name).unwrap_or_default(),
                    children: decl.children,
                    depth: depths.get(&name).copied().unwrap_or(0),
                    vars: decl.vars,
                };
                (name, group)
            })
            .collect();
        let all = groups.entry(ALL_GROUP.to_string()).or_insert_with(|| Group {
            name: ALL_GROUP.to_string(),
            hosts: Vec::new(),
            children: Vec::new(),
            depth: 0,
            vars: BTreeMap::new(),
        });
        all.hosts = hosts.keys().cloned().collect();

        debug!(hosts = hosts.len(), groups = groups.len(), "inventory loaded");
        Ok(Self { hosts, groups })
    }

    pub fn host(&self, address: &str) -> Option<&Host> {
        self.hosts.get(address)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Hosts of a group in group declaration order
    pub fn hosts_in(&self, group: &str) -> Result<Vec<&Host>, ConfigError> {
        let group = self
            .groups
            .get(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.to_string()))?;
        Ok(group
            .hosts
            .iter()
            .filter_map(|address| self.hosts.get(address))
            .collect())
    }

    /// Hosts of `group`, narrowed by `limit` (a group name or a host address)
    pub fn select(&self, group: &str, limit: Option<&str>) -> Result<Vec<&Host>, ConfigError> {
        let hosts = self.hosts_in(group)?;
        let Some(limit) = limit else {
            return Ok(hosts);
        };
        if self.groups.contains_key(limit) {
            Ok(hosts.into_iter().filter(|h| h.in_group(limit)).collect())
        } else if self.hosts.contains_key(limit) {
            Ok(hosts.into_iter().filter(|h| h.address == limit).collect())
        } else {
            Err(ConfigError::UnknownGroup(limit.to_string()))
        }
    }

    /// Group variable layers for a host: `all` first, then parents before
    /// children, alphabetical within one depth
    pub fn group_layers(&self, host: &Host) -> Vec<&Group> {
        let mut member: Vec<&Group> = host
            .groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .collect();
        member.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.name.cmp(&b.name)));

        let mut layers = Vec::new();
        if let Some(all) = self.groups.get(ALL_GROUP) {
            layers.push(all);
        }
        layers.extend(member);
        layers
    }

    /// Check a host's key material is present before contacting anything
    pub fn check_credentials(&self, host: &Host) -> Result<(), ConfigError> {
        if host.transport == Transport::Local {
            return Ok(());
        }
        KeySource::for_host(host)
            .and_then(|source| source.check())
            .map_err(|e| ConfigError::Invalid(format!("host {}: {e}", host.address)))
    }
}
