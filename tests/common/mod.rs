//! In-memory Linux host for integration tests
//!
//! Interprets the probe and step vocabulary fleetplay emits (getent, id,
//! stat, sha256sum, useradd, apt-get, systemctl and friends) against a small
//! model of users, files, packages and services.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use fleetplay::connection::{CommandResult, Connection, Connector, RemoteCommand, Upload};
use fleetplay::error::ConnectionError;
use fleetplay::inventory::Host;

#[derive(Debug, Clone)]
pub struct FakeUser {
    pub home: String,
    pub shell: String,
    pub primary: String,
    pub groups: Vec<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeFile {
    pub content: Vec<u8>,
    pub mode: String,
    pub owner: String,
    pub group: String,
}

impl FakeFile {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeService {
    pub active: bool,
    pub enabled: bool,
}

#[derive(Debug, Default)]
struct Model {
    users: BTreeMap<String, FakeUser>,
    groups: BTreeSet<String>,
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    installed: BTreeMap<String, String>,
    available: BTreeMap<String, String>,
    services: BTreeMap<String, FakeService>,
    failing: Vec<String>,
    /// Every state-changing command, in order
    changes: Vec<String>,
    /// Every command line received
    commands: Vec<String>,
}

/// One simulated host
#[derive(Debug, Default)]
pub struct FakeHost {
    model: Mutex<Model>,
}

fn result(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandResult {
    CommandResult {
        status,
        stdout: stdout.into(),
        stderr: stderr.into(),
        duration: Duration::from_millis(1),
    }
}

fn ok(stdout: impl Into<String>) -> CommandResult {
    result(0, stdout, "")
}

fn no_such_file(tool: &str, path: &str) -> CommandResult {
    result(1, "", format!("{tool}: {path}: No such file or directory\n"))
}

fn octal(mode: &str) -> String {
    u32::from_str_radix(mode, 8)
        .map(|m| format!("{m:o}"))
        .unwrap_or_else(|_| mode.to_string())
}

fn parent(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    }
}

fn operands(words: &[String]) -> Vec<&str> {
    match words.iter().position(|w| w == "--") {
        Some(i) => words[i + 1..].iter().map(String::as_str).collect(),
        None => Vec::new(),
    }
}

/// Value following `flag`, if present
fn flag<'a>(words: &'a [String], flag: &str) -> Option<&'a str> {
    words
        .iter()
        .position(|w| w == flag)
        .and_then(|i| words.get(i + 1))
        .map(String::as_str)
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut model = host.model.lock().unwrap();
            model.groups.extend(["root".to_string(), "sudo".to_string()]);
            model.dirs.extend(["/".to_string(), "/home".to_string(), "/etc".to_string()]);
        }
        host
    }

    pub fn with_group(self, name: &str) -> Self {
        self.model.lock().unwrap().groups.insert(name.to_string());
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.model.lock().unwrap().dirs.insert(path.to_string());
        self
    }

    pub fn with_user(self, name: &str, groups: &[&str]) -> Self {
        {
            let mut model = self.model.lock().unwrap();
            let home = format!("/home/{name}");
            model.groups.insert(name.to_string());
            model.dirs.insert(home.clone());
            model.users.insert(
                name.to_string(),
                FakeUser {
                    home,
                    shell: "/bin/bash".to_string(),
                    primary: name.to_string(),
                    groups: groups.iter().map(|g| g.to_string()).collect(),
                    hash: None,
                },
            );
        }
        self
    }

    pub fn with_file(self, path: &str, content: &str, mode: &str, owner: &str) -> Self {
        {
            let mut model = self.model.lock().unwrap();
            model.dirs.insert(parent(path));
            model.files.insert(
                path.to_string(),
                FakeFile {
                    content: content.as_bytes().to_vec(),
                    mode: octal(mode),
                    owner: owner.to_string(),
                    group: owner.to_string(),
                },
            );
        }
        self
    }

    /// A package apt can install
    pub fn with_available(self, package: &str, version: &str) -> Self {
        self.model
            .lock()
            .unwrap()
            .available
            .insert(package.to_string(), version.to_string());
        self
    }

    pub fn with_service(self, unit: &str, active: bool, enabled: bool) -> Self {
        self.model
            .lock()
            .unwrap()
            .services
            .insert(unit.to_string(), FakeService { active, enabled });
        self
    }

    /// Commands starting with `prefix` exit 1
    pub fn failing(self, prefix: &str) -> Self {
        self.model.lock().unwrap().failing.push(prefix.to_string());
        self
    }

    pub fn changes(&self) -> Vec<String> {
        self.model.lock().unwrap().changes.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.model.lock().unwrap().commands.clone()
    }

    pub fn file(&self, path: &str) -> Option<FakeFile> {
        self.model.lock().unwrap().files.get(path).cloned()
    }

    pub fn user(&self, name: &str) -> Option<FakeUser> {
        self.model.lock().unwrap().users.get(name).cloned()
    }

    pub fn package(&self, name: &str) -> Option<String> {
        self.model.lock().unwrap().installed.get(name).cloned()
    }

    pub fn service(&self, unit: &str) -> Option<FakeService> {
        self.model.lock().unwrap().services.get(unit).cloned()
    }

    fn dispatch(&self, command: &RemoteCommand) -> CommandResult {
        let mut model = self.model.lock().unwrap();
        model.commands.push(command.line.clone());

        if model.failing.iter().any(|p| command.line.starts_with(p.as_str())) {
            model.changes.push(command.line.clone());
            return result(1, "", "simulated failure\n");
        }

        let Some(words) = shlex::split(&command.line) else {
            return result(2, "", "unparseable command line\n");
        };
        let stdin = command
            .stdin
            .as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        let args: Vec<&str> = words.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["getent", "passwd", name] => match model.users.get(*name) {
                Some(u) => ok(format!("{name}:x:1001:1001::{}:{}\n", u.home, u.shell)),
                None => result(2, "", ""),
            },
            ["getent", "group", name] => {
                if model.groups.contains(*name) {
                    ok(format!("{name}:x:1000:\n"))
                } else {
                    result(2, "", "")
                }
            }
            ["getent", "shadow", name] => match model.users.get(*name) {
                Some(u) => ok(format!(
                    "{name}:{}:19000:0:99999:7:::\n",
                    u.hash.as_deref().unwrap_or("!")
                )),
                None => result(2, "", ""),
            },
            ["id", "-nG", name] => match model.users.get(*name) {
                Some(u) => {
                    let mut all = vec![u.primary.clone()];
                    all.extend(u.groups.iter().cloned());
                    ok(format!("{}\n", all.join(" ")))
                }
                None => result(1, "", format!("id: '{name}': no such user\n")),
            },
            ["id", "-gn", name] => match model.users.get(*name) {
                Some(u) => ok(format!("{}\n", u.primary)),
                None => result(1, "", format!("id: '{name}': no such user\n")),
            },
            ["test", "-d", path] => result(i32::from(!model.dirs.contains(*path)), "", ""),
            ["test", "-e", path] => {
                let exists = model.dirs.contains(*path) || model.files.contains_key(*path);
                result(i32::from(!exists), "", "")
            }
            ["cat", "--", path] => match model.files.get(*path) {
                Some(file) => ok(file.text()),
                None => no_such_file("cat", path),
            },
            ["sha256sum", "--", path] => match model.files.get(*path) {
                Some(file) => ok(format!("{:x}  {path}\n", Sha256::digest(&file.content))),
                None => no_such_file("sha256sum", path),
            },
            ["stat", "-c", _, "--", path] => match model.files.get(*path) {
                Some(file) => ok(format!("{}:{}:{}\n", file.mode, file.owner, file.group)),
                None => no_such_file("stat", path),
            },
            ["dpkg-query", "-W", _, name] => match model.installed.get(*name) {
                Some(version) => ok(format!("install ok installed|{version}")),
                None => result(1, "", format!("dpkg-query: no packages found matching {name}\n")),
            },
            ["systemctl", "is-active", unit] => match model.services.get(*unit) {
                Some(s) if s.active => ok("active\n"),
                _ => result(3, "inactive\n", ""),
            },
            ["systemctl", "is-enabled", unit] => match model.services.get(*unit) {
                Some(s) if s.enabled => ok("enabled\n"),
                Some(_) => result(1, "disabled\n", ""),
                None => result(1, "", format!("Failed to get unit file state for {unit}\n")),
            },
            _ => {
                model.changes.push(command.line.clone());
                apply_change(&mut model, &words, &stdin)
            }
        }
    }

    fn store(&self, upload: &Upload) -> CommandResult {
        let mut model = self.model.lock().unwrap();
        model.changes.push(format!("put {}", upload.path));
        let dir = parent(&upload.path);
        if !model.dirs.contains(&dir) {
            return result(1, "", format!("mktemp: failed to create file via template '{dir}/.fleetplay.XXXXXX': No such file or directory\n"));
        }
        let previous = model.files.get(&upload.path).cloned();
        let mode = match (&upload.mode, &previous) {
            (Some(mode), _) => octal(mode),
            (None, Some(prev)) => prev.mode.clone(),
            (None, None) => "644".to_string(),
        };
        let owner = upload
            .owner
            .clone()
            .or_else(|| previous.as_ref().map(|p| p.owner.clone()))
            .unwrap_or_else(|| "root".to_string());
        let group = upload
            .group
            .clone()
            .or_else(|| previous.as_ref().map(|p| p.group.clone()))
            .unwrap_or_else(|| "root".to_string());
        model.files.insert(
            upload.path.clone(),
            FakeFile {
                content: upload.content.clone(),
                mode,
                owner,
                group,
            },
        );
        ok("")
    }
}

fn apply_change(model: &mut Model, words: &[String], stdin: &str) -> CommandResult {
    let args: Vec<&str> = words.iter().map(String::as_str).collect();
    match args.first().copied() {
        Some("useradd") => {
            let Some(name) = args.last().map(|s| s.to_string()) else {
                return result(2, "", "useradd: missing user\n");
            };
            if model.users.contains_key(&name) {
                return result(9, "", format!("useradd: user '{name}' already exists\n"));
            }
            let home = flag(words, "-d")
                .map(String::from)
                .unwrap_or_else(|| format!("/home/{name}"));
            let groups: Vec<String> = flag(words, "-G")
                .map(|g| g.split(',').map(String::from).collect())
                .unwrap_or_default();
            if let Some(missing) = groups.iter().find(|g| !model.groups.contains(*g)) {
                return result(6, "", format!("useradd: group '{missing}' does not exist\n"));
            }
            if args.contains(&"-m") {
                model.dirs.insert(home.clone());
            }
            model.groups.insert(name.clone());
            model.users.insert(
                name.clone(),
                FakeUser {
                    home,
                    shell: flag(words, "-s").unwrap_or("/bin/sh").to_string(),
                    primary: name,
                    groups,
                    hash: None,
                },
            );
            ok("")
        }
        Some("usermod") => {
            let Some(name) = args.last().map(|s| s.to_string()) else {
                return result(2, "", "usermod: missing user\n");
            };
            let Some(user) = model.users.get_mut(&name) else {
                return result(6, "", format!("usermod: user '{name}' does not exist\n"));
            };
            if let Some(shell) = flag(words, "-s") {
                user.shell = shell.to_string();
            }
            if let Some(groups) = flag(words, "-G") {
                for group in groups.split(',') {
                    if !user.groups.iter().any(|g| g == group) {
                        user.groups.push(group.to_string());
                    }
                }
            }
            if let Some(home) = flag(words, "-d") {
                user.home = home.to_string();
                model.dirs.insert(home.to_string());
            }
            ok("")
        }
        Some("chpasswd") => {
            for line in stdin.lines() {
                if let Some((name, hash)) = line.split_once(':') {
                    match model.users.get_mut(name) {
                        Some(user) => user.hash = Some(hash.to_string()),
                        None => return result(1, "", format!("chpasswd: unknown user {name}\n")),
                    }
                }
            }
            ok("")
        }
        Some("install") if args.get(1) == Some(&"-d") => {
            for dir in operands(words) {
                model.dirs.insert(dir.to_string());
            }
            ok("")
        }
        Some("apt-get") => match args.get(1).copied() {
            Some("update") => ok(""),
            Some("install") => {
                let Some(target) = args.last() else {
                    return result(100, "", "E: nothing to install\n");
                };
                let (name, pinned) = match target.split_once('=') {
                    Some((name, version)) => (name, Some(version)),
                    None => (*target, None),
                };
                match model.available.get(name).cloned() {
                    Some(version) => {
                        let version = pinned.map(String::from).unwrap_or(version);
                        model.installed.insert(name.to_string(), version);
                        ok("")
                    }
                    None => result(100, "", format!("E: Unable to locate package {name}\n")),
                }
            }
            _ => result(100, "", "E: invalid operation\n"),
        },
        Some("systemctl") => {
            let (Some(verb), Some(unit)) = (args.get(1), args.get(2)) else {
                return result(1, "", "systemctl: missing unit\n");
            };
            let Some(service) = model.services.get_mut(*unit) else {
                return result(5, "", format!("Unit {unit}.service not found.\n"));
            };
            match *verb {
                "start" | "restart" | "reload" => service.active = true,
                "stop" => service.active = false,
                "enable" => service.enabled = true,
                "disable" => service.enabled = false,
                _ => return result(1, "", format!("unknown verb {verb}\n")),
            }
            ok("")
        }
        Some("chmod") => match (args.get(1), operands(words).first()) {
            (Some(mode), Some(path)) => match model.files.get_mut(*path) {
                Some(file) => {
                    file.mode = octal(mode);
                    ok("")
                }
                None => no_such_file("chmod", path),
            },
            _ => result(1, "", "chmod: missing operand\n"),
        },
        Some("chown") => match (args.get(1), operands(words).first()) {
            (Some(ownership), Some(path)) => match model.files.get_mut(*path) {
                Some(file) => {
                    let (owner, group) = match ownership.split_once(':') {
                        Some((owner, group)) => (owner, Some(group)),
                        None => (*ownership, None),
                    };
                    if !owner.is_empty() {
                        file.owner = owner.to_string();
                    }
                    if let Some(group) = group {
                        file.group = group.to_string();
                    }
                    ok("")
                }
                None => no_such_file("chown", path),
            },
            _ => result(1, "", "chown: missing operand\n"),
        },
        // arbitrary shell commands succeed
        _ => ok(""),
    }
}

#[async_trait]
impl Connection for FakeHost {
    async fn run(&self, command: &RemoteCommand) -> Result<CommandResult, ConnectionError> {
        Ok(self.dispatch(command))
    }

    async fn put(&self, upload: &Upload) -> Result<CommandResult, ConnectionError> {
        Ok(self.store(upload))
    }

    fn transport(&self) -> &'static str {
        "fake"
    }
}

/// Hands out shared fake hosts by address
#[derive(Default)]
pub struct FakeConnector {
    hosts: BTreeMap<String, Arc<FakeHost>>,
    unreachable: BTreeSet<String>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, address: &str, host: FakeHost) -> Self {
        self.hosts.insert(address.to_string(), Arc::new(host));
        self
    }

    pub fn unreachable(mut self, address: &str) -> Self {
        self.unreachable.insert(address.to_string());
        self
    }

    pub fn host(&self, address: &str) -> Arc<FakeHost> {
        Arc::clone(&self.hosts[address])
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>, ConnectionError> {
        if self.unreachable.contains(&host.address) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}:{}: connection refused",
                host.address, host.port
            )));
        }
        match self.hosts.get(&host.address) {
            Some(fake) => Ok(Arc::clone(fake) as Arc<dyn Connection>),
            None => Err(ConnectionError::ConnectionFailed(format!(
                "no fake host for {}",
                host.address
            ))),
        }
    }
}
