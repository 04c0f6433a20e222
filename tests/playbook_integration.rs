//! End-to-end playbook runs against in-memory hosts

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_yaml::Value;
use tempfile::TempDir;

use common::{FakeConnector, FakeHost};
use fleetplay::config::CredentialPolicy;
use fleetplay::error::ConfigError;
use fleetplay::inventory::{InjectedVars, Inventory};
use fleetplay::playbook::{preflight, HostState, Playbook, RunOptions, Runner};
use fleetplay::report::{exit_code, RunReport, TaskOutcome};

const ACCOUNTS: &str = "203.0.113.10";
const APP: &str = "203.0.113.20";

const SECRET: &str = "s3cr3t-value-123";
const HASH: &str = "$6$rounds=5000$saltsalt$Zq0AbCdEfGhIjKlMnOpQrStUvWxYz";
const DEPLOY_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ci@deploy";

const INVENTORY: &str = r#"
defaults:
  connection: local
hosts:
  203.0.113.10: {}
  203.0.113.20:
    vars:
      app_port: 3000
groups:
  accounts:
    hosts: [203.0.113.10]
    vars:
      deploy_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl ci@deploy"
  app:
    hosts: [203.0.113.20]
"#;

const PLAYBOOK: &str = r#"
name: provision
vars:
  app_port: 8080
required_vars: [app_port]
injected:
  accounts: { shape: accounts }
  app_secret: { shape: string, secret: true }
plays:
  - name: Accounts
    hosts: accounts
    become: true
    tasks:
      - name: Create developer accounts
        type: user
        user: "{{ item.name }}"
        shell: "{{ item.shell | default('/bin/bash') }}"
        groups: "{{ item.groups | default([]) }}"
        password: "{{ item.password | default(none) }}"
        loop: accounts
      - name: Authorize deploy key
        type: authorized_key
        user: "{{ item.name }}"
        key: "{{ deploy_key }}"
        loop: accounts
  - name: App
    hosts: app
    become: true
    tasks:
      - name: Install nginx
        type: package
        package: nginx
        update_cache: true
        notify: reload nginx
      - name: Write app env
        type: template
        src: templates/app.env.j2
        dest: /srv/app/.env
        mode: "0600"
        owner: nodeapp
        notify: restart app
      - name: Site config
        type: template
        content: "server { listen 80; location / { proxy_pass http://127.0.0.1:{{ app_port }}; } }\n"
        dest: /etc/nginx/sites-available/app
        notify: reload nginx
      - name: nginx running
        type: service
        service: nginx
        enabled: true
    handlers:
      - name: reload nginx
        type: service
        service: nginx
        state: reloaded
      - name: restart app
        type: command
        cmd: pm2 restart all
        chdir: /srv/app
"#;

const APP_ENV: &str = "NODE_ENV=production\nPORT={{ app_port }}\nAPP_SECRET={{ app_secret }}\n";

struct Fixture {
    _dir: TempDir,
    playbook: Playbook,
    inventory: Inventory,
}

fn fixture(playbook: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("templates")).unwrap();
    std::fs::write(dir.path().join("templates/app.env.j2"), APP_ENV).unwrap();
    let path = dir.path().join("playbook.yml");
    std::fs::write(&path, playbook).unwrap();
    Fixture {
        playbook: Playbook::load(&path).unwrap(),
        inventory: Inventory::from_yaml(INVENTORY, Path::new("inventory.yml")).unwrap(),
        _dir: dir,
    }
}

fn injected() -> InjectedVars {
    let mut values = BTreeMap::new();
    values.insert(
        "accounts".to_string(),
        serde_yaml::from_str::<Value>(&format!(
            "[{{name: dev1, groups: [sudo]}}, {{name: dev2, password: '{HASH}'}}, {{name: dev3, shell: /bin/zsh, groups: [docker, sudo]}}]"
        ))
        .unwrap(),
    );
    values.insert("app_secret".to_string(), Value::String(SECRET.to_string()));
    InjectedVars::from_values(values)
}

fn hosts() -> FakeConnector {
    FakeConnector::new()
        .with_host(ACCOUNTS, FakeHost::new().with_group("docker"))
        .with_host(
            APP,
            FakeHost::new()
                .with_user("nodeapp", &[])
                .with_dir("/srv/app")
                .with_dir("/etc/nginx/sites-available")
                .with_available("nginx", "1.18.0-6ubuntu14.4")
                .with_service("nginx", false, false),
        )
}

async fn run(
    fixture: &Fixture,
    connector: Arc<FakeConnector>,
    injected: InjectedVars,
    options: RunOptions,
) -> RunReport {
    let checked = preflight(
        &fixture.playbook,
        &fixture.inventory,
        injected,
        CredentialPolicy::Reject,
        options.limit.as_deref(),
    )
    .unwrap();
    Runner::new(
        Arc::new(fixture.playbook.clone()),
        Arc::new(fixture.inventory.clone()),
        checked,
        connector,
        options,
    )
    .run()
    .await
}

fn outcomes(report: &RunReport, host: &str, task: &str) -> Vec<TaskOutcome> {
    report
        .host(host)
        .unwrap()
        .records_for(task)
        .map(|r| r.outcome)
        .collect()
}

#[tokio::test]
async fn test_provision_then_converge() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(hosts());

    let first = run(&fixture, connector.clone(), injected(), RunOptions::default()).await;
    assert_eq!(first.exit_code(), exit_code::SUCCESS);
    for host in &first.hosts {
        assert_eq!(host.state, HostState::Done, "{host:?}");
    }
    assert_eq!(
        outcomes(&first, ACCOUNTS, "Create developer accounts"),
        vec![TaskOutcome::Changed; 3]
    );
    assert_eq!(
        outcomes(&first, ACCOUNTS, "Authorize deploy key"),
        vec![TaskOutcome::Changed; 3]
    );
    assert_eq!(outcomes(&first, APP, "reload nginx"), vec![TaskOutcome::Changed]);
    assert_eq!(outcomes(&first, APP, "restart app"), vec![TaskOutcome::Changed]);

    let accounts = connector.host(ACCOUNTS);
    let dev1 = accounts.user("dev1").unwrap();
    assert_eq!(dev1.shell, "/bin/bash");
    assert_eq!(dev1.groups, vec!["sudo"]);
    assert_eq!(accounts.user("dev2").unwrap().hash.as_deref(), Some(HASH));
    let dev3 = accounts.user("dev3").unwrap();
    assert_eq!(dev3.shell, "/bin/zsh");
    assert_eq!(dev3.groups, vec!["docker", "sudo"]);
    assert!(accounts.file("/home/dev3/.ssh/authorized_keys").is_some());
    let keys = accounts.file("/home/dev1/.ssh/authorized_keys").unwrap();
    assert_eq!(keys.text(), format!("{DEPLOY_KEY}\n"));
    assert_eq!(keys.mode, "600");
    assert_eq!(keys.owner, "dev1");

    let app = connector.host(APP);
    assert_eq!(app.package("nginx").as_deref(), Some("1.18.0-6ubuntu14.4"));
    let env = app.file("/srv/app/.env").unwrap();
    assert_eq!(
        env.text(),
        format!("NODE_ENV=production\nPORT=3000\nAPP_SECRET={SECRET}\n")
    );
    assert_eq!(env.mode, "600");
    assert_eq!(env.owner, "nodeapp");
    assert!(app
        .file("/etc/nginx/sites-available/app")
        .unwrap()
        .text()
        .contains("127.0.0.1:3000"));
    let nginx = app.service("nginx").unwrap();
    assert!(nginx.active && nginx.enabled);

    let second = run(&fixture, connector.clone(), injected(), RunOptions::default()).await;
    assert_eq!(second.exit_code(), exit_code::SUCCESS);
    assert_eq!(second.stats.changed, 0, "{:#?}", second.hosts);
    assert_eq!(second.stats.failed, 0);
    assert!(outcomes(&second, APP, "reload nginx").is_empty());
    assert!(outcomes(&second, APP, "restart app").is_empty());
    for host in &second.hosts {
        assert_eq!(host.state, HostState::Done);
    }
}

#[tokio::test]
async fn test_secrets_stay_out_of_report() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(hosts());
    let report = run(&fixture, connector, injected(), RunOptions::default()).await;
    let json = report.to_json().unwrap();
    assert!(!json.contains(SECRET));
    assert!(!json.contains(HASH));
}

#[tokio::test]
async fn test_account_shape_error_does_not_echo_password() {
    let fixture = fixture(PLAYBOOK);
    let mut values = BTreeMap::new();
    values.insert(
        "accounts".to_string(),
        serde_yaml::from_str::<Value>("[{name: dev1, password: 98765432}]").unwrap(),
    );
    values.insert("app_secret".to_string(), Value::String(SECRET.to_string()));
    let err = preflight(
        &fixture.playbook,
        &fixture.inventory,
        InjectedVars::from_values(values),
        CredentialPolicy::Reject,
        None,
    )
    .unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, ConfigError::InvalidInjected { .. }), "{msg}");
    assert!(msg.contains("accounts[0].password"), "{msg}");
    assert!(!msg.contains("98765432"), "{msg}");
}

#[tokio::test]
async fn test_credential_named_injected_value_is_redacted() {
    let playbook = r#"
name: deploy
plays:
  - name: App
    hosts: app
    tasks:
      - name: Migrate
        type: command
        cmd: "migrate --db-password {{ db_password }}"
"#;
    let fixture = fixture(playbook);
    let connector = Arc::new(
        FakeConnector::new().with_host(APP, FakeHost::new().failing("migrate")),
    );
    let mut values = BTreeMap::new();
    values.insert(
        "db_password".to_string(),
        Value::String("Sup3rS3cretPw".to_string()),
    );
    let report = run(
        &fixture,
        connector.clone(),
        InjectedVars::from_values(values),
        RunOptions::default(),
    )
    .await;

    assert_eq!(report.exit_code(), exit_code::HOST_FAILED);
    let record = report.host(APP).unwrap().records_for("Migrate").next().unwrap().clone();
    let reason = record.reason.unwrap();
    assert!(reason.contains("--db-password ********"), "{reason}");
    assert!(!report.to_json().unwrap().contains("Sup3rS3cretPw"));
    // the host itself still received the real value
    assert_eq!(
        connector.host(APP).commands(),
        vec!["migrate --db-password Sup3rS3cretPw".to_string()]
    );
}

#[tokio::test]
async fn test_handler_runs_once_for_many_notifications() {
    let playbook = r#"
name: handlers
plays:
  - name: App
    hosts: app
    tasks:
      - { name: one, type: template, content: "a\n", dest: /srv/app/a.conf, notify: restart app }
      - { name: two, type: template, content: "b\n", dest: /srv/app/b.conf, notify: restart app }
      - { name: three, type: notify, handlers: [restart app] }
    handlers:
      - name: restart app
        type: command
        cmd: pm2 restart all
"#;
    let fixture = fixture(playbook);
    let connector = Arc::new(hosts());
    let report = run(&fixture, connector.clone(), InjectedVars::default(), RunOptions::default()).await;

    assert_eq!(report.exit_code(), exit_code::SUCCESS);
    assert_eq!(outcomes(&report, APP, "restart app"), vec![TaskOutcome::Changed]);
    let restarts = connector
        .host(APP)
        .changes()
        .iter()
        .filter(|c| c.as_str() == "pm2 restart all")
        .count();
    assert_eq!(restarts, 1);
    let records = &report.host(APP).unwrap().tasks;
    assert!(records.last().unwrap().handler);
}

#[tokio::test]
async fn test_unchanged_task_does_not_notify() {
    let playbook = r#"
name: handlers
plays:
  - name: App
    hosts: app
    tasks:
      - { name: conf, type: template, content: "same\n", dest: /srv/app/a.conf, notify: restart app }
    handlers:
      - { name: restart app, type: command, cmd: pm2 restart all }
"#;
    let fixture = fixture(playbook);
    let connector = Arc::new(FakeConnector::new().with_host(
        APP,
        FakeHost::new().with_file("/srv/app/a.conf", "same\n", "0644", "root"),
    ));
    let report = run(&fixture, connector.clone(), InjectedVars::default(), RunOptions::default()).await;
    assert_eq!(outcomes(&report, APP, "conf"), vec![TaskOutcome::Unchanged]);
    assert!(outcomes(&report, APP, "restart app").is_empty());
    assert!(connector.host(APP).changes().is_empty());
}

#[tokio::test]
async fn test_missing_injected_variable_fails_preflight() {
    let fixture = fixture(PLAYBOOK);
    let mut values = BTreeMap::new();
    values.insert(
        "accounts".to_string(),
        serde_yaml::from_str::<Value>("[{name: dev1}]").unwrap(),
    );
    let err = preflight(
        &fixture.playbook,
        &fixture.inventory,
        InjectedVars::from_values(values),
        CredentialPolicy::Reject,
        None,
    )
    .unwrap_err();
    assert!(
        matches!(&err, ConfigError::MissingVariable { name, .. } if name == "app_secret"),
        "{err}"
    );
}

#[tokio::test]
async fn test_failure_stops_only_that_host() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(
        FakeConnector::new()
            .with_host(ACCOUNTS, FakeHost::new())
            .with_host(APP, FakeHost::new().with_dir("/srv/app")),
    );
    let report = run(&fixture, connector.clone(), injected(), RunOptions::default()).await;

    assert_eq!(report.exit_code(), exit_code::HOST_FAILED);
    assert_eq!(report.host(ACCOUNTS).unwrap().state, HostState::Done);

    let app = report.host(APP).unwrap();
    assert_eq!(app.state, HostState::Failed);
    let install = app.records_for("Install nginx").next().unwrap();
    assert_eq!(install.outcome, TaskOutcome::Failed);
    assert!(install.reason.as_deref().unwrap().contains("Unable to locate package"));
    for task in ["Write app env", "Site config", "nginx running"] {
        let record = app.records_for(task).next().unwrap();
        assert_eq!(record.outcome, TaskOutcome::Skipped);
        assert_eq!(record.reason.as_deref(), Some("host failed earlier in the run"));
    }
    assert!(connector.host(APP).file("/srv/app/.env").is_none());
}

#[tokio::test]
async fn test_ignored_failure_continues() {
    let playbook = r#"
name: tolerant
plays:
  - name: App
    hosts: app
    tasks:
      - name: Optional tooling
        type: package
        package: htop
        ignore_errors: true
      - name: Marker
        type: template
        content: "ok\n"
        dest: /srv/app/marker
"#;
    let fixture = fixture(playbook);
    let connector = Arc::new(hosts());
    let report = run(&fixture, connector.clone(), InjectedVars::default(), RunOptions::default()).await;

    assert_eq!(report.exit_code(), exit_code::SUCCESS);
    let app = report.host(APP).unwrap();
    assert_eq!(app.state, HostState::Done);
    let failed = app.records_for("Optional tooling").next().unwrap();
    assert_eq!(failed.outcome, TaskOutcome::Failed);
    assert!(failed.ignored);
    assert_eq!(outcomes(&report, APP, "Marker"), vec![TaskOutcome::Changed]);
    assert!(connector.host(APP).file("/srv/app/marker").is_some());
}

#[tokio::test]
async fn test_undefined_template_variable_writes_nothing() {
    let playbook = r#"
name: broken
plays:
  - name: App
    hosts: app
    tasks:
      - name: Env
        type: template
        content: "TOKEN={{ api_token }}\n"
        dest: /srv/app/.env
"#;
    let fixture = fixture(playbook);
    let connector = Arc::new(hosts());
    let report = run(&fixture, connector.clone(), InjectedVars::default(), RunOptions::default()).await;

    assert_eq!(report.exit_code(), exit_code::HOST_FAILED);
    let record = report.host(APP).unwrap().records_for("Env").next().unwrap().clone();
    assert_eq!(record.outcome, TaskOutcome::Failed);
    assert!(record.reason.unwrap().contains("undefined"));
    assert!(connector.host(APP).file("/srv/app/.env").is_none());
    assert!(connector.host(APP).changes().is_empty());
}

#[tokio::test]
async fn test_present_key_is_not_duplicated() {
    let playbook = r#"
name: keys
plays:
  - name: Accounts
    hosts: accounts
    tasks:
      - name: Authorize deploy key
        type: authorized_key
        user: dev1
        key: "{{ deploy_key }}"
"#;
    let fixture = fixture(playbook);
    let existing = format!("ssh-rsa AAAAB3NzaC1yc2E old@laptop\n{DEPLOY_KEY}  \n");
    let connector = Arc::new(FakeConnector::new().with_host(
        ACCOUNTS,
        FakeHost::new()
            .with_user("dev1", &[])
            .with_dir("/home/dev1/.ssh")
            .with_file("/home/dev1/.ssh/authorized_keys", &existing, "0600", "dev1"),
    ));
    let report = run(&fixture, connector.clone(), InjectedVars::default(), RunOptions::default()).await;

    assert_eq!(outcomes(&report, ACCOUNTS, "Authorize deploy key"), vec![TaskOutcome::Unchanged]);
    let text = connector
        .host(ACCOUNTS)
        .file("/home/dev1/.ssh/authorized_keys")
        .unwrap()
        .text();
    assert_eq!(text.matches("ci@deploy").count(), 1);
}

#[tokio::test]
async fn test_check_mode_changes_nothing() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(hosts());
    let options = RunOptions {
        check_mode: true,
        limit: Some("app".to_string()),
        ..RunOptions::default()
    };
    let report = run(&fixture, connector.clone(), injected(), options).await;

    assert_eq!(report.exit_code(), exit_code::SUCCESS);
    assert!(report.check_mode);
    assert!(report.host(ACCOUNTS).is_none());
    assert_eq!(outcomes(&report, APP, "Install nginx"), vec![TaskOutcome::Changed]);
    assert_eq!(outcomes(&report, APP, "reload nginx"), vec![TaskOutcome::Changed]);
    assert!(connector.host(APP).changes().is_empty());
}

#[tokio::test]
async fn test_unreachable_host_fails_alone() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(hosts().unreachable(ACCOUNTS));
    let report = run(&fixture, connector, injected(), RunOptions::default()).await;

    assert_eq!(report.exit_code(), exit_code::HOST_FAILED);
    let accounts = report.host(ACCOUNTS).unwrap();
    assert_eq!(accounts.state, HostState::Failed);
    assert_eq!(accounts.tasks[0].task, "connect");
    assert!(accounts.tasks[1..]
        .iter()
        .all(|r| r.outcome == TaskOutcome::Skipped));
    assert_eq!(report.host(APP).unwrap().state, HostState::Done);
}

#[tokio::test]
async fn test_cancelled_run_starts_no_task() {
    let fixture = fixture(PLAYBOOK);
    let connector = Arc::new(hosts());
    let checked = preflight(
        &fixture.playbook,
        &fixture.inventory,
        injected(),
        CredentialPolicy::Reject,
        None,
    )
    .unwrap();
    let runner = Runner::new(
        Arc::new(fixture.playbook.clone()),
        Arc::new(fixture.inventory.clone()),
        checked,
        connector.clone(),
        RunOptions::default(),
    );
    runner.cancel_flag().store(true, Ordering::SeqCst);
    let report = runner.run().await;

    assert!(report.interrupted);
    assert_eq!(report.exit_code(), exit_code::INTERRUPTED);
    assert_eq!(report.stats.skipped, report.hosts.iter().map(|h| h.tasks.len()).sum::<usize>());
    assert!(connector.host(APP).commands().is_empty());
}

#[tokio::test]
async fn test_limit_matching_nothing_is_rejected() {
    let playbook = r#"
name: app only
plays:
  - { name: App, hosts: app, tasks: [{ type: command, cmd: uptime }] }
"#;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("playbook.yml");
    std::fs::write(&path, playbook).unwrap();
    let playbook = Playbook::load(&path).unwrap();
    let inventory = Inventory::from_yaml(INVENTORY, Path::new("inventory.yml")).unwrap();
    let err = preflight(
        &playbook,
        &inventory,
        InjectedVars::default(),
        CredentialPolicy::Reject,
        Some(ACCOUNTS),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    assert!(err.to_string().contains("matches no host"));
}
