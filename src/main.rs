use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use fleetplay::config::{default_config_dir, load_runner_config, RunnerConfig};
use fleetplay::connection::TransportConnector;
use fleetplay::error::ConfigError;
use fleetplay::inventory::{InjectedSources, InjectedVars, Inventory, Resolver, ALL_GROUP};
use fleetplay::playbook::{preflight, Playbook, RunOptions, Runner};
use fleetplay::report::{exit_code, RunReport};

#[derive(Parser)]
#[command(name = "fleetplay")]
#[command(
    about = "Idempotent remote provisioning: apply playbooks of intended state to inventory hosts over SSH"
)]
#[command(version)]
struct Cli {
    /// Configuration directory (default: /etc/fleetplay if it exists, otherwise ~/.config/fleetplay)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Variables injected at run time
#[derive(Args, Debug, Default)]
struct InjectArgs {
    /// Extra variable, repeatable
    #[arg(short = 'e', long = "extra-var", value_name = "NAME=VALUE")]
    extra_vars: Vec<String>,

    /// YAML or JSON mapping of extra variables, repeatable
    #[arg(long = "extra-vars-file", value_name = "FILE")]
    extra_vars_files: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a playbook to its hosts
    Run {
        /// Playbook file (.yml, .yaml, .json or .toml)
        playbook: PathBuf,
        /// Inventory file
        #[arg(short, long)]
        inventory: PathBuf,
        /// Only run against this group or host
        #[arg(short, long)]
        limit: Option<String>,
        /// Compute changes without applying them
        #[arg(long)]
        check: bool,
        /// Hosts processed in parallel (default from config, 5)
        #[arg(short, long)]
        forks: Option<usize>,
        /// Stop every host after the first host failure
        #[arg(long)]
        any_errors_fatal: bool,
        #[command(flatten)]
        inject: InjectArgs,
        /// Also write the run report as JSON
        #[arg(long, value_name = "FILE")]
        report_json: Option<PathBuf>,
    },
    /// Run every pre-flight check without contacting hosts
    Validate {
        playbook: PathBuf,
        #[arg(short, long)]
        inventory: PathBuf,
        #[arg(short, long)]
        limit: Option<String>,
        #[command(flatten)]
        inject: InjectArgs,
    },
    /// Print each host's resolved variables with secrets redacted
    Inventory {
        #[arg(short, long)]
        inventory: PathBuf,
        #[arg(short, long)]
        limit: Option<String>,
        /// Playbook whose vars and injected declarations are layered in
        #[arg(short, long)]
        playbook: Option<PathBuf>,
        #[command(flatten)]
        inject: InjectArgs,
    },
}

fn init_tracing(verbose: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level = match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!("fleetplay={level},russh=warn"))
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<RunnerConfig, ConfigError> {
    match default_config_dir(explicit) {
        Some(dir) => load_runner_config(&dir),
        None => Ok(RunnerConfig::default()),
    }
}

fn collect_injected(inject: &InjectArgs, config: &RunnerConfig) -> Result<InjectedVars, ConfigError> {
    let sources = InjectedSources {
        files: inject.extra_vars_files.clone(),
        env_prefix: config.env_prefix.clone(),
        pairs: inject.extra_vars.clone(),
    };
    InjectedVars::collect(&sources, std::env::vars())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            exit_code::CONFIG_ERROR
        }
    };
    std::process::exit(code);
}

/// Errors returned from here happen before any host is contacted
async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            playbook,
            inventory,
            limit,
            check,
            forks,
            any_errors_fatal,
            inject,
            report_json,
        } => {
            let playbook = Playbook::load(&playbook)?;
            let inventory = Inventory::load(&inventory)?;
            let injected = collect_injected(&inject, &config)?;
            let checked = preflight(
                &playbook,
                &inventory,
                injected,
                config.plaintext_credentials,
                limit.as_deref(),
            )?;

            let forks = forks.unwrap_or(config.forks);
            if forks == 0 {
                return Err(ConfigError::Invalid("--forks must be at least 1".to_string()).into());
            }
            let options = RunOptions {
                check_mode: check,
                limit,
                forks,
                any_errors_fatal: any_errors_fatal || config.any_errors_fatal,
            };

            let connector = Arc::new(TransportConnector::new(config.connection_settings()));
            let runner = Runner::new(
                Arc::new(playbook),
                Arc::new(inventory),
                checked,
                connector,
                options,
            );

            let cancel = runner.cancel_flag();
            tokio::spawn(async move {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if cancel.swap(true, Ordering::SeqCst) {
                        warn!("second interrupt received, exiting immediately");
                        eprintln!("interrupted again: exiting without waiting");
                        std::process::exit(exit_code::INTERRUPTED);
                    }
                    warn!("interrupt received, letting in-flight operations finish");
                    println!("interrupted: no new tasks will be started; interrupt again to exit now");
                }
            });

            let report = runner.run().await;
            report.print_summary();
            if let Some(path) = report_json {
                if let Err(err) = write_report(&report, &path) {
                    error!("{err:#}");
                    eprintln!("error: {err:#}");
                }
            }
            Ok(report.exit_code())
        }

        Commands::Validate {
            playbook,
            inventory,
            limit,
            inject,
        } => {
            let playbook = Playbook::load(&playbook)?;
            let inventory = Inventory::load(&inventory)?;
            let injected = collect_injected(&inject, &config)?;
            let checked = preflight(
                &playbook,
                &inventory,
                injected,
                config.plaintext_credentials,
                limit.as_deref(),
            )?;
            let tasks: usize = playbook.plays.iter().map(|p| p.tasks.len()).sum();
            println!(
                "{}: {} plays, {} tasks, {} hosts OK",
                playbook.name,
                playbook.plays.len(),
                tasks,
                checked.hosts.len()
            );
            Ok(exit_code::SUCCESS)
        }

        Commands::Inventory {
            inventory,
            limit,
            playbook,
            inject,
        } => {
            let inventory = Inventory::load(&inventory)?;
            let playbook = playbook.as_deref().map(Playbook::load).transpose()?;
            let mut injected = collect_injected(&inject, &config)?;
            let no_vars = BTreeMap::new();
            let no_decls = BTreeMap::new();
            let (defaults, declarations) = match &playbook {
                Some(p) => (&p.vars, &p.injected),
                None => (&no_vars, &no_decls),
            };
            injected.validate(declarations)?;

            let resolver =
                Resolver::new(&inventory, defaults, &injected, config.plaintext_credentials);
            resolver.check_credentials()?;

            let mut shown = BTreeMap::new();
            for host in inventory.select(ALL_GROUP, limit.as_deref())? {
                let vars = resolver.resolve(host)?;
                shown.insert(host.address.clone(), vars.redacted());
            }
            print!(
                "{}",
                serde_yaml::to_string(&shown).context("failed to format variables")?
            );
            Ok(exit_code::SUCCESS)
        }
    }
}

fn write_report(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = report.to_json().context("failed to serialize report")?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write report to {}", path.display()))
}
