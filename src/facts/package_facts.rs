//! Installed package facts
//!
//! Debian family hosts are queried through `dpkg-query`, RPM hosts through
//! `rpm -q`. A package in `config-files` state counts as not installed.

use crate::apply::{PackageManager, PackageTask};
use crate::connection::HostSession;
use crate::error::FactError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageFacts {
    pub installed_version: Option<String>,
}

/// Parse `dpkg-query -f '${Status}|${Version}'` output
pub(crate) fn parse_dpkg_status(output: &str) -> Option<String> {
    let (status, version) = output.trim().split_once('|')?;
    if status.ends_with(" installed") && !version.is_empty() {
        Some(version.to_string())
    } else {
        None
    }
}

pub(super) async fn gather(
    session: &HostSession,
    task: &PackageTask,
) -> Result<PackageFacts, FactError> {
    let name = task.package.as_str();
    let result = match task.manager {
        PackageManager::Apt => {
            session
                .probe("package", &["dpkg-query", "-W", "-f=${Status}|${Version}", name])
                .await?
        }
        PackageManager::Dnf | PackageManager::Yum => {
            session
                .probe("package", &["rpm", "-q", "--queryformat", "%{VERSION}-%{RELEASE}", name])
                .await?
        }
    };

    // both tools exit 1 for an unknown or absent package
    let installed_version = match (result.status, task.manager) {
        (0, PackageManager::Apt) => parse_dpkg_status(&result.stdout),
        (0, _) => Some(result.stdout.trim().to_string()).filter(|v| !v.is_empty()),
        (1, _) => None,
        (status, _) => {
            return Err(FactError::Unexpected {
                command: format!("query package {name}"),
                status,
                stderr: result.stderr.trim().to_string(),
            })
        }
    };

    Ok(PackageFacts { installed_version })
}
